//! Network staleness guard.
//!
//! Every wallet connection (and every network switch) gets a fresh
//! [`SessionKey`]. Work that suspends on the chain captures the key before it
//! starts and checks it again before touching shared state; a mismatch means
//! the result belongs to a network the user has left and must be dropped.

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub chain_id: u64,
    pub epoch: u64,
}

#[derive(Debug)]
pub struct SessionTracker {
    tx: watch::Sender<Option<SessionKey>>,
    epoch: u64,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx, epoch: 0 }
    }

    /// Starts a new session on `chain_id`, invalidating any previous one.
    pub fn connect(&mut self, chain_id: u64) -> SessionKey {
        self.epoch += 1;
        let key = SessionKey {
            chain_id,
            epoch: self.epoch,
        };
        self.tx.send_replace(Some(key));
        key
    }

    pub fn disconnect(&mut self) {
        self.epoch += 1;
        self.tx.send_replace(None);
    }

    pub fn current(&self) -> Option<SessionKey> {
        *self.tx.borrow()
    }

    pub fn watcher(&self) -> SessionWatcher {
        SessionWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the active session, cheap to clone into tasks.
#[derive(Clone, Debug)]
pub struct SessionWatcher {
    rx: watch::Receiver<Option<SessionKey>>,
}

impl SessionWatcher {
    pub fn current(&self) -> Option<SessionKey> {
        *self.rx.borrow()
    }

    pub fn is_current(&self, key: SessionKey) -> bool {
        self.current() == Some(key)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn is_current__false_after_network_switch() {
        // given
        let mut tracker = SessionTracker::new();
        let watcher = tracker.watcher();
        let on_a = tracker.connect(1);

        // when
        let on_b = tracker.connect(11155111);

        // then
        assert!(!watcher.is_current(on_a));
        assert!(watcher.is_current(on_b));
    }

    #[test]
    fn is_current__reconnecting_to_same_chain_yields_new_key() {
        let mut tracker = SessionTracker::new();
        let watcher = tracker.watcher();
        let first = tracker.connect(1337);
        tracker.disconnect();
        assert_eq!(watcher.current(), None);

        let second = tracker.connect(1337);

        assert_ne!(first, second);
        assert!(!watcher.is_current(first));
    }
}
