//! Refresh coordination.
//!
//! [`RefreshCoordinator`] is the pure `Idle`/`Refreshing` state machine that
//! decides when a refresh may start. [`SyncWorker`] drives it: it owns the
//! read cache, the refresh timer, the contract event subscription and the one
//! refresh task that may be in flight, and tears all of them down together
//! when the connection goes away.

use crate::{
    cache::{
        FetchedTeams,
        ReadCache,
        fetch_teams,
    },
    chain::{
        ChainClient,
        Connection,
        Subscription,
    },
    error::{
        ChainError,
        FetchError,
    },
    session::SessionKey,
    types::{
        ContractEvent,
        ContractEventKind,
        RefreshTicket,
        TeamSnapshot,
        TriggerSource,
    },
};
use std::{
    future::pending,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    task::{
        AbortHandle,
        JoinHandle,
    },
    time::{
        self,
        Instant,
        Interval,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};


#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshState {
    #[default]
    Idle,
    Refreshing {
        ticket: RefreshTicket,
        /// Latest trigger that arrived while this refresh was running.
        trailing: Option<TriggerSource>,
    },
}

/// Single-flight gate for refreshes.
///
/// Every trigger bumps the ticket counter. Triggers arriving while a refresh
/// runs collapse into at most one trailing refresh.
#[derive(Debug, Default)]
pub struct RefreshCoordinator {
    counter: RefreshTicket,
    state: RefreshState,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RefreshState {
        self.state
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self.state, RefreshState::Refreshing { .. })
    }

    /// Current value of the trigger counter.
    pub fn counter(&self) -> RefreshTicket {
        self.counter
    }

    /// Returns the ticket of a refresh to start now, or `None` if the trigger
    /// was folded into the one in flight.
    pub fn on_trigger(&mut self, source: TriggerSource) -> Option<RefreshTicket> {
        self.counter = self.counter.next();
        match &mut self.state {
            RefreshState::Idle => {
                self.state = RefreshState::Refreshing {
                    ticket: self.counter,
                    trailing: None,
                };
                Some(self.counter)
            }
            RefreshState::Refreshing { trailing, .. } => {
                *trailing = Some(source);
                None
            }
        }
    }

    /// Marks the refresh for `ticket` as done, successful or not. Returns the
    /// trailing refresh to start, if one was requested meanwhile.
    pub fn on_refresh_finished(
        &mut self,
        ticket: RefreshTicket,
    ) -> Option<(RefreshTicket, TriggerSource)> {
        let RefreshState::Refreshing {
            ticket: running,
            trailing,
        } = self.state
        else {
            return None;
        };
        if running != ticket {
            return None;
        }
        match trailing {
            Some(source) => {
                self.counter = self.counter.next();
                self.state = RefreshState::Refreshing {
                    ticket: self.counter,
                    trailing: None,
                };
                Some((self.counter, source))
            }
            None => {
                self.state = RefreshState::Idle;
                None
            }
        }
    }

    /// Forgets the in-flight refresh. The counter keeps counting.
    pub fn reset(&mut self) {
        self.state = RefreshState::Idle;
    }
}

/// A refresh request, optionally scoped to the session it was raised in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub source: TriggerSource,
    pub session: Option<SessionKey>,
}

/// Sending side for refresh requests; handed to the submitter and the UI.
#[derive(Clone, Debug)]
pub struct RefreshHandle {
    tx: mpsc::UnboundedSender<Trigger>,
}

impl RefreshHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Trigger>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn trigger(&self, source: TriggerSource) -> bool {
        self.tx
            .send(Trigger {
                source,
                session: None,
            })
            .is_ok()
    }

    /// Like [`RefreshHandle::trigger`], but ignored unless `session` is still
    /// the active one when the worker sees it.
    pub fn trigger_for(&self, session: SessionKey, source: TriggerSource) -> bool {
        self.tx
            .send(Trigger {
                source,
                session: Some(session),
            })
            .is_ok()
    }
}

pub enum SyncWorkerCommand<C> {
    Connect(Connection<C>),
    Disconnect,
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncWorkerEvent {
    Connected {
        session: SessionKey,
        contract_resolved: bool,
    },
    Disconnected,
    RefreshStarted {
        ticket: RefreshTicket,
        source: TriggerSource,
    },
    RefreshFinished {
        ticket: RefreshTicket,
        result: Result<(), FetchError>,
    },
    SubscriptionFailed(ChainError),
}

/// Handle used by the app to talk to a running [`SyncWorker`].
pub struct SyncHandle<C> {
    commands: mpsc::UnboundedSender<SyncWorkerCommand<C>>,
    refresh: RefreshHandle,
    snapshots: watch::Receiver<Arc<TeamSnapshot>>,
}

impl<C> Clone for SyncHandle<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            refresh: self.refresh.clone(),
            snapshots: self.snapshots.clone(),
        }
    }
}

impl<C> SyncHandle<C> {
    pub fn connect(&self, connection: Connection<C>) -> bool {
        self.commands
            .send(SyncWorkerCommand::Connect(connection))
            .is_ok()
    }

    pub fn disconnect(&self) -> bool {
        self.commands.send(SyncWorkerCommand::Disconnect).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.commands.send(SyncWorkerCommand::Shutdown).is_ok()
    }

    pub fn refresh(&self) -> &RefreshHandle {
        &self.refresh
    }

    pub fn snapshots(&self) -> watch::Receiver<Arc<TeamSnapshot>> {
        self.snapshots.clone()
    }
}

struct RefreshDone {
    session: SessionKey,
    ticket: RefreshTicket,
    result: Result<FetchedTeams, FetchError>,
}

/// Aborts the wrapped task when dropped.
/// Sends the outcome of one refresh task. A task that unwinds or is dropped
/// before finishing reports [`FetchError::Aborted`] so the coordinator can
/// leave `Refreshing`.
struct DoneReport {
    done: mpsc::UnboundedSender<RefreshDone>,
    session: SessionKey,
    ticket: RefreshTicket,
    sent: bool,
}

impl DoneReport {
    fn send(mut self, result: Result<FetchedTeams, FetchError>) {
        self.sent = true;
        let _ = self.done.send(RefreshDone {
            session: self.session,
            ticket: self.ticket,
            result,
        });
    }
}

impl Drop for DoneReport {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.done.send(RefreshDone {
                session: self.session,
                ticket: self.ticket,
                result: Err(FetchError::Aborted),
            });
        }
    }
}

struct TaskGuard(AbortHandle);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ActiveConnection<C> {
    connection: Connection<C>,
    timer: Option<Interval>,
    contract_events: mpsc::UnboundedReceiver<ContractEvent>,
    _subscription: Option<Subscription>,
    in_flight: Option<TaskGuard>,
}

enum ActiveSignal {
    Tick,
    ContractEvent(ContractEvent),
}

pub struct SyncWorker<C> {
    cache: ReadCache,
    coordinator: RefreshCoordinator,
    refresh_interval: Duration,
    commands: mpsc::UnboundedReceiver<SyncWorkerCommand<C>>,
    triggers: mpsc::UnboundedReceiver<Trigger>,
    events: mpsc::UnboundedSender<SyncWorkerEvent>,
    done_tx: mpsc::UnboundedSender<RefreshDone>,
    done_rx: mpsc::UnboundedReceiver<RefreshDone>,
    active: Option<ActiveConnection<C>>,
}

impl<C: ChainClient> SyncWorker<C> {
    pub fn new(
        cache: ReadCache,
        refresh_interval: Duration,
    ) -> (Self, SyncHandle<C>, mpsc::UnboundedReceiver<SyncWorkerEvent>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (refresh, triggers) = RefreshHandle::channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let handle = SyncHandle {
            commands: command_tx,
            refresh,
            snapshots: cache.subscribe(),
        };
        let worker = Self {
            cache,
            coordinator: RefreshCoordinator::new(),
            refresh_interval,
            commands,
            triggers,
            events,
            done_tx,
            done_rx,
            active: None,
        };
        (worker, handle, event_rx)
    }

    /// Builds a worker and runs it on its own task.
    pub fn spawn(
        cache: ReadCache,
        refresh_interval: Duration,
    ) -> (
        SyncHandle<C>,
        mpsc::UnboundedReceiver<SyncWorkerEvent>,
        JoinHandle<()>,
    ) {
        let (worker, handle, events) = Self::new(cache, refresh_interval);
        let task = tokio::spawn(worker.run());
        (handle, events, task)
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    match cmd {
                        SyncWorkerCommand::Connect(connection) => self.connect(connection),
                        SyncWorkerCommand::Disconnect => self.disconnect(),
                        SyncWorkerCommand::Shutdown => break,
                    }
                }
                Some(trigger) = self.triggers.recv() => self.on_trigger(trigger),
                Some(done) = self.done_rx.recv() => self.on_refresh_done(done),
                signal = next_signal(&mut self.active) => match signal {
                    ActiveSignal::Tick => self.on_trigger(Trigger {
                        source: TriggerSource::Timer,
                        session: None,
                    }),
                    ActiveSignal::ContractEvent(event) => {
                        debug!(kind = ?event.kind, block = ?event.block_number, "contract event");
                        self.on_trigger(Trigger {
                            source: TriggerSource::Event(event.kind),
                            session: None,
                        });
                    }
                },
            }
        }
        self.disconnect();
        debug!("sync worker stopped");
    }

    fn connect(&mut self, connection: Connection<C>) {
        if self.active.is_some() {
            self.disconnect();
        }
        let session = connection.key;
        let contract_resolved = connection.client.contract_address().is_some();
        let (sink, contract_events) = mpsc::unbounded_channel();

        let (timer, subscription) = if contract_resolved {
            let subscription =
                match connection.client.subscribe(&ContractEventKind::WATCHED, sink) {
                    Ok(subscription) => {
                        info!(chain_id = session.chain_id, "subscribed to contract events");
                        Some(subscription)
                    }
                    Err(err) => {
                        warn!(chain_id = session.chain_id, "event subscription failed: {err}");
                        self.emit(SyncWorkerEvent::SubscriptionFailed(err));
                        None
                    }
                };
            let mut timer =
                time::interval_at(Instant::now() + self.refresh_interval, self.refresh_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            (Some(timer), subscription)
        } else {
            warn!(
                chain_id = session.chain_id,
                "no Lottery deployment on this network; background refresh disabled"
            );
            (None, None)
        };

        self.active = Some(ActiveConnection {
            connection,
            timer,
            contract_events,
            _subscription: subscription,
            in_flight: None,
        });
        self.emit(SyncWorkerEvent::Connected {
            session,
            contract_resolved,
        });
        self.on_trigger(Trigger {
            source: TriggerSource::Mount,
            session: Some(session),
        });
    }

    fn disconnect(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        info!(
            chain_id = active.connection.key.chain_id,
            "disconnecting; stopping timer, subscription and in-flight refresh"
        );
        drop(active);
        self.coordinator.reset();
        self.cache.clear();
        self.emit(SyncWorkerEvent::Disconnected);
    }

    fn on_trigger(&mut self, trigger: Trigger) {
        let Some(active) = &self.active else {
            debug!(source = ?trigger.source, "ignoring trigger while disconnected");
            return;
        };
        if trigger
            .session
            .is_some_and(|session| session != active.connection.key)
        {
            debug!(source = ?trigger.source, "ignoring trigger from previous session");
            return;
        }
        match self.coordinator.on_trigger(trigger.source) {
            Some(ticket) => self.start_refresh(ticket, trigger.source),
            None => debug!(source = ?trigger.source, "refresh in flight, coalescing trigger"),
        }
    }

    fn start_refresh(&mut self, ticket: RefreshTicket, source: TriggerSource) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let client = active.connection.client.clone();
        let session = active.connection.key;
        let done = self.done_tx.clone();
        debug!(%ticket, ?source, chain_id = session.chain_id, "refresh started");
        let task = tokio::spawn(async move {
            let report = DoneReport {
                done,
                session,
                ticket,
                sent: false,
            };
            let result = fetch_teams(client.as_ref(), ticket).await;
            report.send(result);
        });
        active.in_flight = Some(TaskGuard(task.abort_handle()));
        self.emit(SyncWorkerEvent::RefreshStarted { ticket, source });
    }

    fn on_refresh_done(&mut self, done: RefreshDone) {
        let Some(active) = self.active.as_mut() else {
            debug!(ticket = %done.ticket, "dropping refresh result after disconnect");
            return;
        };
        if active.connection.key != done.session {
            debug!(ticket = %done.ticket, "dropping refresh result from previous session");
            return;
        }
        active.in_flight = None;

        let result = match done.result {
            Ok(fetched) => self.cache.apply(done.session, fetched).map(|snapshot| {
                debug!(
                    ticket = %done.ticket,
                    teams = snapshot.teams.len(),
                    "refresh finished"
                );
            }),
            Err(err) => {
                warn!(ticket = %done.ticket, "refresh failed: {err}");
                Err(err)
            }
        };
        self.emit(SyncWorkerEvent::RefreshFinished {
            ticket: done.ticket,
            result,
        });

        if let Some((ticket, source)) = self.coordinator.on_refresh_finished(done.ticket) {
            self.start_refresh(ticket, source);
        }
    }

    fn emit(&self, event: SyncWorkerEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_signal<C>(active: &mut Option<ActiveConnection<C>>) -> ActiveSignal {
    let Some(active) = active.as_mut() else {
        return pending().await;
    };
    tokio::select! {
        _ = tick(&mut active.timer) => ActiveSignal::Tick,
        Some(event) = active.contract_events.recv() => ActiveSignal::ContractEvent(event),
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending::<()>().await,
    }
}
