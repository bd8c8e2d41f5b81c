//! Mutation submitter: sends the two state-changing calls and follows each
//! transaction until it resolves.

use crate::{
    chain::{
        ChainClient,
        Connection,
    },
    coordinator::RefreshHandle,
    error::{
        ChainError,
        MutationError,
    },
    session::{
        SessionKey,
        SessionWatcher,
    },
    types::{
        MutationKind,
        PendingTransaction,
        TriggerSource,
        TxStatus,
    },
    validation::{
        GuessForm,
        RegisterTeamForm,
    },
};
use alloy::primitives::{
    TxHash,
    U256,
};
use std::{
    future::Future,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};
use tokio::sync::watch;
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MutationPhase {
    #[default]
    Idle,
    Submitting,
    Confirming {
        hash: TxHash,
    },
    Confirmed {
        hash: TxHash,
    },
    Failed(MutationError),
}

impl MutationPhase {
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            MutationPhase::Submitting | MutationPhase::Confirming { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationOutcome {
    Confirmed(TxHash),
    /// A mutation of the same kind was still in flight; nothing was sent.
    AlreadyInFlight,
}

struct Lane {
    /// Session of the mutation currently holding this lane, if any.
    holder: Mutex<Option<SessionKey>>,
    phase: watch::Sender<MutationPhase>,
}

impl Lane {
    fn new() -> Self {
        Self {
            holder: Mutex::new(None),
            phase: watch::channel(MutationPhase::Idle).0,
        }
    }

    fn holder(&self) -> MutexGuard<'_, Option<SessionKey>> {
        self.holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct Inner {
    deposit: U256,
    session: SessionWatcher,
    refresh: RefreshHandle,
    register: Lane,
    guess: Lane,
    ledger: Mutex<Vec<PendingTransaction>>,
}

/// Cheap to clone; clones share in-flight flags, phases and the ledger.
#[derive(Clone)]
pub struct MutationSubmitter {
    inner: Arc<Inner>,
}

/// Holds one mutation lane for a session until dropped.
///
/// A holder from a session that is no longer current does not block the
/// lane: its result will be dropped as stale anyway.
struct InFlightGuard<'a> {
    lane: &'a Lane,
    key: SessionKey,
}

impl<'a> InFlightGuard<'a> {
    fn try_acquire(
        lane: &'a Lane,
        key: SessionKey,
        session: &SessionWatcher,
    ) -> Option<Self> {
        let mut holder = lane.holder();
        if holder.is_some_and(|held| held == key || session.is_current(held)) {
            return None;
        }
        *holder = Some(key);
        Some(Self { lane, key })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut holder = self.lane.holder();
        if *holder == Some(self.key) {
            *holder = None;
        }
    }
}

impl MutationSubmitter {
    pub fn new(deposit: U256, session: SessionWatcher, refresh: RefreshHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                deposit,
                session,
                refresh,
                register: Lane::new(),
                guess: Lane::new(),
                ledger: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn deposit(&self) -> U256 {
        self.inner.deposit
    }

    pub fn phase(&self, kind: MutationKind) -> MutationPhase {
        self.lane(kind).phase.borrow().clone()
    }

    pub fn watch_phase(&self, kind: MutationKind) -> watch::Receiver<MutationPhase> {
        self.lane(kind).phase.subscribe()
    }

    /// True while a mutation of `kind` from the current session is pending.
    pub fn is_in_flight(&self, kind: MutationKind) -> bool {
        self.lane(kind)
            .holder()
            .is_some_and(|held| self.inner.session.is_current(held))
    }

    /// Transactions this session has sent, oldest first.
    pub fn pending(&self) -> Vec<PendingTransaction> {
        self.ledger().clone()
    }

    /// Forgets phases and the transaction ledger, e.g. after a disconnect.
    pub fn reset(&self) {
        self.inner.register.phase.send_replace(MutationPhase::Idle);
        self.inner.guess.phase.send_replace(MutationPhase::Idle);
        self.ledger().clear();
    }

    pub async fn register_team<C: ChainClient>(
        &self,
        connection: &Connection<C>,
        form: &RegisterTeamForm,
    ) -> Result<MutationOutcome, MutationError> {
        let kind = MutationKind::RegisterTeam;
        let Some(_guard) = self.acquire(kind, connection.key) else {
            debug!("register team already in flight, ignoring");
            return Ok(MutationOutcome::AlreadyInFlight);
        };
        let request = form.validate().map_err(|err| self.fail(kind, err.into()))?;
        let client = connection.client.clone();
        let deposit = self.inner.deposit;
        self.submit_and_confirm(connection, kind, async move {
            client
                .register_team(request.wallet, request.name, request.password, deposit)
                .await
        })
        .await
    }

    pub async fn make_guess<C: ChainClient>(
        &self,
        connection: &Connection<C>,
        form: &GuessForm,
    ) -> Result<MutationOutcome, MutationError> {
        let kind = MutationKind::MakeGuess;
        let Some(_guard) = self.acquire(kind, connection.key) else {
            debug!("guess already in flight, ignoring");
            return Ok(MutationOutcome::AlreadyInFlight);
        };
        let request = form.validate().map_err(|err| self.fail(kind, err.into()))?;
        let client = connection.client.clone();
        self.submit_and_confirm(connection, kind, async move {
            client.make_guess(request.team, request.guess).await
        })
        .await
    }

    async fn submit_and_confirm<C: ChainClient>(
        &self,
        connection: &Connection<C>,
        kind: MutationKind,
        send: impl Future<Output = Result<TxHash, ChainError>>,
    ) -> Result<MutationOutcome, MutationError> {
        let key = connection.key;
        if connection.client.contract_address().is_none() {
            let err = MutationError::AddressUnresolved {
                chain_id: key.chain_id,
            };
            return Err(self.fail(kind, err));
        }

        self.collect_resolved();
        self.set_phase(kind, MutationPhase::Submitting);
        let sent = send.await;
        if !self.inner.session.is_current(key) {
            debug!(%kind, "network changed during submission, dropping result");
            return Err(MutationError::Stale);
        }
        let hash = match sent {
            Ok(hash) => hash,
            Err(err) => {
                warn!(%kind, "submission failed: {err}");
                return Err(self.fail(kind, MutationError::Submission(err)));
            }
        };
        info!(%kind, %hash, "transaction submitted");
        self.ledger().push(PendingTransaction::new(hash, kind));
        self.set_phase(kind, MutationPhase::Confirming { hash });

        let confirmed = connection.client.wait_for_confirmation(hash).await;
        if !self.inner.session.is_current(key) {
            debug!(%kind, %hash, "network changed while confirming, dropping result");
            return Err(MutationError::Stale);
        }
        match confirmed {
            Ok(()) => {
                info!(%kind, %hash, "transaction confirmed");
                self.resolve(hash, TxStatus::Confirmed);
                self.set_phase(kind, MutationPhase::Confirmed { hash });
                self.inner
                    .refresh
                    .trigger_for(key, TriggerSource::MutationConfirmed(kind));
                Ok(MutationOutcome::Confirmed(hash))
            }
            Err(err) => {
                warn!(%kind, %hash, "transaction failed: {err}");
                self.resolve(hash, TxStatus::Failed);
                Err(self.fail(kind, MutationError::Confirmation(err)))
            }
        }
    }

    fn acquire(&self, kind: MutationKind, key: SessionKey) -> Option<InFlightGuard<'_>> {
        InFlightGuard::try_acquire(self.lane(kind), key, &self.inner.session)
    }

    fn lane(&self, kind: MutationKind) -> &Lane {
        match kind {
            MutationKind::RegisterTeam => &self.inner.register,
            MutationKind::MakeGuess => &self.inner.guess,
        }
    }

    fn set_phase(&self, kind: MutationKind, phase: MutationPhase) {
        self.lane(kind).phase.send_replace(phase);
    }

    fn fail(&self, kind: MutationKind, err: MutationError) -> MutationError {
        self.set_phase(kind, MutationPhase::Failed(err.clone()));
        err
    }

    fn ledger(&self) -> MutexGuard<'_, Vec<PendingTransaction>> {
        self.inner
            .ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(&self, hash: TxHash, status: TxStatus) {
        if let Some(tx) = self.ledger().iter_mut().find(|tx| tx.hash == hash) {
            tx.status = status;
        }
    }

    fn collect_resolved(&self) {
        self.ledger().retain(|tx| !tx.is_resolved());
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        coordinator::Trigger,
        error::ValidationError,
        session::SessionTracker,
        test_helpers::{
            FakeChain,
            Submitted,
        },
    };
    use tokio::sync::mpsc;

    const WALLET: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    struct Harness {
        tracker: SessionTracker,
        submitter: MutationSubmitter,
        connection: Connection<FakeChain>,
        triggers: mpsc::UnboundedReceiver<Trigger>,
    }

    fn harness(chain: FakeChain) -> Harness {
        let mut tracker = SessionTracker::new();
        let (refresh, triggers) = RefreshHandle::channel();
        let submitter = MutationSubmitter::new(U256::from(10u64.pow(16)), tracker.watcher(), refresh);
        let key = tracker.connect(chain.chain_id());
        Harness {
            tracker,
            submitter,
            connection: Connection::new(chain, key),
            triggers,
        }
    }

    fn register_form() -> RegisterTeamForm {
        RegisterTeamForm {
            name: "Default Team".to_string(),
            wallet: WALLET.to_string(),
            password: "Password01".to_string(),
        }
    }

    #[tokio::test]
    async fn register_team__attaches_deposit_and_triggers_refresh_once_confirmed() {
        // given
        let mut h = harness(FakeChain::with_teams(vec![]));

        // when
        let outcome = h
            .submitter
            .register_team(&h.connection, &register_form())
            .await
            .unwrap();

        // then
        assert!(matches!(outcome, MutationOutcome::Confirmed(_)));
        let submitted = h.connection.client.submitted();
        assert!(matches!(
            &submitted[..],
            [Submitted::RegisterTeam { deposit, name, .. }]
                if *deposit == U256::from(10u64.pow(16)) && name == "Default Team"
        ));
        let trigger = h.triggers.try_recv().unwrap();
        assert_eq!(
            trigger.source,
            TriggerSource::MutationConfirmed(MutationKind::RegisterTeam)
        );
        assert_eq!(trigger.session, Some(h.connection.key));
        assert!(h.triggers.try_recv().is_err());
        assert!(matches!(
            h.submitter.phase(MutationKind::RegisterTeam),
            MutationPhase::Confirmed { .. }
        ));
    }

    #[tokio::test]
    async fn register_team__invalid_wallet_never_reaches_chain() {
        // given
        let h = harness(FakeChain::with_teams(vec![]));
        let form = RegisterTeamForm {
            wallet: "not-an-address".to_string(),
            ..register_form()
        };

        // when
        let err = h
            .submitter
            .register_team(&h.connection, &form)
            .await
            .unwrap_err();

        // then
        assert!(matches!(
            err,
            MutationError::Validation(ValidationError::InvalidAddress { .. })
        ));
        assert!(h.connection.client.submitted().is_empty());
        assert!(!h.submitter.is_in_flight(MutationKind::RegisterTeam));
    }

    #[tokio::test]
    async fn make_guess__second_call_while_in_flight_is_a_no_op() {
        // given
        let h = harness(FakeChain::with_teams(vec![]));
        h.connection.client.hold_confirmations();
        let form = GuessForm {
            team: WALLET.to_string(),
            guess: "7".to_string(),
        };
        let first = {
            let submitter = h.submitter.clone();
            let connection = h.connection.clone();
            let form = form.clone();
            tokio::spawn(async move { submitter.make_guess(&connection, &form).await })
        };
        while !matches!(
            h.submitter.phase(MutationKind::MakeGuess),
            MutationPhase::Confirming { .. }
        ) {
            tokio::task::yield_now().await;
        }

        // when
        let second = h.submitter.make_guess(&h.connection, &form).await;
        h.connection.client.release_confirmations();
        let first = first.await.unwrap();

        // then
        assert_eq!(second, Ok(MutationOutcome::AlreadyInFlight));
        assert!(matches!(first, Ok(MutationOutcome::Confirmed(_))));
        assert_eq!(h.connection.client.submitted().len(), 1);
    }

    #[tokio::test]
    async fn make_guess__rejected_submission_surfaces_chain_error_verbatim() {
        // given
        let mut h = harness(FakeChain::with_teams(vec![]));
        let rejection = ChainError::Rejected("user rejected the request".to_string());
        h.connection.client.reject_submissions(Some(rejection.clone()));

        // when
        let err = h
            .submitter
            .make_guess(
                &h.connection,
                &GuessForm {
                    team: WALLET.to_string(),
                    guess: "1".to_string(),
                },
            )
            .await
            .unwrap_err();

        // then
        assert_eq!(err, MutationError::Submission(rejection));
        assert!(h.triggers.try_recv().is_err());
    }

    #[tokio::test]
    async fn register_team__reverted_transaction_does_not_invalidate_cache() {
        // given
        let mut h = harness(FakeChain::with_teams(vec![]));
        h.connection
            .client
            .fail_confirmations(Some(ChainError::Reverted {
                hash: TxHash::ZERO,
            }));

        // when
        let err = h
            .submitter
            .register_team(&h.connection, &register_form())
            .await
            .unwrap_err();

        // then
        assert!(matches!(
            err,
            MutationError::Confirmation(ChainError::Reverted { .. })
        ));
        assert!(h.triggers.try_recv().is_err());
        let ledger = h.submitter.pending();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, TxStatus::Failed);
    }

    #[tokio::test]
    async fn register_team__unresolved_contract_fails_before_submission() {
        let h = harness(FakeChain::with_teams(vec![]).without_contract());

        let err = h
            .submitter
            .register_team(&h.connection, &register_form())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            MutationError::AddressUnresolved {
                chain_id: h.connection.chain_id()
            }
        );
        assert!(h.connection.client.submitted().is_empty());
    }

    #[tokio::test]
    async fn make_guess__confirmation_after_network_switch_is_dropped() {
        // given
        let mut h = harness(FakeChain::with_teams(vec![]));
        h.connection.client.hold_confirmations();
        let task = {
            let submitter = h.submitter.clone();
            let connection = h.connection.clone();
            tokio::spawn(async move {
                submitter
                    .make_guess(
                        &connection,
                        &GuessForm {
                            team: WALLET.to_string(),
                            guess: "3".to_string(),
                        },
                    )
                    .await
            })
        };
        while h.submitter.pending().is_empty() {
            tokio::task::yield_now().await;
        }

        // when
        h.tracker.connect(11155111);
        h.submitter.reset();
        h.connection.client.release_confirmations();
        let result = task.await.unwrap();

        // then
        assert_eq!(result, Err(MutationError::Stale));
        assert_eq!(h.submitter.phase(MutationKind::MakeGuess), MutationPhase::Idle);
        assert!(h.triggers.try_recv().is_err());
    }

    #[tokio::test]
    async fn make_guess__pending_guess_on_old_network_does_not_block_new_one() {
        // given
        let mut h = harness(FakeChain::with_teams(vec![]));
        h.connection.client.hold_confirmations();
        let old = {
            let submitter = h.submitter.clone();
            let connection = h.connection.clone();
            tokio::spawn(async move {
                submitter
                    .make_guess(
                        &connection,
                        &GuessForm {
                            team: WALLET.to_string(),
                            guess: "3".to_string(),
                        },
                    )
                    .await
            })
        };
        while h.submitter.pending().is_empty() {
            tokio::task::yield_now().await;
        }
        let on_b = FakeChain::with_teams(vec![]).on_chain(11155111);
        let key_b = h.tracker.connect(on_b.chain_id());
        h.submitter.reset();
        let connection_b = Connection::new(on_b, key_b);

        // when
        assert!(!h.submitter.is_in_flight(MutationKind::MakeGuess));
        let outcome = h
            .submitter
            .make_guess(
                &connection_b,
                &GuessForm {
                    team: WALLET.to_string(),
                    guess: "4".to_string(),
                },
            )
            .await;
        h.connection.client.release_confirmations();
        let old = old.await.unwrap();

        // then
        assert!(matches!(outcome, Ok(MutationOutcome::Confirmed(_))));
        assert_eq!(connection_b.client.submitted().len(), 1);
        assert_eq!(old, Err(MutationError::Stale));
        assert!(!h.submitter.is_in_flight(MutationKind::MakeGuess));
        assert!(matches!(
            h.submitter.phase(MutationKind::MakeGuess),
            MutationPhase::Confirmed { .. }
        ));
    }
}
