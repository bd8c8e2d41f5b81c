//! Scriptable in-memory [`ChainClient`] for unit and integration tests.

use crate::{
    chain::{
        ChainClient,
        Subscription,
    },
    error::ChainError,
    types::{
        ContractBalance,
        ContractEvent,
        ContractEventKind,
        Team,
    },
};
use alloy::primitives::{
    Address,
    TxHash,
    U256,
};
use std::{
    collections::HashSet,
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
};
use tokio::sync::{
    mpsc,
    watch,
};

pub const FAKE_CHAIN_ID: u64 = 1337;

pub fn lottery_address() -> Address {
    Address::repeat_byte(0x42)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Submitted {
    RegisterTeam {
        wallet: Address,
        name: String,
        password: String,
        deposit: U256,
    },
    MakeGuess {
        team: Address,
        guess: U256,
    },
}

#[derive(Default)]
struct Script {
    teams: Vec<Team>,
    balance: U256,
    failing_indices: HashSet<u64>,
    fail_count: Option<ChainError>,
    fail_balance: bool,
    panic_count: bool,
    reject_submission: Option<ChainError>,
    confirmation: Option<ChainError>,
    submitted: Vec<Submitted>,
    sinks: Vec<mpsc::UnboundedSender<ContractEvent>>,
}

struct Counters {
    count_reads: AtomicUsize,
    detail_reads: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    details_in_flight: AtomicUsize,
    max_details_in_flight: AtomicUsize,
    hashes: AtomicUsize,
}

/// Fake chain shared between a test and the code under test. Clones see the
/// same state.
#[derive(Clone)]
pub struct FakeChain {
    chain_id: u64,
    contract: Option<Address>,
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    reads_open: Arc<watch::Sender<bool>>,
    confirmations_open: Arc<watch::Sender<bool>>,
}

impl FakeChain {
    pub fn with_teams(teams: Vec<Team>) -> Self {
        let script = Script {
            teams,
            balance: U256::from(20_000_000_000_000_000u128),
            ..Script::default()
        };
        Self {
            chain_id: FAKE_CHAIN_ID,
            contract: Some(lottery_address()),
            script: Arc::new(Mutex::new(script)),
            counters: Arc::new(Counters {
                count_reads: AtomicUsize::new(0),
                detail_reads: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                details_in_flight: AtomicUsize::new(0),
                max_details_in_flight: AtomicUsize::new(0),
                hashes: AtomicUsize::new(0),
            }),
            reads_open: Arc::new(watch::channel(true).0),
            confirmations_open: Arc::new(watch::channel(true).0),
        }
    }

    /// Same scripted state, reported as a different chain.
    pub fn on_chain(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    pub fn without_contract(mut self) -> Self {
        self.contract = None;
        self
    }

    pub fn set_teams(&self, teams: Vec<Team>) {
        self.script().teams = teams;
    }

    pub fn set_balance(&self, balance: U256) {
        self.script().balance = balance;
    }

    pub fn fail_indices(&self, indices: impl IntoIterator<Item = u64>) {
        self.script().failing_indices = indices.into_iter().collect();
    }

    pub fn fail_team_count(&self, err: Option<ChainError>) {
        self.script().fail_count = err;
    }

    /// Makes team-count reads panic, standing in for a broken client.
    pub fn panic_on_team_count(&self, panic: bool) {
        self.script().panic_count = panic;
    }

    pub fn fail_balance(&self, fail: bool) {
        self.script().fail_balance = fail;
    }

    pub fn reject_submissions(&self, err: Option<ChainError>) {
        self.script().reject_submission = err;
    }

    /// Makes every later confirmation wait fail with `err`.
    pub fn fail_confirmations(&self, err: Option<ChainError>) {
        self.script().confirmation = err;
    }

    /// Team-count reads block until [`FakeChain::release_reads`].
    pub fn hold_reads(&self) {
        self.reads_open.send_replace(false);
    }

    pub fn release_reads(&self) {
        self.reads_open.send_replace(true);
    }

    pub fn hold_confirmations(&self) {
        self.confirmations_open.send_replace(false);
    }

    pub fn release_confirmations(&self) {
        self.confirmations_open.send_replace(true);
    }

    /// Delivers `kind` to every live subscription.
    pub fn emit(&self, kind: ContractEventKind) {
        let event = ContractEvent {
            kind,
            block_number: None,
            tx_hash: None,
        };
        let mut script = self.script();
        script.sinks.retain(|sink| sink.send(event.clone()).is_ok());
    }

    pub fn active_subscriptions(&self) -> usize {
        self.script()
            .sinks
            .iter()
            .filter(|sink| !sink.is_closed())
            .count()
    }

    pub fn submitted(&self) -> Vec<Submitted> {
        self.script().submitted.clone()
    }

    pub fn count_reads(&self) -> usize {
        self.counters.count_reads.load(Ordering::SeqCst)
    }

    pub fn detail_reads(&self) -> usize {
        self.counters.detail_reads.load(Ordering::SeqCst)
    }

    /// Highest number of refresh bursts that were in flight at the same time.
    pub fn max_concurrent_refreshes(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of team detail reads that were pending at once.
    pub fn max_concurrent_detail_reads(&self) -> usize {
        self.counters.max_details_in_flight.load(Ordering::SeqCst)
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_contract(&self) -> Result<Address, ChainError> {
        self.contract.ok_or(ChainError::AddressUnresolved {
            chain_id: self.chain_id,
        })
    }

    fn next_hash(&self) -> TxHash {
        let n = self.counters.hashes.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        TxHash::left_padding_from(&n.to_be_bytes())
    }

    fn submit(&self, call: Submitted) -> Result<TxHash, ChainError> {
        self.ensure_contract()?;
        let mut script = self.script();
        if let Some(err) = script.reject_submission.clone() {
            return Err(err);
        }
        if let Submitted::RegisterTeam { wallet, name, .. } = &call {
            script.teams.push(Team::new(name.clone(), *wallet, U256::ZERO));
        }
        script.submitted.push(call);
        drop(script);
        Ok(self.next_hash())
    }
}

struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ChainClient for FakeChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn contract_address(&self) -> Option<Address> {
        self.contract
    }

    fn native_symbol(&self) -> &str {
        "ETH"
    }

    async fn team_count(&self) -> Result<u64, ChainError> {
        self.ensure_contract()?;
        self.counters.count_reads.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.counters.in_flight, &self.counters.max_in_flight);
        let mut open = self.reads_open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        if self.script().panic_count {
            panic!("team count read panicked");
        }
        let script = self.script();
        match &script.fail_count {
            Some(err) => Err(err.clone()),
            None => Ok(script.teams.len() as u64),
        }
    }

    async fn team_details(&self, index: u64) -> Result<Team, ChainError> {
        self.ensure_contract()?;
        self.counters.detail_reads.fetch_add(1, Ordering::SeqCst);
        let in_flight = InFlight::enter(
            &self.counters.details_in_flight,
            &self.counters.max_details_in_flight,
        );
        tokio::task::yield_now().await;
        drop(in_flight);
        let script = self.script();
        if script.failing_indices.contains(&index) {
            return Err(ChainError::Rpc(format!("execution reverted reading team {index}")));
        }
        usize::try_from(index)
            .ok()
            .and_then(|i| script.teams.get(i).cloned())
            .ok_or_else(|| ChainError::Rpc(format!("team index {index} out of range")))
    }

    async fn contract_balance(&self) -> Result<ContractBalance, ChainError> {
        self.ensure_contract()?;
        let script = self.script();
        if script.fail_balance {
            return Err(ChainError::Timeout(std::time::Duration::from_secs(10)));
        }
        Ok(ContractBalance::new(script.balance, "ETH"))
    }

    async fn register_team(
        &self,
        wallet: Address,
        name: String,
        password: String,
        deposit: U256,
    ) -> Result<TxHash, ChainError> {
        self.submit(Submitted::RegisterTeam {
            wallet,
            name,
            password,
            deposit,
        })
    }

    async fn make_guess(&self, team: Address, guess: U256) -> Result<TxHash, ChainError> {
        self.submit(Submitted::MakeGuess { team, guess })
    }

    async fn wait_for_confirmation(&self, hash: TxHash) -> Result<(), ChainError> {
        self.ensure_contract()?;
        let mut open = self.confirmations_open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        match self.script().confirmation.clone() {
            Some(ChainError::Reverted { .. }) => Err(ChainError::Reverted { hash }),
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn subscribe(
        &self,
        events: &[ContractEventKind],
        sink: mpsc::UnboundedSender<ContractEvent>,
    ) -> Result<Subscription, ChainError> {
        self.ensure_contract()?;
        let watched: Vec<ContractEventKind> = events.to_vec();
        let (tx, mut rx) = mpsc::unbounded_channel::<ContractEvent>();
        self.script().sinks.push(tx);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if watched.contains(&event.kind) && sink.send(event).is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::from_abort_handle(task.abort_handle()))
    }
}
