//! Read cache: the only owner of the materialized team snapshot.

use crate::{
    chain::{
        ChainClient,
        Connection,
    },
    error::{
        ChainError,
        FetchError,
    },
    session::{
        SessionKey,
        SessionWatcher,
    },
    types::{
        ContractBalance,
        RefreshTicket,
        Team,
        TeamSnapshot,
    },
};
use futures::{
    StreamExt,
    stream,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{
    debug,
    warn,
};

/// Upper bound on team detail reads pending at the same time.
pub const MAX_CONCURRENT_TEAM_READS: usize = 8;

/// Result of one refresh burst, not yet visible to anyone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedTeams {
    pub ticket: RefreshTicket,
    pub team_count: u64,
    pub teams: Vec<Team>,
    /// `None` when the balance read failed; the previous balance is kept.
    pub balance: Option<ContractBalance>,
    pub failed: Vec<u64>,
}

/// Reads the team count, then every team in `[0, count)` together with the
/// contract balance.
///
/// Indices whose read fails are left out. Only when every detail read fails
/// does the fetch as a whole fail.
pub async fn fetch_teams<C: ChainClient>(
    client: &C,
    ticket: RefreshTicket,
) -> Result<FetchedTeams, FetchError> {
    let chain_id = client.chain_id();
    if client.contract_address().is_none() {
        return Err(FetchError::AddressUnresolved { chain_id });
    }

    let team_count = client.team_count().await.map_err(|err| match err {
        ChainError::AddressUnresolved { chain_id } => {
            FetchError::AddressUnresolved { chain_id }
        }
        other => FetchError::TeamCount(other),
    })?;

    let details = stream::iter(0..team_count)
        .map(|index| client.team_details(index))
        .buffered(MAX_CONCURRENT_TEAM_READS)
        .collect::<Vec<_>>();
    let (details, balance) = futures::join!(details, client.contract_balance());

    let mut teams = Vec::with_capacity(details.len());
    let mut failed = Vec::new();
    let mut first_error = None;
    for (index, result) in (0..team_count).zip(details) {
        match result {
            Ok(team) => teams.push(team),
            Err(err) => {
                debug!(chain_id, index, "team read failed: {err}");
                failed.push(index);
                first_error.get_or_insert(err);
            }
        }
    }

    if team_count > 0 && teams.is_empty() {
        let source = first_error
            .unwrap_or_else(|| ChainError::Rpc("no team reads completed".to_string()));
        return Err(FetchError::TotalFetch {
            requested: team_count,
            source,
        });
    }
    if !failed.is_empty() {
        let err = FetchError::PartialFetch {
            requested: team_count,
            failed: failed.clone(),
        };
        warn!(chain_id, %ticket, failed = ?failed, "{err}");
    }

    let balance = match balance {
        Ok(balance) => Some(balance),
        Err(err) => {
            warn!(chain_id, "contract balance read failed: {err}");
            None
        }
    };

    Ok(FetchedTeams {
        ticket,
        team_count,
        teams,
        balance,
        failed,
    })
}

pub struct ReadCache {
    tx: watch::Sender<Arc<TeamSnapshot>>,
    session: SessionWatcher,
}

impl ReadCache {
    pub fn new(session: SessionWatcher) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(TeamSnapshot::default()));
        Self { tx, session }
    }

    /// Current snapshot; never blocks and never shows a half-applied refresh.
    pub fn snapshot(&self) -> Arc<TeamSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TeamSnapshot>> {
        self.tx.subscribe()
    }

    /// Whether the snapshot already reflects a refresh for `ticket` or later.
    pub fn is_fresh(&self, ticket: RefreshTicket) -> bool {
        self.tx.borrow().ticket.is_some_and(|current| current >= ticket)
    }

    pub fn clear(&self) {
        self.tx.send_replace(Arc::new(TeamSnapshot::default()));
    }

    /// Publishes `fetched` as the new snapshot, in one step.
    ///
    /// Results belonging to a session other than the current one are dropped,
    /// as are results older than what is already published.
    pub fn apply(
        &self,
        key: SessionKey,
        fetched: FetchedTeams,
    ) -> Result<Arc<TeamSnapshot>, FetchError> {
        if !self.session.is_current(key) {
            debug!(chain_id = key.chain_id, ticket = %fetched.ticket, "dropping stale refresh");
            return Err(FetchError::Stale);
        }
        if self.is_fresh(fetched.ticket) {
            debug!(ticket = %fetched.ticket, "snapshot already newer, skipping");
            return Ok(self.snapshot());
        }

        let previous = self.snapshot();
        let snapshot = Arc::new(TeamSnapshot {
            team_count: fetched.team_count,
            teams: fetched.teams,
            balance: fetched.balance.or_else(|| previous.balance.clone()),
            ticket: Some(fetched.ticket),
        });
        self.tx.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    /// Fetches and applies in one call. Total failures leave the snapshot as
    /// it was.
    pub async fn refresh<C: ChainClient>(
        &self,
        connection: &Connection<C>,
        ticket: RefreshTicket,
    ) -> Result<Arc<TeamSnapshot>, FetchError> {
        match fetch_teams(connection.client.as_ref(), ticket).await {
            Ok(fetched) => self.apply(connection.key, fetched),
            Err(_) if !self.session.is_current(connection.key) => Err(FetchError::Stale),
            Err(err) => Err(err),
        }
    }
}
