use alloy::primitives::{
    Address,
    TxHash,
    U256,
    utils::format_units,
};
use chrono::{
    DateTime,
    Utc,
};
use std::fmt;

/// Number of decimals used by the native currency of every supported chain.
pub const NATIVE_DECIMALS: u8 = 18;

/// Registration deposit: 0.01 native units, in wei.
pub const DEFAULT_REGISTRATION_DEPOSIT_WEI: u128 = 10_000_000_000_000_000;

/// A registered team as reported by `getTeamDetails(index)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Team {
    pub name: String,
    pub address: Address,
    pub score: U256,
}

impl Team {
    pub fn new(name: impl Into<String>, address: Address, score: U256) -> Self {
        Self {
            name: name.into(),
            address,
            score,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractBalance {
    pub amount: U256,
    pub symbol: String,
}

impl ContractBalance {
    pub fn new(amount: U256, symbol: impl Into<String>) -> Self {
        Self {
            amount,
            symbol: symbol.into(),
        }
    }

    /// Renders the balance with four decimals, e.g. `0.0200 ETH`.
    pub fn display(&self) -> String {
        format!("{} {}", format_native(self.amount, 4), self.symbol)
    }
}

pub fn format_native(amount: U256, precision: usize) -> String {
    let Ok(formatted) = format_units(amount, NATIVE_DECIMALS) else {
        return amount.to_string();
    };
    let (whole, fraction) = formatted.split_once('.').unwrap_or((formatted.as_str(), ""));
    let mut fraction: String = fraction.chars().take(precision).collect();
    while fraction.len() < precision {
        fraction.push('0');
    }
    if precision == 0 {
        whole.to_string()
    } else {
        format!("{whole}.{fraction}")
    }
}

/// Materialized view of the contract published by the read cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TeamSnapshot {
    pub team_count: u64,
    pub teams: Vec<Team>,
    pub balance: Option<ContractBalance>,
    /// Ticket of the refresh that produced this snapshot; `None` before the first one.
    pub ticket: Option<RefreshTicket>,
}

impl TeamSnapshot {
    pub fn is_loaded(&self) -> bool {
        self.ticket.is_some()
    }

    /// Teams ordered for display: highest score first, ties keep fetch order.
    pub fn teams_by_score(&self) -> Vec<Team> {
        let mut teams = self.teams.clone();
        teams.sort_by(|a, b| b.score.cmp(&a.score));
        teams
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationKind {
    RegisterTeam,
    MakeGuess,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationKind::RegisterTeam => "register team",
            MutationKind::MakeGuess => "make a guess",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTransaction {
    pub hash: TxHash,
    pub kind: MutationKind,
    pub submitted_at: DateTime<Utc>,
    pub status: TxStatus,
}

impl PendingTransaction {
    pub fn new(hash: TxHash, kind: MutationKind) -> Self {
        Self {
            hash,
            kind,
            submitted_at: Utc::now(),
            status: TxStatus::Pending,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.status, TxStatus::Pending)
    }
}

/// Logical contract events that invalidate the read cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContractEventKind {
    TeamRegistered,
    GuessMade,
}

impl ContractEventKind {
    pub const WATCHED: [ContractEventKind; 2] =
        [ContractEventKind::TeamRegistered, ContractEventKind::GuessMade];
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContractEvent {
    pub kind: ContractEventKind,
    pub block_number: Option<u64>,
    pub tx_hash: Option<TxHash>,
}

/// Why a refresh was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerSource {
    Mount,
    MutationConfirmed(MutationKind),
    Event(ContractEventKind),
    Timer,
    Manual,
}

/// Value of the monotonically increasing refresh trigger counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefreshTicket(pub u64);

impl RefreshTicket {
    pub fn next(self) -> Self {
        RefreshTicket(self.0.wrapping_add(1))
    }
}

impl fmt::Display for RefreshTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
