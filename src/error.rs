use alloy::primitives::TxHash;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by a [`crate::chain::ChainClient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("no Lottery deployment is known for chain {chain_id}")]
    AddressUnresolved { chain_id: u64 },

    #[error("rpc request failed: {0}")]
    Rpc(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transaction was rejected: {0}")]
    Rejected(String),

    #[error("transaction {hash} reverted on-chain")]
    Reverted { hash: TxHash },

    #[error("could not decode contract response: {0}")]
    Decode(String),
}

/// Local form checks; these never reach the chain client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} is required")]
    MissingField { field: &'static str },

    #[error("{value:?} is not a valid address")]
    InvalidAddress { value: String },

    #[error("{value:?} is not a non-negative whole number")]
    InvalidGuess { value: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
    #[error("no Lottery deployment is known for chain {chain_id}")]
    AddressUnresolved { chain_id: u64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("submission failed: {0}")]
    Submission(ChainError),

    #[error("confirmation failed: {0}")]
    Confirmation(ChainError),

    #[error("the network changed before the transaction resolved")]
    Stale,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("no Lottery deployment is known for chain {chain_id}")]
    AddressUnresolved { chain_id: u64 },

    #[error("reading the team count failed: {0}")]
    TeamCount(ChainError),

    #[error("{} of {requested} team reads failed (indices {failed:?})", .failed.len())]
    PartialFetch { requested: u64, failed: Vec<u64> },

    #[error("all {requested} team reads failed: {source}")]
    TotalFetch { requested: u64, source: ChainError },

    #[error("the network changed while the refresh was in flight")]
    Stale,

    #[error("the refresh task ended without a result")]
    Aborted,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("unknown network {0:?}")]
    UnknownNetwork(String),

    #[error("network {0:?} has no RPC endpoints configured")]
    NoEndpoints(String),

    #[error("registration deposit {0:?} is not a wei amount")]
    InvalidDeposit(String),

    #[error("{field} must be greater than zero")]
    ZeroInterval { field: String },
}
