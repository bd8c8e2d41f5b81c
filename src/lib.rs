pub mod cache;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod session;
pub mod submitter;
pub mod types;
pub mod validation;
pub mod wallets;

pub mod test_helpers;

pub use cache::ReadCache;
pub use chain::{
    AlloyChainClient,
    ChainClient,
    Connection,
    Subscription,
};
pub use coordinator::{
    RefreshCoordinator,
    RefreshHandle,
    SyncHandle,
    SyncWorker,
};
pub use session::{
    SessionKey,
    SessionTracker,
};
pub use submitter::MutationSubmitter;
