use crate::{
    error::ChainError,
    session::SessionKey,
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
    future::Future,
    sync::Arc,
};
use tokio::{
    sync::mpsc,
    task::AbortHandle,
};

pub mod abi;
pub mod alloy_client;

pub use alloy_client::AlloyChainClient;

/// Read/write/subscribe access to the one deployed Lottery contract on the
/// connected network.
///
/// Every operation fails with [`ChainError::AddressUnresolved`] when the
/// connected network has no known deployment.
pub trait ChainClient: Send + Sync + 'static {
    fn chain_id(&self) -> u64;

    fn contract_address(&self) -> Option<Address>;

    /// Ticker of the native currency, used to label the contract balance.
    fn native_symbol(&self) -> &str;

    fn team_count(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn team_details(
        &self,
        index: u64,
    ) -> impl Future<Output = Result<Team, ChainError>> + Send;

    fn contract_balance(
        &self,
    ) -> impl Future<Output = Result<ContractBalance, ChainError>> + Send;

    /// Sends `registerTeam` with `deposit` attached. Not idempotent.
    fn register_team(
        &self,
        wallet: Address,
        name: String,
        password: String,
        deposit: U256,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;

    /// Sends `makeAGuess`. Not idempotent.
    fn make_guess(
        &self,
        team: Address,
        guess: U256,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;

    /// Resolves once the transaction is final, or fails if it reverted.
    fn wait_for_confirmation(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = Result<(), ChainError>> + Send;

    /// Delivers matching logs from newly produced blocks into `sink` until the
    /// returned handle is dropped.
    fn subscribe(
        &self,
        events: &[ContractEventKind],
        sink: mpsc::UnboundedSender<ContractEvent>,
    ) -> Result<Subscription, ChainError>;
}

/// Live event listener. Dropping it stops the listener.
#[derive(Debug)]
pub struct Subscription {
    abort: AbortHandle,
}

impl Subscription {
    pub fn from_abort_handle(abort: AbortHandle) -> Self {
        Self { abort }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// A chain client bound to the session it was created for.
pub struct Connection<C> {
    pub client: Arc<C>,
    pub key: SessionKey,
}

impl<C> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            key: self.key,
        }
    }
}

impl<C: ChainClient> Connection<C> {
    pub fn new(client: C, key: SessionKey) -> Self {
        Self {
            client: Arc::new(client),
            key,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.client.chain_id()
    }
}
