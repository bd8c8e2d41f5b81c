use super::{
    ChainClient,
    Subscription,
    abi::Lottery,
};
use crate::{
    config::NetworkConfig,
    error::ChainError,
    types::{
        ContractBalance,
        ContractEvent,
        ContractEventKind,
        Team,
    },
};
use alloy::{
    network::{
        EthereumWallet,
        ReceiptResponse,
    },
    primitives::{
        Address,
        B256,
        TxHash,
        U256,
    },
    providers::{
        DynProvider,
        Provider,
        ProviderBuilder,
    },
    rpc::types::Filter,
    signers::local::PrivateKeySigner,
    transports::http::reqwest::Url,
};
use deployments::Deployments;
use std::{
    fmt,
    future::Future,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time,
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone)]
struct Endpoint {
    url: String,
    provider: DynProvider,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Read policy over an ordered endpoint list.
#[derive(Clone, Copy, Debug)]
struct Fallback {
    retry_count: u32,
    timeout: Duration,
}

impl Fallback {
    /// Tries `op` on each endpoint in order, each attempt bounded by
    /// `timeout`, for `retry_count + 1` passes. Returns the first success or
    /// the last error.
    async fn run<E, T, F, Fut>(
        &self,
        what: &str,
        endpoints: &[E],
        op: F,
    ) -> Result<T, ChainError>
    where
        E: fmt::Display,
        F: Fn(&E) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut last_err = ChainError::Rpc("no endpoints configured".to_string());
        let total = endpoints.len() as u64 * (u64::from(self.retry_count) + 1);
        let mut tried = 0u64;
        for attempt in 0..=self.retry_count {
            for endpoint in endpoints {
                tried += 1;
                match time::timeout(self.timeout, op(endpoint)).await {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(err)) => last_err = err,
                    Err(_) => last_err = ChainError::Timeout(self.timeout),
                }
                if tried < total {
                    warn!(
                        url = %endpoint,
                        attempt,
                        "{what} failed, trying next endpoint: {last_err}"
                    );
                }
            }
        }
        Err(last_err)
    }
}

/// Calls `poll` every `interval` until it yields a result or `limit` has
/// passed since the first call.
async fn poll_until<T, F, Fut>(
    interval: Duration,
    limit: Duration,
    mut poll: F,
) -> Result<T, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<Result<T, ChainError>>>,
{
    let deadline = time::Instant::now() + limit;
    let mut ticker = time::interval(interval);
    loop {
        ticker.tick().await;
        if let Some(result) = poll().await {
            return result;
        }
        if time::Instant::now() >= deadline {
            return Err(ChainError::Timeout(limit));
        }
    }
}

/// Block range bookkeeping for log polling.
#[derive(Debug, Default)]
struct LogCursor {
    next_block: Option<u64>,
}

impl LogCursor {
    /// Range to query given the current `head`. The first observation only
    /// anchors the cursor past `head`.
    fn range(&mut self, head: u64) -> Option<(u64, u64)> {
        match self.next_block {
            None => {
                self.next_block = Some(head + 1);
                None
            }
            Some(from) if head < from => None,
            Some(from) => Some((from, head)),
        }
    }

    fn advance(&mut self, head: u64) {
        self.next_block = Some(head + 1);
    }
}

/// [`ChainClient`] over JSON-RPC.
///
/// Reads walk the endpoint list in order, each attempt bounded by the
/// network's request timeout, and the whole list is retried `retry_count`
/// more times before the last error is returned. Writes only go to the
/// primary endpoint so a transaction is never broadcast twice.
#[derive(Clone)]
pub struct AlloyChainClient {
    chain_id: u64,
    symbol: String,
    contract: Option<Address>,
    account: Address,
    endpoints: Vec<Endpoint>,
    fallback: Fallback,
    timeout: Duration,
    poll_interval: Duration,
    confirmation_timeout: Duration,
}

impl AlloyChainClient {
    /// Builds providers for every endpoint of `network`, probes them for the
    /// chain id, and resolves the Lottery address for that chain.
    ///
    /// The first endpoint that answers becomes the primary one.
    pub async fn connect(
        network: &NetworkConfig,
        signer: PrivateKeySigner,
        deployments: &Deployments,
    ) -> Result<Self, ChainError> {
        let account = signer.address();
        let wallet = EthereumWallet::from(signer);
        let timeout = network.request_timeout();

        let mut endpoints = Vec::with_capacity(network.endpoints.len());
        for raw in &network.endpoints {
            let url: Url = raw
                .parse()
                .map_err(|e| ChainError::Rpc(format!("invalid RPC url {raw}: {e}")))?;
            let provider = ProviderBuilder::new()
                .wallet(wallet.clone())
                .connect_http(url)
                .erased();
            endpoints.push(Endpoint {
                url: raw.clone(),
                provider,
            });
        }

        let mut reported = None;
        for (index, endpoint) in endpoints.iter().enumerate() {
            match time::timeout(timeout, endpoint.provider.get_chain_id()).await {
                Ok(Ok(chain_id)) => {
                    reported = Some((index, chain_id));
                    break;
                }
                Ok(Err(err)) => warn!(url = %endpoint.url, "chain id probe failed: {err}"),
                Err(_) => warn!(url = %endpoint.url, "chain id probe timed out"),
            }
        }
        let Some((primary, chain_id)) = reported else {
            return Err(ChainError::Rpc(format!(
                "none of the {} endpoints for {} responded",
                endpoints.len(),
                network.name
            )));
        };
        if chain_id != network.chain_id {
            warn!(
                expected = network.chain_id,
                reported = chain_id,
                "endpoint reports a different chain than configured; using the reported one"
            );
        }
        endpoints.rotate_left(primary);

        let contract = deployments
            .lottery_address(chain_id)
            .and_then(|raw| raw.parse::<Address>().ok());
        match contract {
            Some(address) => info!(chain_id, %address, "resolved Lottery deployment"),
            None => warn!(chain_id, "no Lottery deployment for this chain"),
        }

        Ok(Self {
            chain_id,
            symbol: network.symbol.clone(),
            contract,
            account,
            endpoints,
            fallback: Fallback {
                retry_count: network.retry_count,
                timeout,
            },
            timeout,
            poll_interval: network.poll_interval(),
            confirmation_timeout: network.confirmation_timeout(),
        })
    }

    pub fn account(&self) -> Address {
        self.account
    }

    fn contract(&self) -> Result<Address, ChainError> {
        self.contract.ok_or(ChainError::AddressUnresolved {
            chain_id: self.chain_id,
        })
    }

    fn primary(&self) -> DynProvider {
        self.endpoints[0].provider.clone()
    }

    async fn read<T, F, Fut>(&self, what: &'static str, op: F) -> Result<T, ChainError>
    where
        F: Fn(DynProvider) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        self.fallback
            .run(what, &self.endpoints, |endpoint| op(endpoint.provider.clone()))
            .await
    }
}

impl ChainClient for AlloyChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn contract_address(&self) -> Option<Address> {
        self.contract
    }

    fn native_symbol(&self) -> &str {
        &self.symbol
    }

    async fn team_count(&self) -> Result<u64, ChainError> {
        let contract = self.contract()?;
        let count = self
            .read("getTeamCount", |provider| async move {
                let lottery = Lottery::new(contract, provider);
                lottery.getTeamCount().call().await.map_err(rpc_error)
            })
            .await?;
        u64::try_from(count)
            .map_err(|_| ChainError::Decode(format!("team count {count} does not fit in u64")))
    }

    async fn team_details(&self, index: u64) -> Result<Team, ChainError> {
        let contract = self.contract()?;
        self.read("getTeamDetails", |provider| async move {
            let lottery = Lottery::new(contract, provider);
            let details = lottery
                .getTeamDetails(U256::from(index))
                .call()
                .await
                .map_err(rpc_error)?;
            Ok(Team::new(details.name, details.wallet, details.score))
        })
        .await
    }

    async fn contract_balance(&self) -> Result<ContractBalance, ChainError> {
        let contract = self.contract()?;
        let amount = self
            .read("getBalance", |provider| async move {
                provider.get_balance(contract).await.map_err(rpc_error)
            })
            .await?;
        Ok(ContractBalance::new(amount, self.symbol.clone()))
    }

    async fn register_team(
        &self,
        wallet: Address,
        name: String,
        password: String,
        deposit: U256,
    ) -> Result<TxHash, ChainError> {
        let contract = self.contract()?;
        let lottery = Lottery::new(contract, self.primary());
        let call = lottery.registerTeam(wallet, name, password).value(deposit);
        let pending = time::timeout(self.timeout, call.send())
            .await
            .map_err(|_| ChainError::Timeout(self.timeout))?
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        Ok(*pending.tx_hash())
    }

    async fn make_guess(&self, team: Address, guess: U256) -> Result<TxHash, ChainError> {
        let contract = self.contract()?;
        let lottery = Lottery::new(contract, self.primary());
        let call = lottery.makeAGuess(team, guess);
        let pending = time::timeout(self.timeout, call.send())
            .await
            .map_err(|_| ChainError::Timeout(self.timeout))?
            .map_err(|e| ChainError::Rejected(e.to_string()))?;
        Ok(*pending.tx_hash())
    }

    async fn wait_for_confirmation(&self, hash: TxHash) -> Result<(), ChainError> {
        self.contract()?;
        poll_until(self.poll_interval, self.confirmation_timeout, || async move {
            let receipt = self
                .read("getTransactionReceipt", |provider| async move {
                    provider
                        .get_transaction_receipt(hash)
                        .await
                        .map_err(rpc_error)
                })
                .await;
            match receipt {
                Ok(Some(receipt)) if receipt.status() => Some(Ok(())),
                Ok(Some(_)) => Some(Err(ChainError::Reverted { hash })),
                Ok(None) => None,
                Err(err) => {
                    debug!(%hash, "receipt poll failed: {err}");
                    None
                }
            }
        })
        .await
    }

    fn subscribe(
        &self,
        events: &[ContractEventKind],
        sink: mpsc::UnboundedSender<ContractEvent>,
    ) -> Result<Subscription, ChainError> {
        let contract = self.contract()?;
        let topics: Vec<B256> = events.iter().map(|kind| kind.signature_hash()).collect();
        let task = tokio::spawn(poll_logs(
            self.primary(),
            contract,
            topics,
            self.poll_interval,
            sink,
        ));
        Ok(Subscription::from_abort_handle(task.abort_handle()))
    }
}

/// Polls new blocks for contract logs and forwards the ones we know about.
/// Starts at the block after the current head, so history is never replayed.
async fn poll_logs(
    provider: DynProvider,
    contract: Address,
    topics: Vec<B256>,
    interval: Duration,
    sink: mpsc::UnboundedSender<ContractEvent>,
) {
    let mut cursor = LogCursor::default();
    let mut ticker = time::interval(interval);
    loop {
        ticker.tick().await;
        if sink.is_closed() {
            return;
        }
        let head = match provider.get_block_number().await {
            Ok(head) => head,
            Err(err) => {
                warn!("block number poll failed: {err}");
                continue;
            }
        };
        let Some((from, to)) = cursor.range(head) else {
            continue;
        };
        let filter = Filter::new()
            .address(contract)
            .event_signature(topics.clone())
            .from_block(from)
            .to_block(to);
        match provider.get_logs(&filter).await {
            Ok(logs) => {
                for log in logs {
                    let Some(kind) = log
                        .topics()
                        .first()
                        .and_then(ContractEventKind::from_signature_hash)
                    else {
                        continue;
                    };
                    let event = ContractEvent {
                        kind,
                        block_number: log.block_number,
                        tx_hash: log.transaction_hash,
                    };
                    if sink.send(event).is_err() {
                        return;
                    }
                }
                cursor.advance(to);
            }
            Err(err) => warn!(from, to, "log poll failed: {err}"),
        }
    }
}

fn rpc_error(err: impl std::fmt::Display) -> ChainError {
    ChainError::Rpc(err.to_string())
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use std::cell::{
        Cell,
        RefCell,
    };

    const ENDPOINTS: [&str; 3] = [
        "https://a.example",
        "https://b.example",
        "https://c.example",
    ];

    fn fallback(retry_count: u32) -> Fallback {
        Fallback {
            retry_count,
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn fallback__tries_endpoints_in_order_until_one_answers() {
        // given
        let tried = RefCell::new(Vec::new());

        // when
        let result = fallback(1)
            .run("getTeamCount", &ENDPOINTS, |url| {
                tried.borrow_mut().push(url.to_string());
                let answer = if *url == "https://c.example" {
                    Ok(4u64)
                } else {
                    Err(ChainError::Rpc(format!("{url} is down")))
                };
                async move { answer }
            })
            .await;

        // then
        assert_eq!(result, Ok(4));
        assert_eq!(*tried.borrow(), ENDPOINTS.to_vec());
    }

    #[tokio::test]
    async fn fallback__gives_up_after_retry_count_extra_passes() {
        // given
        let attempts = Cell::new(0u32);

        // when
        let result: Result<u64, _> = fallback(2)
            .run("getTeamCount", &ENDPOINTS, |url| {
                attempts.set(attempts.get() + 1);
                let err = ChainError::Rpc(format!("{url} attempt {}", attempts.get()));
                async move { Err(err) }
            })
            .await;

        // then
        assert_eq!(attempts.get(), 9);
        assert_eq!(
            result,
            Err(ChainError::Rpc("https://c.example attempt 9".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fallback__hung_endpoint_maps_to_timeout() {
        // given
        let attempts = Cell::new(0u32);

        // when
        let result: Result<u64, _> = fallback(0)
            .run("getBalance", &ENDPOINTS[..1], |_| {
                attempts.set(attempts.get() + 1);
                std::future::pending()
            })
            .await;

        // then
        assert_eq!(result, Err(ChainError::Timeout(Duration::from_millis(500))));
        assert_eq!(attempts.get(), 1);
    }

    #[tokio::test]
    async fn fallback__empty_endpoint_list_reports_rpc_error() {
        let endpoints: [&str; 0] = [];
        let result: Result<u64, _> = fallback(3)
            .run("getTeamCount", &endpoints, |_| async { Ok(1) })
            .await;
        assert!(matches!(result, Err(ChainError::Rpc(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until__returns_once_the_receipt_appears() {
        // given
        let polls = Cell::new(0u32);

        // when
        let result = poll_until(Duration::from_secs(4), Duration::from_secs(60), || {
            polls.set(polls.get() + 1);
            let done = (polls.get() == 3).then_some(Ok(()));
            async move { done }
        })
        .await;

        // then
        assert_eq!(result, Ok(()));
        assert_eq!(polls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until__times_out_at_the_deadline() {
        // given
        let started = time::Instant::now();
        let polls = Cell::new(0u32);

        // when
        let result: Result<(), _> =
            poll_until(Duration::from_secs(4), Duration::from_secs(10), || {
                polls.set(polls.get() + 1);
                async { None }
            })
            .await;

        // then
        assert_eq!(result, Err(ChainError::Timeout(Duration::from_secs(10))));
        assert_eq!(polls.get(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }

    #[test]
    fn log_cursor__first_head_only_anchors() {
        let mut cursor = LogCursor::default();
        assert_eq!(cursor.range(100), None);
        assert_eq!(cursor.range(100), None);
        assert_eq!(cursor.range(103), Some((101, 103)));
    }

    #[test]
    fn log_cursor__advances_past_delivered_range_only() {
        // given
        let mut cursor = LogCursor::default();
        cursor.range(10);

        // when
        let failed = cursor.range(12);
        let retried = cursor.range(13);
        cursor.advance(13);

        // then
        assert_eq!(failed, Some((11, 12)));
        assert_eq!(retried, Some((11, 13)));
        assert_eq!(cursor.range(13), None);
        assert_eq!(cursor.range(14), Some((14, 14)));
    }
}
