use crate::{
    error::ConfigError,
    types::DEFAULT_REGISTRATION_DEPOSIT_WEI,
};
use alloy::primitives::U256;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fs,
    path::PathBuf,
    time::Duration,
};

pub const DEFAULT_LOCAL_RPC_URL: &str = "http://127.0.0.1:8545";
pub const DEFAULT_SEPOLIA_RPC_URL: &str = "https://sepolia.drpc.org";
pub const DEFAULT_MAINNET_RPC_URL: &str = "https://eth.merkle.io";
pub const DEFAULT_KEYSTORE_DIR: &str = "~/.foundry/keystores";
pub const DEFAULT_LOG_DIR: &str = "logs";

const DEFAULT_REFRESH_INTERVAL_MS: u64 = 10_000;
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 4_000;
const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_RETRY_COUNT: u32 = 1;

/// One selectable network and the ordered RPC endpoints that serve it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    pub endpoints: Vec<String>,
    /// Extra passes over the endpoint list before a read gives up.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// Block/log polling interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval: u64,
    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout: u64,
}

impl NetworkConfig {
    pub fn new(
        name: impl Into<String>,
        chain_id: u64,
        endpoints: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            chain_id,
            symbol: default_symbol(),
            endpoints,
            retry_count: DEFAULT_RETRY_COUNT,
            timeout: DEFAULT_TIMEOUT_MS,
            poll_interval: DEFAULT_POLL_INTERVAL_MS,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT_MS,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout)
    }

    fn matches(&self, selector: &str) -> bool {
        self.name.eq_ignore_ascii_case(selector)
            || selector.parse::<u64>().is_ok_and(|id| id == self.chain_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_networks")]
    pub networks: Vec<NetworkConfig>,
    /// Background refresh period in milliseconds.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval: u64,
    /// Registration deposit in wei, as a decimal string.
    #[serde(default = "default_deposit")]
    pub registration_deposit: String,
    #[serde(default = "default_deployments_path")]
    pub deployments: String,
    #[serde(default = "default_keystore_dir")]
    pub keystore_dir: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            networks: default_networks(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL_MS,
            registration_deposit: default_deposit(),
            deployments: default_deployments_path(),
            keystore_dir: default_keystore_dir(),
            log_dir: default_log_dir(),
        }
    }
}

impl ClientConfig {
    /// Reads `path` when given, otherwise returns the built-in defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let Some(raw) = path else {
            return Ok(Self::default());
        };
        let path = expand_path(raw);
        let data = fs::read(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            serde_json::from_slice(&data).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the sync worker and chain client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.registration_deposit_wei()?;
        if self.refresh_interval == 0 {
            return Err(ConfigError::ZeroInterval {
                field: "refreshInterval".to_string(),
            });
        }
        for network in &self.networks {
            let durations = [
                ("timeout", network.timeout),
                ("pollInterval", network.poll_interval),
                ("confirmationTimeout", network.confirmation_timeout),
            ];
            if let Some((field, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
                return Err(ConfigError::ZeroInterval {
                    field: format!("{}.{field}", network.name),
                });
            }
        }
        Ok(())
    }

    pub fn network(&self, selector: &str) -> Result<&NetworkConfig, ConfigError> {
        let network = self
            .networks
            .iter()
            .find(|n| n.matches(selector))
            .ok_or_else(|| ConfigError::UnknownNetwork(selector.to_string()))?;
        if network.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints(network.name.clone()));
        }
        Ok(network)
    }

    pub fn network_index(&self, selector: &str) -> Result<usize, ConfigError> {
        self.network(selector)?;
        self.networks
            .iter()
            .position(|n| n.matches(selector))
            .ok_or_else(|| ConfigError::UnknownNetwork(selector.to_string()))
    }

    /// Puts `url` in front of the endpoint list of the selected network.
    pub fn prepend_endpoint(
        &mut self,
        selector: &str,
        url: impl Into<String>,
    ) -> Result<(), ConfigError> {
        let network = self
            .networks
            .iter_mut()
            .find(|n| n.matches(selector))
            .ok_or_else(|| ConfigError::UnknownNetwork(selector.to_string()))?;
        network.endpoints.insert(0, url.into());
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval)
    }

    pub fn registration_deposit_wei(&self) -> Result<U256, ConfigError> {
        U256::from_str_radix(self.registration_deposit.trim(), 10)
            .map_err(|_| ConfigError::InvalidDeposit(self.registration_deposit.clone()))
    }

    pub fn deployments_path(&self) -> PathBuf {
        expand_path(&self.deployments)
    }

    pub fn keystore_dir(&self) -> PathBuf {
        expand_path(&self.keystore_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        expand_path(&self.log_dir)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

fn default_networks() -> Vec<NetworkConfig> {
    vec![
        NetworkConfig::new("localhost", 1337, vec![DEFAULT_LOCAL_RPC_URL.to_string()]),
        NetworkConfig::new(
            "sepolia",
            11155111,
            vec![DEFAULT_SEPOLIA_RPC_URL.to_string()],
        ),
        NetworkConfig::new("mainnet", 1, vec![DEFAULT_MAINNET_RPC_URL.to_string()]),
    ]
}

fn default_symbol() -> String {
    "ETH".to_string()
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_confirmation_timeout_ms() -> u64 {
    DEFAULT_CONFIRMATION_TIMEOUT_MS
}

fn default_refresh_interval_ms() -> u64 {
    DEFAULT_REFRESH_INTERVAL_MS
}

fn default_deposit() -> String {
    DEFAULT_REGISTRATION_DEPOSIT_WEI.to_string()
}

fn default_deployments_path() -> String {
    deployments::DEFAULT_DEPLOYMENTS_FILE.to_string()
}

fn default_keystore_dir() -> String {
    DEFAULT_KEYSTORE_DIR.to_string()
}

fn default_log_dir() -> String {
    DEFAULT_LOG_DIR.to_string()
}
