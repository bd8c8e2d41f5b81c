use anyhow::{
    Context,
    Result,
    anyhow,
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fmt,
    fs,
    path::Path,
};

pub const DEFAULT_DEPLOYMENTS_FILE: &str = "contracts/deployments.json";
pub const LOTTERY_CONTRACT: &str = "Lottery";

/// Numeric chain id as it appears in the deployments file keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChainKey(pub u64);

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub struct NetworkDeployment {
    pub name: String,
    #[serde(default)]
    pub contracts: BTreeMap<String, String>,
}

/// Contract addresses per chain, keyed by the decimal chain id.
///
/// ```json
/// { "11155111": { "name": "sepolia", "contracts": { "Lottery": "0x..." } } }
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Deployments {
    networks: BTreeMap<ChainKey, NetworkDeployment>,
}

impl Deployments {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        let raw: BTreeMap<String, NetworkDeployment> = serde_json::from_slice(data)
            .context("Failed to parse deployments JSON")?;
        let mut networks = BTreeMap::new();
        for (key, deployment) in raw {
            let chain_id = key.trim().parse::<u64>().map_err(|_| {
                anyhow!("Deployment key {key:?} is not a numeric chain id")
            })?;
            networks.insert(ChainKey(chain_id), deployment);
        }
        Ok(Self { networks })
    }

    /// Loads the deployments file; a missing file yields an empty set.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(path).with_context(|| {
            format!("Failed to read deployments file {}", path.display())
        })?;
        Self::from_json(&data)
    }

    pub fn network(&self, chain_id: u64) -> Option<&NetworkDeployment> {
        self.networks.get(&ChainKey(chain_id))
    }

    pub fn network_name(&self, chain_id: u64) -> Option<&str> {
        self.network(chain_id).map(|n| n.name.as_str())
    }

    pub fn address_of(&self, chain_id: u64, contract: &str) -> Option<&str> {
        self.network(chain_id)
            .and_then(|n| n.contracts.get(contract))
            .map(String::as_str)
    }

    pub fn lottery_address(&self, chain_id: u64) -> Option<&str> {
        self.address_of(chain_id, LOTTERY_CONTRACT)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    const SAMPLE: &str = r#"{
        "11155111": {
            "name": "sepolia",
            "contracts": { "Lottery": "0x5FbDB2315678afecb367f032d93F642f64180aa3" }
        },
        "1337": { "name": "localhost", "contracts": {} }
    }"#;

    #[test]
    fn from_json__resolves_lottery_address_per_chain() {
        // given
        let deployments = Deployments::from_json(SAMPLE.as_bytes()).unwrap();

        // when
        let sepolia = deployments.lottery_address(11155111);
        let local = deployments.lottery_address(1337);
        let unknown = deployments.lottery_address(1);

        // then
        assert_eq!(sepolia, Some("0x5FbDB2315678afecb367f032d93F642f64180aa3"));
        assert_eq!(local, None);
        assert_eq!(unknown, None);
        assert_eq!(deployments.network_name(1337), Some("localhost"));
    }

    #[test]
    fn from_json__rejects_non_numeric_chain_keys() {
        let err = Deployments::from_json(br#"{"sepolia": {"name": "x"}}"#).unwrap_err();
        assert!(err.to_string().contains("not a numeric chain id"));
    }

    #[test]
    fn from_json__treats_blank_input_as_empty() {
        let deployments = Deployments::from_json(b"  \n").unwrap();
        assert_eq!(deployments, Deployments::default());
    }

    #[test]
    fn load__missing_file_is_empty_not_an_error() {
        let deployments =
            Deployments::load("does/not/exist/deployments.json").unwrap();
        assert_eq!(deployments, Deployments::default());
    }
}
