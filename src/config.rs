use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::network::Network;
use crate::roles::blinder::BlindOptions;
use crate::roles::signer::{SIGHASH_ALL, SignOptions};

/// Configuration for a [`PsbtEngine`](crate::engine::PsbtEngine).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub network: Network,
    /// Electrum server; the network default is used when unset.
    pub electrum_url: Option<String>,
    /// Sighash type used when an input does not request one.
    pub sighash_type: u32,
    /// Complete blinding unblinded instead of failing when there are too few outputs.
    pub ignore_blind_fail: bool,
    /// Sign even if commitments do not balance or proofs are missing.
    pub allow_unbalanced_signing: bool,
    #[serde(with = "secs")]
    pub electrum_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            electrum_url: None,
            sighash_type: SIGHASH_ALL,
            ignore_blind_fail: false,
            allow_unbalanced_signing: false,
            electrum_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn electrum_url(&self) -> &str {
        self.electrum_url
            .as_deref()
            .unwrap_or_else(|| self.network.default_electrum_url())
    }

    pub fn blind_options(&self) -> BlindOptions {
        BlindOptions {
            ignore_blind_fail: self.ignore_blind_fail,
        }
    }

    pub fn sign_options(&self) -> SignOptions {
        SignOptions {
            sighash_type: self.sighash_type,
            allow_unbalanced: self.allow_unbalanced_signing,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_sign_with_sighash_all() {
        let config = EngineConfig::default();
        assert_eq!(config.sighash_type, 1);
        assert!(!config.ignore_blind_fail);
        assert_eq!(config.electrum_url(), "tcp://localhost:50001");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{"network":"liquidtestnet","ignore_blind_fail":true}"#)
                .unwrap();
        assert_eq!(config.network, Network::LiquidTestnet);
        assert!(config.ignore_blind_fail);
        assert_eq!(config.electrum_url(), "ssl://blockstream.info:465");
        assert_eq!(config.electrum_timeout, Duration::from_secs(30));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"electrum_url":"tcp://127.0.0.1:60401","electrum_timeout":5}}"#
        )
        .unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.electrum_url(), "tcp://127.0.0.1:60401");
        assert_eq!(config.electrum_timeout, Duration::from_secs(5));
    }

    #[test]
    fn rejects_unknown_network() {
        let err = EngineConfig::from_json_str(r#"{"network":"bitcoin"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
