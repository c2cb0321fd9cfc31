use lwk_wollet::ElementsNetwork;
use lwk_wollet::elements::{AddressParams, AssetId};
use serde::{Deserialize, Serialize};

/// Liquid networks a document can be rendered or broadcast for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Liquid,
    LiquidTestnet,
    #[default]
    LiquidRegtest,
}

impl Network {
    pub fn into_lwk(self) -> ElementsNetwork {
        match self {
            Network::Liquid => ElementsNetwork::Liquid,
            Network::LiquidTestnet => ElementsNetwork::LiquidTestnet,
            Network::LiquidRegtest => ElementsNetwork::default_regtest(),
        }
    }

    /// The asset fees are paid in.
    pub fn policy_asset(self) -> AssetId {
        self.into_lwk().policy_asset()
    }

    pub fn default_electrum_url(self) -> &'static str {
        match self {
            Network::Liquid => "ssl://blockstream.info:995",
            Network::LiquidTestnet => "ssl://blockstream.info:465",
            Network::LiquidRegtest => "tcp://localhost:50001",
        }
    }

    pub fn address_params(self) -> &'static AddressParams {
        match self {
            Network::Liquid => &AddressParams::LIQUID,
            Network::LiquidTestnet => &AddressParams::LIQUID_TESTNET,
            Network::LiquidRegtest => &AddressParams::ELEMENTS,
        }
    }

    /// Same name serde uses.
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Liquid => "liquid",
            Network::LiquidTestnet => "liquidtestnet",
            Network::LiquidRegtest => "liquidregtest",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "liquid" => Ok(Network::Liquid),
            "testnet" | "liquid-testnet" | "liquidtestnet" => Ok(Network::LiquidTestnet),
            "regtest" | "liquid-regtest" | "liquidregtest" | "elementsregtest" => {
                Ok(Network::LiquidRegtest)
            }
            _ => Err(format!("invalid network: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_aliases() {
        assert_eq!("liquid".parse::<Network>().unwrap(), Network::Liquid);
        assert_eq!("Testnet".parse::<Network>().unwrap(), Network::LiquidTestnet);
        assert_eq!(
            "elementsregtest".parse::<Network>().unwrap(),
            Network::LiquidRegtest
        );
        assert!("signet".parse::<Network>().is_err());
    }

    #[test]
    fn mainnet_uses_liquid_address_params() {
        assert_eq!(
            Network::Liquid.address_params(),
            &AddressParams::LIQUID
        );
    }

    #[test]
    fn names_match_serde() {
        for network in [Network::Liquid, Network::LiquidTestnet, Network::LiquidRegtest] {
            let json = serde_json::to_string(&network).unwrap();
            assert_eq!(json, format!("\"{}\"", network.as_str()));
            assert_eq!(network.to_string().parse::<Network>().unwrap(), network);
        }
    }
}
