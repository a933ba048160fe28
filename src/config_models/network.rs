use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// The Bitcoin network this wallet operates on.
///
/// The wallet defaults to testnet3; mainnet is opt-in via `--mainnet`. Each
/// network fixes the default listener port for frontends and the default RPC
/// port of the upstream node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Testnet3,
    Mainnet,
}

impl Network {
    /// Default port this wallet listens on for frontend RPC connections.
    pub fn listen_port(&self) -> u16 {
        match self {
            Network::Testnet3 => 18332,
            Network::Mainnet => 8332,
        }
    }

    /// Default RPC port of the upstream full node.
    pub fn upstream_port(&self) -> u16 {
        match self {
            Network::Testnet3 => 18334,
            Network::Mainnet => 8334,
        }
    }

    /// The corresponding network parameter of the bitcoin primitives crate.
    pub fn as_bitcoin(&self) -> bitcoin::Network {
        match self {
            Network::Testnet3 => bitcoin::Network::Testnet,
            Network::Mainnet => bitcoin::Network::Bitcoin,
        }
    }

    /// Whether a decoded WIF key belongs to this network.
    pub fn matches_key(&self, kind: bitcoin::NetworkKind) -> bool {
        match self {
            Network::Testnet3 => kind == bitcoin::NetworkKind::Test,
            Network::Mainnet => kind == bitcoin::NetworkKind::Main,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Testnet3 => write!(f, "testnet3"),
            Network::Mainnet => write!(f, "mainnet"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(input: &str) -> Result<Network, Self::Err> {
        match input {
            "testnet3" | "testnet" => Ok(Network::Testnet3),
            "mainnet" => Ok(Network::Mainnet),
            _ => Err(format!("failed to parse {} as network", input)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_network_is_testnet3() {
        assert_eq!(Network::default(), Network::Testnet3);
        assert_eq!(Network::default().listen_port(), 18332);
        assert_eq!(Network::default().upstream_port(), 18334);
    }

    #[test]
    fn mainnet_ports() {
        assert_eq!(Network::Mainnet.listen_port(), 8332);
        assert_eq!(Network::Mainnet.upstream_port(), 8334);
    }
}
