//! Network identifier.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::TypesError;

/// Identifies which chain a node is connected to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkId {
    /// The production network.
    Main,
    /// The public test network.
    Test,
    /// Local regression-test network.
    Reg,
    /// Simulation network: no address gossip.
    Sim,
}

impl NetworkId {
    /// Default port for this network.
    pub fn default_port(&self) -> u16 {
        match self {
            Self::Main => 8333,
            Self::Test => 18333,
            Self::Reg => 18444,
            Self::Sim => 18555,
        }
    }

    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Test => "test",
            Self::Reg => "reg",
            Self::Sim => "sim",
        }
    }

    /// Simulation-only networks never exchange address announcements.
    pub fn is_simnet(&self) -> bool {
        matches!(self, Self::Sim)
    }
}

impl FromStr for NetworkId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "mainnet" => Ok(Self::Main),
            "test" | "testnet" => Ok(Self::Test),
            "reg" | "regtest" => Ok(Self::Reg),
            "sim" | "simnet" => Ok(Self::Sim),
            other => Err(TypesError::InvalidNetwork(other.to_string())),
        }
    }
}
