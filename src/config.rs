use std::path::{Path, PathBuf};

use clap::ValueEnum;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum Network {
    Bitcoin,
    Testnet,
    Testnet4,
    Signet,
    Regtest,
}

impl From<Network> for bitcoin::Network {
    fn from(value: Network) -> Self {
        match value {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Testnet4 => bitcoin::Network::Testnet4,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl Network {
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Bitcoin => 8332,
            Network::Testnet => 18332,
            Network::Testnet4 => 48332,
            Network::Signet => 38332,
            Network::Regtest => 18443,
        }
    }

    /// Per-network subdirectory name.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Network::Bitcoin => "bitcoin",
            Network::Testnet => "testnet",
            Network::Testnet4 => "testnet4",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        bitcoin::Network::from(*self).fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub network: Network,
    pub db_path: PathBuf,
    pub url: String,
}

impl Config {
    /// `db_dir` gets the network's subdirectory appended, `url` defaults to
    /// the local node's REST endpoint.
    pub fn new(network: Network, db_dir: &Path, url: Option<String>) -> Self {
        let url =
            url.unwrap_or_else(|| format!("http://localhost:{}", network.default_rpc_port()));
        Self {
            network,
            db_path: db_dir.join(network.dir_name()),
            url: url.trim_end_matches('/').to_owned(),
        }
    }
}
