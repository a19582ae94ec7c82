use std::path::PathBuf;

use quagga_chain::parameters::Network;
use serde::{Deserialize, Serialize};

/// Configuration for the state service.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The root directory for storing cached data.
    ///
    /// Cached data includes any state that can be replayed. Cleaning this
    /// directory only causes a full rebuild from the network.
    pub cache_dir: PathBuf,

    /// Whether to use an ephemeral database.
    ///
    /// Ephemeral databases are tied to the lifetime of the process and
    /// leave nothing behind; they are the right choice for tests.
    pub ephemeral: bool,
}

impl Config {
    /// The data directory for `network`, under the cache root.
    pub fn data_dir(&self, network: Network) -> PathBuf {
        let net_dir = match network {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        };
        self.cache_dir.join("state").join(net_dir)
    }

    /// Generate the appropriate `sled::Config` for `network`, based on the
    /// provided `quagga_state::Config`.
    pub fn sled_config(&self, network: Network) -> sled::Config {
        let config = sled::Config::default()
            .path(self.data_dir(network).join("index"))
            .temporary(self.ephemeral);
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join("cache"))
                .join("quagga"),
            ephemeral: false,
        }
    }
}
