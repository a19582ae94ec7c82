//! The daemon configuration file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};

use quagga_chain::parameters::Network;

/// The top-level TOML configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct QuaggadConfig {
    /// Which network to follow.
    pub network: Network,

    /// The address the framed-transport listener binds.
    pub bind: Option<SocketAddr>,

    /// A tracing filter, e.g. `info,quagga_consensus=debug`.
    pub tracing_filter: Option<String>,

    /// State storage configuration.
    pub state: quagga_state::Config,

    /// Framed transport configuration.
    pub transport: quagga_network::NetworkConfig,
}

impl QuaggadConfig {
    /// The default location of the config file under `datadir`.
    pub fn default_path(datadir: &Path) -> PathBuf {
        datadir.join("quaggad.toml")
    }

    /// Load the configuration, tolerating a missing file (defaults apply)
    /// but not a malformed one.
    pub fn load(path: &Path) -> Result<QuaggadConfig> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .wrap_err_with(|| eyre!("malformed config file {:?}", path)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Ok(QuaggadConfig::default())
            }
            Err(error) => Err(error).wrap_err_with(|| eyre!("cannot read config file {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        quagga_test::init();

        let dir = tempdir::TempDir::new("quaggad-config").unwrap();
        let config = QuaggadConfig::load(&QuaggadConfig::default_path(dir.path())).unwrap();
        assert_eq!(config.network, Network::Mainnet);
        assert!(config.bind.is_none());
    }

    #[test]
    fn toml_round_trip() {
        quagga_test::init();

        let dir = tempdir::TempDir::new("quaggad-config").unwrap();
        let path = QuaggadConfig::default_path(dir.path());
        std::fs::write(
            &path,
            r#"
network = "Testnet"
bind = "127.0.0.1:1235"
tracing_filter = "debug"

[state]
cache_dir = "/tmp/quagga-test"
ephemeral = true

[transport]
strict_services = true
"#,
        )
        .unwrap();

        let config = QuaggadConfig::load(&path).unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.bind, Some("127.0.0.1:1235".parse().unwrap()));
        assert!(config.state.ephemeral);
        assert!(config.transport.strict_services);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        quagga_test::init();

        let dir = tempdir::TempDir::new("quaggad-config").unwrap();
        let path = QuaggadConfig::default_path(dir.path());
        std::fs::write(&path, "no_such_option = true\n").unwrap();
        assert!(QuaggadConfig::load(&path).is_err());
    }
}
