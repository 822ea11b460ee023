//! Provider/domain/queue-depth configuration.
//!
//! A small `toml`-backed struct with defaults for every field, so that an
//! absent file or absent keys never prevent `FabricContext` initialization.

use std::env;
use std::path::Path;

use serde::Deserialize;

/// The default configuration file name, resolved relative to the working
/// directory; overridable via [`Config::from_env_or_default`].
pub const DEFAULT_CONFIG_PATH: &str = "rdma.cfg";

/// Environment variable naming an alternate configuration file.
pub const CONFIG_ENV_VAR: &str = "RDMA_TRANSPORT_CONFIG";

/// Fabric provider/domain/queue-depth configuration.
///
/// Immutable after construction; consumed once by
/// [`crate::fabric::FabricContext::initialize`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// libfabric provider name, e.g. `sockets`, `verbs`, `psm`, `usnic`.
    pub provider: String,
    /// Fabric domain (typically a NIC name), e.g. `eth0`.
    pub domain: String,
    /// Transmit queue depth.
    pub tx_depth: usize,
    /// Receive queue depth.
    pub rx_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: "sockets".to_owned(),
            domain: "eth0".to_owned(),
            tx_depth: 4096,
            rx_depth: 4096,
        }
    }
}

impl Config {
    /// Parses a TOML document at `path`. Unknown keys are ignored (serde's
    /// default behavior for a struct without `deny_unknown_fields`); keys
    /// missing from the document fall back to [`Config::default`].
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Loads from the file named by [`CONFIG_ENV_VAR`] if set, else from
    /// [`DEFAULT_CONFIG_PATH`] if that file exists, else falls back to
    /// built-in defaults without touching the filesystem at all.
    pub fn from_env_or_default() -> Self {
        let path = env::var(CONFIG_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        match Config::load(&path) {
            Ok(cfg) => cfg,
            Err(_) => Config::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.provider, "sockets");
        assert_eq!(cfg.domain, "eth0");
        assert_eq!(cfg.tx_depth, 4096);
        assert_eq!(cfg.rx_depth, 4096);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults_for_missing_keys() {
        let cfg: Config = toml::from_str("provider = \"verbs\"\n").unwrap();
        assert_eq!(cfg.provider, "verbs");
        assert_eq!(cfg.domain, "eth0");
        assert_eq!(cfg.tx_depth, 4096);
        assert_eq!(cfg.rx_depth, 4096);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg: Config = toml::from_str("provider = \"psm\"\nbogus_key = 42\n").unwrap();
        assert_eq!(cfg.provider, "psm");
    }

    #[test]
    fn full_document_overrides_every_field() {
        let doc = "provider = \"usnic\"\ndomain = \"eth1\"\ntx_depth = 256\nrx_depth = 512\n";
        let cfg: Config = toml::from_str(doc).unwrap();
        assert_eq!(
            cfg,
            Config {
                provider: "usnic".to_owned(),
                domain: "eth1".to_owned(),
                tx_depth: 256,
                rx_depth: 512,
            }
        );
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        std::env::remove_var(CONFIG_ENV_VAR);
        let cfg = Config::from_env_or_default();
        assert_eq!(cfg, Config::default());
    }
}
