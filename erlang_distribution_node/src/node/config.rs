use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::{codec::DEFAULT_MAX_FRAME_LENGTH, etf::DEFAULT_MAX_DEPTH, handshake::Timeouts};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// `alive@host`, or just `alive` to use this machine's hostname.
    pub name: String,
    pub listen: SocketAddr,
    /// Hidden nodes do not join the peer's global node list.
    pub hidden: bool,
    /// Picked at random when unset.
    pub creation: Option<u32>,
    pub low_version: u16,
    pub high_version: u16,
    pub handshake_timeout_ms: u64,
    pub lookup_timeout_ms: u64,
    pub tick_interval_ms: u64,
    pub max_term_depth: usize,
    pub max_frame_length: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: "rust".to_owned(),
            listen: SocketAddr::from(([0, 0, 0, 0], 0)),
            hidden: false,
            creation: None,
            low_version: 5,
            high_version: 6,
            handshake_timeout_ms: 5_000,
            lookup_timeout_ms: 5_000,
            tick_interval_ms: 15_000,
            max_term_depth: DEFAULT_MAX_DEPTH,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl NodeConfig {
    pub fn full_name(&self) -> anyhow::Result<String> {
        if self.name.is_empty() {
            bail!("node name is empty");
        }
        match self.name.split_once('@') {
            Some((alive, host)) if alive.is_empty() || host.is_empty() => {
                bail!("invalid node name {:?}", self.name)
            }
            Some(_) => Ok(self.name.clone()),
            None => {
                let host = hostname::get().context("while resolving the local hostname")?;
                Ok(format!("{}@{}", self.name, host.to_string_lossy()))
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.low_version < 5 || self.high_version > 6 || self.low_version > self.high_version {
            bail!(
                "unsupported handshake versions {}..={}, this node speaks 5..=6",
                self.low_version,
                self.high_version
            );
        }
        if self.tick_interval_ms == 0 {
            bail!("tick interval must be positive");
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            idle: Duration::from_millis(self.handshake_timeout_ms),
            lookup: Duration::from_millis(self.lookup_timeout_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names_are_kept() {
        let config = NodeConfig {
            name: "alice@example.com".into(),
            ..NodeConfig::default()
        };
        assert_eq!(config.full_name().unwrap(), "alice@example.com");
    }

    #[test]
    fn short_names_get_the_hostname() {
        let name = NodeConfig::default().full_name().unwrap();
        let (alive, host) = name.split_once('@').unwrap();
        assert_eq!(alive, "rust");
        assert!(!host.is_empty());
    }

    #[test]
    fn malformed_names_are_rejected() {
        for name in ["", "@host", "alice@"] {
            let config = NodeConfig {
                name: name.into(),
                ..NodeConfig::default()
            };
            assert!(config.full_name().is_err(), "{:?}", name);
        }
    }

    #[test]
    fn version_range_is_checked() {
        NodeConfig::default().validate().unwrap();
        for (low, high) in [(4, 6), (5, 7), (6, 5)] {
            let config = NodeConfig {
                low_version: low,
                high_version: high,
                ..NodeConfig::default()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn missing_fields_take_defaults() {
        use serde::de::value::{Error, MapDeserializer};

        let fields = vec![("name", "bob@host"), ("listen", "127.0.0.1:4370")];
        let deserializer: MapDeserializer<'_, _, Error> = MapDeserializer::new(fields.into_iter());
        let config = NodeConfig::deserialize(deserializer).unwrap();
        assert_eq!(config.name, "bob@host");
        assert_eq!(config.listen, "127.0.0.1:4370".parse::<SocketAddr>().unwrap());
        assert_eq!(config.tick_interval_ms, 15_000);
        assert_eq!((config.low_version, config.high_version), (5, 6));
    }
}
