use pinrdma_config::{Config, ConfigError};
use pinrdma_logging::LogConfig;
use pinrdma_mem::PinConfig;
use pinrdma_net_rdma::{RdmaConfig, SessionConfig};
use serde::{Deserialize, Serialize};

/// Everything the loopback tool reads from its TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub rdma: RdmaConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub pin: PinConfig,
}

impl Config for LoopbackConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.rdma.validate()?;
        self.session.validate()?;
        if self.pin.lock_limit_pages == 0 && !self.pin.ipc_lock {
            return Err(ConfigError::invalid(
                "pin.lock_limit_pages",
                "must be positive unless ipc_lock is set",
            ));
        }
        Ok(())
    }

    fn hot_update(&mut self, newer: &Self) {
        self.rdma.hot_update(&newer.rdma);
        self.session.hot_update(&newer.session);
        self.log.level = newer.log.level.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_gives_defaults() {
        let value: toml::Value = toml::from_str("").unwrap();
        let cfg = LoopbackConfig::from_toml(&value).unwrap();
        assert_eq!(cfg, LoopbackConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_sections_parse() {
        let doc = r#"
            [log]
            level = "debug"

            [session]
            handshake_timeout_ms = 500
            connect_retries = 20

            [pin]
            lock_limit_pages = 8
        "#;
        let value: toml::Value = toml::from_str(doc).unwrap();
        let cfg = LoopbackConfig::from_toml(&value).unwrap();
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.session.handshake_timeout_ms, 500);
        assert_eq!(cfg.session.connect_retries, 20);
        assert_eq!(cfg.pin.lock_limit_pages, 8);
        assert_eq!(cfg.rdma, RdmaConfig::default());
    }

    #[test]
    fn test_zero_lock_limit_rejected() {
        let mut cfg = LoopbackConfig::default();
        cfg.pin.lock_limit_pages = 0;
        assert!(cfg.validate().is_err());
        cfg.pin.ipc_lock = true;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_hot_update_keeps_log_sink() {
        let mut cfg = LoopbackConfig::default();
        let mut newer = LoopbackConfig::default();
        newer.log.level = "warn".into();
        newer.log.json_format = true;
        newer.session.connect_retries = 7;
        cfg.hot_update(&newer);
        assert_eq!(cfg.log.level, "warn");
        assert!(!cfg.log.json_format);
        assert_eq!(cfg.session.connect_retries, 7);
    }
}
