//! Queue-pair and session configuration.

use std::time::Duration;

use pinrdma_config::{Config, ConfigError};
use serde::{Deserialize, Serialize};

use crate::verbs::{Mtu, QpCaps};

/// Queue-pair parameters applied during the INIT/RTR/RTS transitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RdmaConfig {
    #[serde(default)]
    pub pkey_index: u16,

    /// Starting packet sequence number advertised in the handshake.
    #[serde(default)]
    pub start_psn: u32,

    /// Path MTU in bytes.
    #[serde(default = "default_path_mtu")]
    pub path_mtu: u32,

    #[serde(default = "default_min_rnr_timer")]
    pub min_rnr_timer: u8,

    /// Ack timeout exponent; the wait is `4.096us * 2^timeout`.
    #[serde(default = "default_timeout")]
    pub timeout: u8,

    #[serde(default = "default_retry")]
    pub retry_cnt: u8,

    #[serde(default = "default_retry")]
    pub rnr_retry: u8,

    #[serde(default = "default_one")]
    pub max_rd_atomic: u8,

    #[serde(default = "default_one")]
    pub max_dest_rd_atomic: u8,

    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,

    #[serde(default)]
    pub traffic_class: u8,

    /// Service level.
    #[serde(default)]
    pub sl: u8,

    #[serde(default = "default_cq_depth")]
    pub cq_depth: u32,

    #[serde(default = "default_max_wr")]
    pub max_send_wr: u32,

    #[serde(default = "default_max_wr")]
    pub max_recv_wr: u32,

    #[serde(default = "default_max_sge")]
    pub max_send_sge: u32,

    #[serde(default = "default_max_sge")]
    pub max_recv_sge: u32,
}

fn default_path_mtu() -> u32 {
    1024
}
fn default_min_rnr_timer() -> u8 {
    12
}
fn default_timeout() -> u8 {
    14
}
fn default_retry() -> u8 {
    7
}
fn default_one() -> u8 {
    1
}
fn default_hop_limit() -> u8 {
    255
}
fn default_cq_depth() -> u32 {
    1
}
fn default_max_wr() -> u32 {
    128
}
fn default_max_sge() -> u32 {
    30
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            pkey_index: 0,
            start_psn: 0,
            path_mtu: default_path_mtu(),
            min_rnr_timer: default_min_rnr_timer(),
            timeout: default_timeout(),
            retry_cnt: default_retry(),
            rnr_retry: default_retry(),
            max_rd_atomic: default_one(),
            max_dest_rd_atomic: default_one(),
            hop_limit: default_hop_limit(),
            traffic_class: 0,
            sl: 0,
            cq_depth: default_cq_depth(),
            max_send_wr: default_max_wr(),
            max_recv_wr: default_max_wr(),
            max_send_sge: default_max_sge(),
            max_recv_sge: default_max_sge(),
        }
    }
}

impl RdmaConfig {
    pub fn mtu(&self) -> Option<Mtu> {
        Mtu::from_bytes(self.path_mtu)
    }

    pub fn qp_caps(&self) -> QpCaps {
        QpCaps {
            max_send_wr: self.max_send_wr,
            max_recv_wr: self.max_recv_wr,
            max_send_sge: self.max_send_sge,
            max_recv_sge: self.max_recv_sge,
        }
    }
}

impl Config for RdmaConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu().is_none() {
            return Err(ConfigError::invalid("path_mtu", format!("{} is not a valid MTU", self.path_mtu)));
        }
        if self.timeout > 31 {
            return Err(ConfigError::invalid("timeout", "must be at most 31"));
        }
        if self.min_rnr_timer > 31 {
            return Err(ConfigError::invalid("min_rnr_timer", "must be at most 31"));
        }
        if self.retry_cnt > 7 || self.rnr_retry > 7 {
            return Err(ConfigError::invalid("retry_cnt", "retry counts are 3-bit fields"));
        }
        if self.start_psn > 0x00ff_ffff {
            return Err(ConfigError::invalid("start_psn", "PSN is 24 bits"));
        }
        if self.cq_depth == 0 {
            return Err(ConfigError::invalid("cq_depth", "must be positive"));
        }
        if self.max_send_wr == 0 || self.max_recv_wr == 0 || self.max_send_sge == 0 || self.max_recv_sge == 0 {
            return Err(ConfigError::invalid("max_send_wr", "queue capacities must be positive"));
        }
        Ok(())
    }

    /// QP parameters are read at session start, so everything may change.
    fn hot_update(&mut self, newer: &Self) {
        *self = newer.clone();
    }
}

/// Timeouts and control-channel behaviour of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Bound on connecting the control channel and each handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Bound on the completion loop. `None` waits until the peer leaves.
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: Option<u64>,

    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,

    #[serde(default = "default_true")]
    pub reuse_port: bool,

    /// Extra client connect attempts after a refused connection.
    #[serde(default)]
    pub connect_retries: u32,

    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,
}

fn default_handshake_timeout_ms() -> u64 {
    30_000
}
fn default_completion_timeout_ms() -> Option<u64> {
    Some(60_000)
}
fn default_listen_backlog() -> u32 {
    10
}
fn default_true() -> bool {
    true
}
fn default_connect_retry_interval_ms() -> u64 {
    100
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            completion_timeout_ms: default_completion_timeout_ms(),
            listen_backlog: default_listen_backlog(),
            reuse_port: true,
            connect_retries: 0,
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
        }
    }
}

impl SessionConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }
}

impl Config for SessionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::invalid("handshake_timeout_ms", "must be positive"));
        }
        if self.completion_timeout_ms == Some(0) {
            return Err(ConfigError::invalid("completion_timeout_ms", "must be positive when set"));
        }
        if self.listen_backlog == 0 {
            return Err(ConfigError::invalid("listen_backlog", "must be positive"));
        }
        Ok(())
    }

    fn hot_update(&mut self, newer: &Self) {
        self.handshake_timeout_ms = newer.handshake_timeout_ms;
        self.completion_timeout_ms = newer.completion_timeout_ms;
        self.connect_retries = newer.connect_retries;
        self.connect_retry_interval_ms = newer.connect_retry_interval_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_connection_parameters() {
        let cfg = RdmaConfig::default();
        assert_eq!(cfg.mtu(), Some(Mtu::Mtu1024));
        assert_eq!(cfg.min_rnr_timer, 12);
        assert_eq!(cfg.timeout, 14);
        assert_eq!(cfg.retry_cnt, 7);
        assert_eq!(cfg.rnr_retry, 7);
        assert_eq!(cfg.hop_limit, 255);
        assert_eq!(cfg.cq_depth, 1);
        assert_eq!(cfg.qp_caps().max_send_wr, 128);
        assert_eq!(cfg.qp_caps().max_recv_sge, 30);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let cfg = RdmaConfig { path_mtu: 1500, ..Default::default() };
        assert!(cfg.validate().unwrap_err().to_string().contains("path_mtu"));
        let cfg = RdmaConfig { retry_cnt: 8, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = SessionConfig { completion_timeout_ms: Some(0), ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let value: toml::Value = toml::from_str("timeout = 18\npath_mtu = 4096").unwrap();
        let cfg = RdmaConfig::from_toml(&value).unwrap();
        assert_eq!(cfg.timeout, 18);
        assert_eq!(cfg.mtu(), Some(Mtu::Mtu4096));
        assert_eq!(cfg.retry_cnt, 7);
    }

    #[test]
    fn test_session_hot_update_keeps_socket_options() {
        let mut cur = SessionConfig::default();
        let newer = SessionConfig {
            handshake_timeout_ms: 5,
            listen_backlog: 99,
            completion_timeout_ms: None,
            ..Default::default()
        };
        cur.hot_update(&newer);
        assert_eq!(cur.handshake_timeout(), Duration::from_millis(5));
        assert_eq!(cur.completion_timeout(), None);
        assert_eq!(cur.listen_backlog, 10);
    }

    #[test]
    fn test_serde_roundtrip() {
        let cfg = SessionConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
