#![forbid(unsafe_code)]

//! Gateway configuration handling. Parses a TOML file into a strongly-typed
//! structure; required fields are validated once at startup and everything
//! else carries a default.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HazeError, HazeResult};
use crate::ratelimit::MapParams;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address of the mix server this gateway fronts.
    pub cmix_address: String,
    /// Listen port.
    pub port: u16,
    /// Advertised IP, when it differs from the bind address.
    pub override_public_ip: Option<String>,
    /// Bind IP.
    pub listening_address: String,

    /// Own TLS material.
    pub cert_path: String,
    pub key_path: String,
    /// Mix server TLS trust anchor.
    pub cmix_cert_path: String,
    /// NDF-signer trust anchor.
    pub scheduling_cert_path: String,
    /// Identity file.
    pub idf_path: String,
    /// Network definition file.
    pub ndf_path: String,

    /// Durable store location. Empty selects the in-memory store.
    pub db_path: String,
    pub db_username: String,
    pub db_password: String,
    pub db_name: String,
    pub db_address: String,

    /// Serialized known-rounds bitset location.
    pub known_rounds_path: String,

    pub dev_mode: bool,
    pub disable_gossip: bool,
    pub ignore_client_version: bool,

    /// Store GC cadence in seconds.
    pub cleanup_interval_secs: u64,
    /// Bloom filter epoch width in seconds.
    pub epoch_duration_secs: u64,
    /// How long filters and round messages are retained, in seconds.
    pub retention_period_secs: u64,

    pub rate_limit: RateLimitConfig,
    pub gossip: GossipConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub leaked_tokens: u32,
    pub leak_duration_ms: u64,
    pub poll_duration_ms: u64,
    pub bucket_max_age_ms: u64,
    /// Keys exempt from rate limiting.
    pub whitelist: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            capacity: 30,
            leaked_tokens: 3,
            leak_duration_ms: 1_000,
            poll_duration_ms: 10_000,
            bucket_max_age_ms: 600_000,
            whitelist: Vec::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn map_params(&self) -> MapParams {
        MapParams {
            capacity: self.capacity,
            leaked_tokens: self.leaked_tokens,
            leak_duration: Duration::from_millis(self.leak_duration_ms),
            poll_duration: Duration::from_millis(self.poll_duration_ms),
            bucket_max_age: Duration::from_millis(self.bucket_max_age_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    /// How long seen-message digests are buffered for deduplication.
    pub buffer_expiration_secs: u64,
    /// Cadence of the buffer monitor task.
    pub monitor_frequency_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        GossipConfig {
            buffer_expiration_secs: 300,
            monitor_frequency_secs: 150,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            cmix_address: String::new(),
            port: 22840,
            override_public_ip: None,
            listening_address: "0.0.0.0".to_string(),
            cert_path: String::new(),
            key_path: String::new(),
            cmix_cert_path: String::new(),
            scheduling_cert_path: String::new(),
            idf_path: String::new(),
            ndf_path: String::new(),
            db_path: String::new(),
            db_username: String::new(),
            db_password: String::new(),
            db_name: String::new(),
            db_address: String::new(),
            known_rounds_path: "known_rounds.cbor".to_string(),
            dev_mode: false,
            disable_gossip: false,
            ignore_client_version: false,
            cleanup_interval_secs: 300,
            epoch_duration_secs: 3 * 60 * 60,
            retention_period_secs: 7 * 24 * 60 * 60,
            rate_limit: RateLimitConfig::default(),
            gossip: GossipConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> HazeResult<Self> {
        let data = fs::read_to_string(&path)?;
        let cfg = toml::from_str::<GatewayConfig>(&data).map_err(HazeError::ConfigParse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Required fields that have no sensible default. Relaxed in dev mode so
    /// a bare config can drive a local loopback instance.
    pub fn validate(&self) -> HazeResult<()> {
        if self.dev_mode {
            return Ok(());
        }
        for (name, value) in [
            ("cmix_address", &self.cmix_address),
            ("cert_path", &self.cert_path),
            ("key_path", &self.key_path),
            ("cmix_cert_path", &self.cmix_cert_path),
            ("scheduling_cert_path", &self.scheduling_cert_path),
            ("idf_path", &self.idf_path),
            ("ndf_path", &self.ndf_path),
        ] {
            if value.is_empty() {
                return Err(HazeError::Invalid(format!("config field {name} is required")));
            }
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn epoch_duration_nanos(&self) -> i64 {
        self.epoch_duration_secs as i64 * 1_000_000_000
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_secs(self.retention_period_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_dev_config() {
        let cfg: GatewayConfig = toml::from_str(
            r#"
            dev_mode = true
            port = 9000

            [rate_limit]
            capacity = 5
            "#,
        )
        .unwrap();
        assert!(cfg.dev_mode);
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.rate_limit.capacity, 5);
        // Unset sections keep defaults.
        assert_eq!(cfg.gossip.buffer_expiration_secs, 300);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_missing_required_fields_outside_dev_mode() {
        let cfg = GatewayConfig::default();
        assert!(cfg.validate().is_err());
    }
}
