//! # Configuration Utilities
//!
//! Cluster-wide settings shared by every binary. All fields have defaults, so
//! a config file is optional and may list only what it overrides.
//!
//! ```toml
//! [endpoints]
//! reference = "10.0.0.5:5559"
//!
//! [timing]
//! heartbeat_interval_secs = 5
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Load a TOML configuration file and deserialize it into the specified type.
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content =
        fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
    let config: T =
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path))?;
    Ok(config)
}

/// Complete cluster configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub endpoints: EndpointsConfig,
    pub timing: TimingConfig,
    pub storage: StorageConfig,
}

impl ClusterConfig {
    /// Load from `path` when given, otherwise use defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config: Self = match path {
            Some(path) => load_config(path)?,
            None => Self::default(),
        };
        config.timing.validate()?;
        Ok(config)
    }
}

/// Network addresses of the relays and the reference service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Where clients send requests
    pub router_frontend: String,
    /// Where chat servers attach to receive requests
    pub router_backend: String,
    /// Where publishers send to the bus
    pub bus_publish: String,
    /// Where subscribers receive from the bus
    pub bus_subscribe: String,
    /// Reference (rank/list/heartbeat) service
    pub reference: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            router_frontend: "127.0.0.1:5555".to_string(),
            router_backend: "127.0.0.1:5556".to_string(),
            bus_publish: "127.0.0.1:5557".to_string(),
            bus_subscribe: "127.0.0.1:5558".to_string(),
            reference: "127.0.0.1:5559".to_string(),
        }
    }
}

/// Liveness, election, and heartbeat timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// A member is live if seen within this window
    pub liveness_window_secs: u64,
    /// Period of the coordinator re-evaluation task
    pub election_interval_secs: u64,
    /// Delay before announcing after a brand-new registration
    pub announce_delay_ms: u64,
    /// Period of chat-server heartbeats to the reference service
    pub heartbeat_interval_secs: u64,
    /// Upper bound on one wait of the chat server's main loop
    pub poll_timeout_ms: u64,
    /// How long a request waits for its reply
    pub request_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: 30,
            election_interval_secs: 5,
            announce_delay_ms: 1000,
            heartbeat_interval_secs: 10,
            poll_timeout_ms: 1000,
            request_timeout_ms: 5000,
        }
    }
}

impl TimingConfig {
    /// Reject zero periods and timeouts.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("liveness_window_secs", self.liveness_window_secs),
            ("election_interval_secs", self.election_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("poll_timeout_ms", self.poll_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ];
        for (field, value) in fields {
            if value == 0 {
                bail!("timing.{} must be greater than zero", field);
            }
        }
        Ok(())
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    pub fn election_interval(&self) -> Duration {
        Duration::from_secs(self.election_interval_secs)
    }

    pub fn announce_delay(&self) -> Duration {
        Duration::from_millis(self.announce_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Where a chat server keeps its JSON files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[endpoints]\nreference = \"10.0.0.5:5559\"\n\n[timing]\nheartbeat_interval_secs = 2"
        )
        .unwrap();

        let config = ClusterConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.endpoints.reference, "10.0.0.5:5559");
        assert_eq!(config.endpoints.bus_publish, "127.0.0.1:5557");
        assert_eq!(config.timing.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.timing.liveness_window(), Duration::from_secs(30));
        assert_eq!(config.storage.data_dir, PathBuf::from("data"));
    }

    #[test]
    fn zero_periods_are_rejected() {
        for field in ["election_interval_secs", "heartbeat_interval_secs", "poll_timeout_ms"] {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "[timing]\n{} = 0", field).unwrap();

            let err = ClusterConfig::load(file.path().to_str()).unwrap_err();
            assert!(err.to_string().contains(field), "{}: {}", field, err);
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(ClusterConfig::default().timing.validate().is_ok());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ClusterConfig::load(Some("/definitely/not/here.toml")).is_err());
    }
}
