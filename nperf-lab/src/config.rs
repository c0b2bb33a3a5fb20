//! Configuration loading from nperf.toml
//!
//! Lab configuration can be specified in an `nperf.toml` file in the project root.
//! The configuration is automatically discovered by walking up from the current directory.

use clap::ValueEnum;
use nperf_ipc::{DEFAULT_CHANNEL_CAPACITY, MailboxConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::session::SessionConfig;

/// NPerf configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NperfConfig {
    /// Mailbox configuration
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Session configuration
    #[serde(default)]
    pub session: SessionSettings,
}

/// Where experiment workers run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Each experiment in a separate worker process (default)
    #[default]
    Process,
    /// Each experiment on a worker thread of the lab process
    Thread,
}

/// Mailbox settings shared by the lab and its workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Slot size in bytes; lab and worker must agree
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Longest single wait on a semaphore (e.g., "250ms")
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
    /// Give up on a worker send after this long (unset = wait forever)
    #[serde(default)]
    pub send_timeout: Option<String>,
    /// Fail a session whose live worker stays silent this long (unset = never)
    #[serde(default)]
    pub receive_timeout: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            poll_interval: default_poll_interval(),
            send_timeout: None,
            receive_timeout: None,
        }
    }
}

fn default_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
fn default_poll_interval() -> String {
    "250ms".to_string()
}

/// How sessions are scheduled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Let sessions drain concurrently instead of one at a time
    #[serde(default)]
    pub parallel: bool,
    /// How long a cancelled session waits for its drainer (e.g., "1s")
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace: String,
    /// Isolation mode: "process" or "thread"
    #[serde(default)]
    pub isolation: IsolationMode,
    /// Number of sessions run at once by `run_all` (unset = one per core)
    #[serde(default)]
    pub jobs: Option<usize>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            parallel: false,
            cancel_grace: default_cancel_grace(),
            isolation: IsolationMode::default(),
            jobs: None,
        }
    }
}

fn default_cancel_grace() -> String {
    "1s".to_string()
}

impl NperfConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let config_path = dir.join("nperf.toml");
            if config_path.exists() {
                return Self::load(&config_path).ok();
            }
            if !dir.pop() {
                break;
            }
        }
        None
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# NPerf Configuration

[channel]
# Slot size in bytes, shared with every worker
capacity = 65536
# Longest single wait before re-checking for cancellation
poll_interval = "250ms"
# Worker gives up on a send after this long (uncomment to enable)
# send_timeout = "30s"
# Fail a session whose worker is alive but silent (uncomment to enable)
# receive_timeout = "60s"

[session]
# Drain sessions concurrently instead of one at a time
parallel = false
# How long a cancelled session waits for its drainer
cancel_grace = "1s"
# Isolation mode: "process" or "thread"
isolation = "process"
# Sessions run at once (uncomment to enable)
# jobs = 4
"#
        .to_string()
    }

    /// Mailbox settings for sessions and workers
    pub fn mailbox(&self) -> anyhow::Result<MailboxConfig> {
        Ok(MailboxConfig {
            capacity: self.channel.capacity,
            poll_interval: Self::parse_duration(&self.channel.poll_interval)?,
        })
    }

    /// Worker send timeout, if configured
    pub fn send_timeout(&self) -> anyhow::Result<Option<Duration>> {
        self.channel
            .send_timeout
            .as_deref()
            .map(Self::parse_duration)
            .transpose()
    }

    /// Settings every session built from this configuration starts with
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig {
            mailbox: self.mailbox()?,
            parallel: self.session.parallel,
            receive_timeout: self
                .channel
                .receive_timeout
                .as_deref()
                .map(Self::parse_duration)
                .transpose()?,
            cancel_grace: Self::parse_duration(&self.session.cancel_grace)?,
        })
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m")
    pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        // Find where the number ends and unit begins
        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow::anyhow!("Invalid duration number: {}", num_part));
        }

        let nanos_per_unit: f64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" | "" => 1e9,
            "m" | "min" => 60e9,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok(Duration::from_nanos((value * nanos_per_unit) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NperfConfig::default();
        assert_eq!(config.channel.capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.channel.poll_interval, "250ms");
        assert!(!config.session.parallel);
        assert_eq!(config.session.isolation, IsolationMode::Process);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(NperfConfig::parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(NperfConfig::parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(NperfConfig::parse_duration("100us").unwrap(), Duration::from_micros(100));
        assert_eq!(NperfConfig::parse_duration("1000ns").unwrap(), Duration::from_nanos(1000));
        assert_eq!(NperfConfig::parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(NperfConfig::parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(NperfConfig::parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(NperfConfig::parse_duration("").is_err());
        assert!(NperfConfig::parse_duration("3 parsecs").is_err());
        assert!(NperfConfig::parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [channel]
            capacity = 4096
            receive_timeout = "10s"

            [session]
            parallel = true
            isolation = "thread"
        "#;

        let config: NperfConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.channel.capacity, 4096);
        assert!(config.session.parallel);
        assert_eq!(config.session.isolation, IsolationMode::Thread);
        // Defaults should still apply
        assert_eq!(config.session.cancel_grace, "1s");

        let session = config.session_config().unwrap();
        assert_eq!(session.mailbox.capacity, 4096);
        assert_eq!(session.mailbox.poll_interval, Duration::from_millis(250));
        assert_eq!(session.receive_timeout, Some(Duration::from_secs(10)));
        assert!(session.parallel);
        assert_eq!(config.send_timeout().unwrap(), None);
    }

    #[test]
    fn test_bad_duration_is_reported() {
        let config: NperfConfig = toml::from_str("[channel]\npoll_interval = \"soon\"").unwrap();
        assert!(config.session_config().is_err());
    }

    #[test]
    fn test_default_toml_parses() {
        let default_toml = NperfConfig::default_toml();
        let config: NperfConfig = toml::from_str(&default_toml).unwrap();
        assert_eq!(config.channel.capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.session.cancel_grace, "1s");
        assert!(config.session_config().is_ok());
    }
}
