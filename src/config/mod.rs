//! Configuration management for anywake nodes

pub mod file;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::peer::PeerId;
use crate::status::DEFAULT_PROBE_PORTS;
use crate::wake::DEFAULT_WAKE_ARGS;
use crate::{Error, Result};

use self::file::AnywakeConfigFile;

/// File name of the registry inside the data directory
pub const REGISTRY_FILE: &str = "devices.json";

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity announced to peers and stamped on local writes
    pub peer_id: PeerId,

    /// Directory holding the registry file
    pub data_dir: PathBuf,

    /// Whether this process owns the wake capability
    pub wake_capable: bool,

    /// Accept peer links here
    pub listen: Option<SocketAddr>,

    /// Keep links to these peers, redialing with backoff
    pub connect: Vec<String>,

    pub wake: WakeConfig,

    pub status: StatusConfig,

    /// Periodic snapshot refresh (default: 900 = 15 minutes)
    pub snapshot_interval: Duration,
}

/// Wake dispatch configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Wait for a forwarded result this long (default: 5 s)
    pub timeout: Duration,

    /// Remember handled request IDs this long (default: 60 s)
    pub dedup_retention: Duration,

    /// Wake program resolved on `PATH`
    pub command: String,

    pub args: Vec<String>,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            timeout: crate::wake::DEFAULT_WAKE_TIMEOUT,
            dedup_retention: Duration::from_secs(crate::wake::dedup::DEDUP_TTL_SECS),
            command: "wakeonlan".to_string(),
            args: DEFAULT_WAKE_ARGS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Status checker configuration
#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// Probe cadence; zero disables the checker
    pub interval: Duration,

    pub probe_ports: Vec<u16>,

    pub probe_timeout: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            interval: crate::status::DEFAULT_STATUS_INTERVAL,
            probe_ports: DEFAULT_PROBE_PORTS.to_vec(),
            probe_timeout: Duration::from_millis(1500),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            data_dir: default_data_dir(),
            wake_capable: false,
            listen: None,
            connect: Vec::new(),
            wake: WakeConfig::default(),
            status: StatusConfig::default(),
            snapshot_interval: Duration::from_secs(900),
        }
    }
}

/// Hostname, or a random ID when it cannot be read
fn default_peer_id() -> PeerId {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty());
    PeerId::new(host.unwrap_or_else(|| format!("anywake-{}", uuid::Uuid::new_v4())))
}

/// Default data directory: `~/.local/share/anywake`
fn default_data_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".local/share/anywake"),
        |d| d.data_dir().join("anywake"),
    )
}

fn parse_bool(value: &str) -> bool {
    value == "true" || value == "1"
}

impl Config {
    /// Load configuration: environment over TOML file over defaults
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path);
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Merge a parsed file with environment lookups
    ///
    /// # Errors
    ///
    /// Returns `Config` if the listen address does not parse
    pub fn resolve(fc: AnywakeConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let peer_id = env("ANYWAKE_PEER_ID")
            .or(fc.peer_id)
            .filter(|p| !p.trim().is_empty())
            .map_or(defaults.peer_id, PeerId::new);

        let data_dir = env("ANYWAKE_DATA_DIR")
            .or(fc.data_dir)
            .map_or(defaults.data_dir, PathBuf::from);

        let wake_capable = env("ANYWAKE_WAKE_CAPABLE")
            .map(|v| parse_bool(&v))
            .or(fc.wake_capable)
            .unwrap_or(defaults.wake_capable);

        let listen = env("ANYWAKE_LISTEN")
            .or(fc.listen)
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|e| Error::Config(format!("invalid listen address '{addr}': {e}")))
            })
            .transpose()?;

        let connect = env("ANYWAKE_CONNECT")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .or(fc.connect)
            .unwrap_or_default();

        let wake = WakeConfig {
            timeout: env("ANYWAKE_WAKE_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .or(fc.wake.timeout_ms)
                .map_or(defaults.wake.timeout, Duration::from_millis),
            dedup_retention: fc
                .wake
                .dedup_retention_secs
                .map_or(defaults.wake.dedup_retention, Duration::from_secs),
            command: env("ANYWAKE_WAKE_COMMAND")
                .or(fc.wake.command)
                .unwrap_or(defaults.wake.command),
            args: fc.wake.args.unwrap_or(defaults.wake.args),
        };

        let status = StatusConfig {
            interval: env("ANYWAKE_STATUS_INTERVAL")
                .and_then(|s| s.parse().ok())
                .or(fc.status.interval_secs)
                .map_or(defaults.status.interval, Duration::from_secs),
            probe_ports: fc.status.probe_ports.unwrap_or(defaults.status.probe_ports),
            probe_timeout: fc
                .status
                .probe_timeout_ms
                .map_or(defaults.status.probe_timeout, Duration::from_millis),
        };

        let snapshot_interval = env("ANYWAKE_SNAPSHOT_INTERVAL")
            .and_then(|s| s.parse().ok())
            .or(fc.snapshot.interval_secs)
            .map_or(defaults.snapshot_interval, Duration::from_secs);

        Ok(Self {
            peer_id,
            data_dir,
            wake_capable,
            listen,
            connect,
            wake,
            status,
            snapshot_interval,
        })
    }

    /// Path of the registry file
    #[must_use]
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join(REGISTRY_FILE)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = Config::resolve(AnywakeConfigFile::default(), no_env).unwrap();
        assert!(!config.wake_capable);
        assert!(config.listen.is_none());
        assert_eq!(config.wake.timeout, Duration::from_secs(5));
        assert_eq!(config.wake.dedup_retention, Duration::from_secs(60));
        assert_eq!(config.status.interval, Duration::from_secs(20));
        assert_eq!(config.snapshot_interval, Duration::from_secs(900));
        assert!(config.registry_path().ends_with(REGISTRY_FILE));
    }

    #[test]
    fn env_overrides_file() {
        let fc: AnywakeConfigFile = toml::from_str(
            r#"
            peer_id = "from-file"
            wake_capable = false
            connect = ["10.0.0.2:47800"]

            [wake]
            timeout_ms = 2000
            "#,
        )
        .unwrap();
        let env: HashMap<&str, &str> = HashMap::from([
            ("ANYWAKE_PEER_ID", "from-env"),
            ("ANYWAKE_WAKE_CAPABLE", "1"),
            ("ANYWAKE_CONNECT", "a:1, b:2"),
        ]);

        let config = Config::resolve(fc, |k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.peer_id, PeerId::new("from-env"));
        assert!(config.wake_capable);
        assert_eq!(config.connect, vec!["a:1", "b:2"]);
        assert_eq!(config.wake.timeout, Duration::from_millis(2000));
    }

    #[test]
    fn invalid_listen_address_is_config_error() {
        let fc = AnywakeConfigFile {
            listen: Some("not an address".to_string()),
            ..AnywakeConfigFile::default()
        };
        let err = Config::resolve(fc, no_env).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
