//! TOML configuration file loading
//!
//! Supports `~/.config/anywake/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct AnywakeConfigFile {
    /// Identity announced to peers (defaults to the hostname)
    pub peer_id: Option<String>,

    /// Where the registry is stored
    pub data_dir: Option<String>,

    /// Whether this process sends magic packets itself
    pub wake_capable: Option<bool>,

    /// Address to accept peer links on (e.g. "0.0.0.0:47800")
    pub listen: Option<String>,

    /// Peer addresses to keep a link with
    pub connect: Option<Vec<String>>,

    #[serde(default)]
    pub wake: WakeFileConfig,

    #[serde(default)]
    pub status: StatusFileConfig,

    #[serde(default)]
    pub snapshot: SnapshotFileConfig,
}

/// Wake dispatch configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// How long to wait for a forwarded wake result
    pub timeout_ms: Option<u64>,

    /// How long a handled request ID is remembered
    pub dedup_retention_secs: Option<u64>,

    /// Wake program (e.g. "wakeonlan")
    pub command: Option<String>,

    /// Program arguments with `{mac}`, `{host}` and `{port}` placeholders
    pub args: Option<Vec<String>>,
}

/// Status checker configuration
#[derive(Debug, Default, Deserialize)]
pub struct StatusFileConfig {
    pub interval_secs: Option<u64>,
    pub probe_ports: Option<Vec<u16>>,
    pub probe_timeout_ms: Option<u64>,
}

/// Snapshot publishing configuration
#[derive(Debug, Default, Deserialize)]
pub struct SnapshotFileConfig {
    /// Periodic refresh for widgets and complications
    pub interval_secs: Option<u64>,
}

/// Load the TOML config file from `path`, or the standard path
///
/// Returns `AnywakeConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> AnywakeConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return AnywakeConfigFile::default();
    };

    if !path.exists() {
        return AnywakeConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                AnywakeConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            AnywakeConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/anywake/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("anywake").join("config.toml"))
}
