use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Daemon tuning knobs, immutable after start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuneConfig {
    /// Session subpath of the managed group under each controller hierarchy
    pub root_cgroup: String,

    /// Mount point of the cgroup virtual filesystem
    pub cgroup_mount: PathBuf,

    /// Pin the daemon's own pages resident so the governor never swaps
    pub memory_lock: bool,

    /// How long the pool stays frozen per rebalance, in milliseconds
    pub freeze_duration_ms: u64,

    /// Control socket path; derived from the runtime directory when unset
    pub socket_path: Option<PathBuf>,
}

impl Default for TuneConfig {
    fn default() -> Self {
        TuneConfig {
            root_cgroup: format!("{}@uiapps", nix::unistd::getuid()),
            cgroup_mount: PathBuf::from("/sys/fs/cgroup"),
            memory_lock: false,
            freeze_duration_ms: 1000,
            socket_path: None,
        }
    }
}

impl TuneConfig {
    /// Load configuration from a TOML file; a missing file yields defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            info!("config file not found at {config_path:?}, using defaults");
            return Ok(Self::default());
        }

        let config_str = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file {config_path:?}"))?;

        let config: TuneConfig = toml::from_str(&config_str)
            .with_context(|| format!("failed to parse config file {config_path:?}"))?;

        Ok(config)
    }

    /// Default config path under the user's configuration directory.
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("swapsched").join("config.toml")
        } else {
            PathBuf::from("./swapsched.toml")
        }
    }

    pub fn freeze_duration(&self) -> Duration {
        Duration::from_millis(self.freeze_duration_ms)
    }

    /// Resolved control socket path.
    pub fn socket_path(&self) -> PathBuf {
        if let Some(path) = &self.socket_path {
            return path.clone();
        }
        if let Some(dir) = dirs::runtime_dir() {
            dir.join("swapsched.sock")
        } else {
            std::env::temp_dir().join(format!("swapsched-{}.sock", nix::unistd::getuid()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = TuneConfig::load(Path::new("/nonexistent/swapsched.toml")).unwrap();
        assert_eq!(config.cgroup_mount, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.freeze_duration(), Duration::from_secs(1));
        assert!(!config.memory_lock);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "root_cgroup = \"session@uiapps\"\nfreeze_duration_ms = 250\n"
        )
        .unwrap();

        let config = TuneConfig::load(file.path()).unwrap();
        assert_eq!(config.root_cgroup, "session@uiapps");
        assert_eq!(config.freeze_duration(), Duration::from_millis(250));
        assert_eq!(config.cgroup_mount, PathBuf::from("/sys/fs/cgroup"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "freeze_duration_ms = \"soon\"").unwrap();
        assert!(TuneConfig::load(file.path()).is_err());
    }

    #[test]
    fn explicit_socket_path_wins() {
        let config = TuneConfig {
            socket_path: Some(PathBuf::from("/run/custom.sock")),
            ..TuneConfig::default()
        };
        assert_eq!(config.socket_path(), PathBuf::from("/run/custom.sock"));
    }
}
