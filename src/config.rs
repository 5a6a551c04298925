//! Bridge configuration, loaded once at process start.
//!
//! Precedence is CLI flags > environment > TOML file > defaults; the merge
//! happens in `main`. The defaults match the deployment this bridge was
//! written for (host 192.168.8.208:2323, telnet account `cdi`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::handshake::Timing;

/// Top-level bridge config, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// TurboGOLDEN host address.
    pub host: String,
    /// TurboGOLDEN telnet port.
    pub port: u16,
    /// Address the WebSocket gateway binds.
    pub bind: SocketAddr,
    /// Gateway auth token. Required for non-loopback binds; generated when
    /// absent.
    pub token: Option<String>,
    /// Account the telnet layer logs into before the application starts.
    pub linux_user: String,
    /// TCP connect bound, seconds.
    pub connect_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "192.168.8.208".to_string(),
            port: 2323,
            bind: "0.0.0.0:8080".parse().expect("static bind address"),
            token: None,
            linux_user: "cdi".to_string(),
            connect_timeout_secs: 15,
        }
    }
}

impl BridgeConfig {
    /// Load config from a TOML file path. Returns None if the file doesn't
    /// exist.
    ///
    /// Warns if the file is world-readable, since it may carry the token.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// The connection/handshake parameters a session needs, detached from
    /// the serving surface.
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            linux_user: self.linux_user.clone(),
            timing: Timing::default(),
        }
    }
}

/// Everything a session needs to reach and log into the host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub linux_user: String,
    pub timing: Timing,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "config file {} is world-readable (mode {:o}). It may contain the \
             gateway token -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// True if the given file mode has the world-readable bit set.
///
/// Pure helper for testing; does not touch the filesystem.
#[cfg(unix)]
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
