//! `~/.swarm/config.toml` loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::catalog::ServerDescriptor;

const fn default_true() -> bool {
    true
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_root_markers() -> Vec<String> {
    vec![".git".to_string(), "*.sln".to_string()]
}

#[derive(Debug, Default, Deserialize)]
pub struct SwarmConfig {
    #[serde(default)]
    pub lsp: LspConfig,
}

/// The `[lsp]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct LspConfig {
    /// Base directory for downloaded servers.
    pub install_dir: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Glob patterns naming files or directories that mark a workspace root.
    #[serde(default = "default_root_markers")]
    pub root_markers: Vec<String>,
    #[serde(default = "default_true")]
    pub builtin_servers: bool,
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            install_dir: None,
            request_timeout_secs: default_timeout_secs(),
            handshake_timeout_secs: default_timeout_secs(),
            root_markers: default_root_markers(),
            builtin_servers: true,
            servers: Vec::new(),
        }
    }
}

impl LspConfig {
    /// `install_dir` if set, otherwise `<data_local_dir>/Swarm/LspServers`.
    #[must_use]
    pub fn resolved_install_dir(&self) -> PathBuf {
        if let Some(dir) = &self.install_dir {
            return dir.clone();
        }
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("Swarm")
            .join("LspServers")
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Read { path, .. } | Self::Parse { path, .. } => path,
        }
    }
}

impl SwarmConfig {
    /// Load from the default location. `Ok(None)` when there is no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!(path = %path.display(), "Failed to read config: {err}");
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!(path = %path.display(), "Failed to parse config: {err}");
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".swarm").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PlatformKey;

    #[test]
    fn empty_file_uses_defaults() {
        let config: SwarmConfig = toml::from_str("").unwrap();
        assert_eq!(config.lsp.request_timeout_secs, 30);
        assert_eq!(config.lsp.handshake_timeout_secs, 30);
        assert_eq!(config.lsp.root_markers, vec![".git", "*.sln"]);
        assert!(config.lsp.builtin_servers);
        assert!(config.lsp.servers.is_empty());
        assert!(config.lsp.install_dir.is_none());
    }

    #[test]
    fn lsp_table_with_servers() {
        let config: SwarmConfig = toml::from_str(
            r#"
            [lsp]
            install_dir = "/opt/swarm/servers"
            request_timeout_secs = 5
            root_markers = [".hg", "Cargo.toml"]
            builtin_servers = false

            [[lsp.servers]]
            name = "rust-analyzer"
            version = "2024-06-03"
            language_ids = ["rust"]

            [lsp.servers.platforms.linux-x64]
            download_url = "https://example.invalid/ra.tar.gz"
            executable = "rust-analyzer"
            "#,
        )
        .unwrap();

        let lsp = config.lsp;
        assert_eq!(lsp.resolved_install_dir(), PathBuf::from("/opt/swarm/servers"));
        assert_eq!(lsp.request_timeout(), Duration::from_secs(5));
        assert_eq!(lsp.handshake_timeout(), Duration::from_secs(30));
        assert_eq!(lsp.root_markers, vec![".hg", "Cargo.toml"]);
        assert!(!lsp.builtin_servers);
        assert_eq!(lsp.servers.len(), 1);
        let key: PlatformKey = "linux-x64".parse().unwrap();
        assert!(lsp.servers[0].binary_for(key).is_some());
    }

    #[test]
    fn default_install_dir_ends_with_swarm_layout() {
        let dir = LspConfig::default().resolved_install_dir();
        assert!(dir.ends_with("Swarm/LspServers"));
    }

    #[test]
    fn load_from_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let loaded = SwarmConfig::load_from(&tmp.path().join("config.toml")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[lsp\nbroken").unwrap();

        let err = SwarmConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), path.as_path());
    }

    #[test]
    fn load_from_reads_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[lsp]\nhandshake_timeout_secs = 12\n").unwrap();

        let config = SwarmConfig::load_from(&path).unwrap().unwrap();
        assert_eq!(config.lsp.handshake_timeout(), Duration::from_secs(12));
    }
}
