//! Configuration loading from `~/.vipnode/config.toml` with defaults.

use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vipnode_types::config::VipnodeConfig;

/// Where the configuration came from. Logged once tracing is up, since the
/// log level itself is read from the file.
#[derive(Debug)]
pub enum ConfigSource {
    Loaded(PathBuf),
    Missing(PathBuf),
    Invalid { path: PathBuf, error: String },
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            Self::Loaded(path) => info!(path = %path.display(), "Loaded configuration"),
            Self::Missing(path) => {
                info!(path = %path.display(), "Config file not found, using defaults")
            }
            Self::Invalid { path, error } => warn!(
                error = %error,
                path = %path.display(),
                "Failed to load config, using defaults"
            ),
        }
    }
}

/// The vipnode home directory, `~/.vipnode`.
pub fn vipnode_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".vipnode")
}

pub fn default_config_path() -> PathBuf {
    vipnode_home().join("config.toml")
}

/// Load configuration from a TOML file. Missing or unreadable files yield
/// the defaults.
pub fn load_config(path: Option<&Path>) -> (VipnodeConfig, ConfigSource) {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        return (VipnodeConfig::default(), ConfigSource::Missing(config_path));
    }
    let parsed = std::fs::read_to_string(&config_path)
        .map_err(|e| e.to_string())
        .and_then(|contents| toml::from_str::<VipnodeConfig>(&contents).map_err(|e| e.to_string()));
    match parsed {
        Ok(config) => (config, ConfigSource::Loaded(config_path)),
        Err(error) => (
            VipnodeConfig::default(),
            ConfigSource::Invalid {
                path: config_path,
                error,
            },
        ),
    }
}

/// Resolve a relative path under [`vipnode_home`].
pub fn resolve_home(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        vipnode_home().join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vipnode_types::config::WhitelistPolicy;

    #[test]
    fn test_partial_file_overrides_named_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"

[pool]
bind_addr = "0.0.0.0:9000"
whitelist_policy = "optimistic"

[client]
num_hosts = 5
"#
        )
        .unwrap();

        let (config, source) = load_config(Some(file.path()));
        assert!(matches!(source, ConfigSource::Loaded(_)));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.pool.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.pool.whitelist_policy, WhitelistPolicy::Optimistic);
        assert_eq!(config.pool.max_hosts_per_connect, 3);
        assert_eq!(config.client.num_hosts, 5);
        assert_eq!(config.host.keepalive_interval_secs, 60);
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pool\nbind_addr = ").unwrap();
        let (config, source) = load_config(Some(file.path()));
        assert!(matches!(source, ConfigSource::Invalid { .. }));
        assert_eq!(config.pool.bind_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, source) = load_config(Some(&dir.path().join("nope.toml")));
        assert!(matches!(source, ConfigSource::Missing(_)));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_resolve_home_keeps_absolute_paths() {
        let abs = std::env::temp_dir().join("k.key");
        assert_eq!(resolve_home(&abs), abs);
        assert!(resolve_home(Path::new("host.key")).ends_with(".vipnode/host.key"));
    }
}
