//! TOML-backed configuration for all three services, plus the shared
//! load-with-defaults-and-validate pattern they follow.

use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize};

/// Loads a config file, falling back to `T::default()` if the file does not
/// exist. A present-but-unparsable file is still an error -- only a missing
/// file is tolerated.
pub fn load_config<T>(path: &Path) -> anyhow::Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(T::default());
    }
    let text = std::fs::read_to_string(path)?;
    let config: T = toml::from_str(&text)?;
    tracing::info!(path = %path.display(), "loaded config");
    Ok(config)
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

/// The address/port pair every service listens on.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self { address: default_bind_address(), port: 0 }
    }
}

impl ListenConfig {
    pub fn validate(&self, issues: &mut Vec<String>, label: &str) {
        if self.port == 0 {
            issues.push(format!("ERROR: {label}.port must be nonzero"));
        }
        if self.address.is_empty() {
            issues.push(format!("ERROR: {label}.address must not be empty"));
        }
    }
}

fn default_normal_timeout() -> u64 {
    // 2 hours, matching an always-on interactive session's idle grace.
    2 * 60 * 60
}

fn default_virgin_timeout() -> u64 {
    // Freshly-created, never-talked-to sessions are reclaimed much sooner.
    60
}

fn default_max_sessions() -> usize {
    64
}

/// Configuration for the session router.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub listen: ListenConfig,
    /// Idle timeout in seconds for sessions that have been talked to at
    /// least once.
    pub normal_timeout: u64,
    /// Idle timeout in seconds for sessions that were created but never
    /// talked to -- short, since they are cheap to discard and recreate.
    pub virgin_timeout: u64,
    pub max_sessions: usize,
    /// When the session pool is full and a new, conflicting session is
    /// requested: if true the new request evicts the old session, if false
    /// the new request is rejected.
    pub new_sessions_win: bool,
    /// Path to the subprocess binary started for each session.
    pub play_server_path: String,
    /// `host:port` of the file service, used to send `FORGET` notifications
    /// after a session without `SAVENN` semantics saves.
    pub file_server_address: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig { port: 8100, ..ListenConfig::default() },
            normal_timeout: default_normal_timeout(),
            virgin_timeout: default_virgin_timeout(),
            max_sessions: default_max_sessions(),
            new_sessions_win: true,
            play_server_path: "/usr/local/bin/forge-playserver".to_string(),
            file_server_address: "127.0.0.1:8101".to_string(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        self.listen.validate(&mut issues, "router.listen");
        if self.max_sessions == 0 {
            issues.push("ERROR: router.max_sessions must be nonzero".to_string());
        }
        if self.virgin_timeout == 0 {
            issues.push("WARNING: router.virgin_timeout is 0, sessions expire before first use".to_string());
        }
        if self.normal_timeout < self.virgin_timeout {
            issues.push("WARNING: router.normal_timeout is shorter than virgin_timeout".to_string());
        }
        if self.play_server_path.trim().is_empty() {
            issues.push("ERROR: router.play_server_path must not be empty".to_string());
        } else if !Path::new(&self.play_server_path).exists() {
            issues.push(format!(
                "WARNING: router.play_server_path {:?} does not exist on this host",
                self.play_server_path
            ));
        }
        if self.file_server_address.trim().is_empty() {
            issues.push("ERROR: router.file_server_address must not be empty".to_string());
        }
        if issues.iter().any(|i| i.starts_with("ERROR")) {
            Err(issues)
        } else if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_max_file_size() -> u64 {
    16 * 1024 * 1024
}

fn default_storage_root() -> String {
    "/var/lib/forge/files".to_string()
}

/// Which `DirectoryHandler` backend a filesystem root is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Local,
    Memory,
    ContentAddressed,
}

impl Default for StorageBackend {
    fn default() -> Self {
        StorageBackend::Local
    }
}

/// Configuration for the virtual file service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileServerConfig {
    pub listen: ListenConfig,
    pub backend: StorageBackend,
    pub storage_root: String,
    pub max_file_size: u64,
}

impl Default for FileServerConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig { port: 8101, ..ListenConfig::default() },
            backend: StorageBackend::default(),
            storage_root: default_storage_root(),
            max_file_size: default_max_file_size(),
        }
    }
}

impl FileServerConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        self.listen.validate(&mut issues, "fileserver.listen");
        if self.max_file_size == 0 {
            issues.push("ERROR: fileserver.max_file_size must be nonzero".to_string());
        }
        match self.backend {
            StorageBackend::Local | StorageBackend::ContentAddressed => {
                if self.storage_root.trim().is_empty() {
                    issues.push("ERROR: fileserver.storage_root must not be empty for this backend".to_string());
                } else if !Path::new(&self.storage_root).exists() {
                    issues.push(format!(
                        "WARNING: fileserver.storage_root {:?} does not exist yet, will be created on first use",
                        self.storage_root
                    ));
                }
            }
            StorageBackend::Memory => {}
        }
        if issues.iter().any(|i| i.starts_with("ERROR")) {
            Err(issues)
        } else if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_password_key() -> String {
    "insecure-default-key-change-me".to_string()
}

fn default_max_key_size() -> usize {
    256
}

fn default_max_value_size() -> usize {
    16 * 1024
}

fn default_max_total_size() -> usize {
    1024 * 1024
}

/// Configuration for the user account / token / key-value service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserServerConfig {
    pub listen: ListenConfig,
    /// Connection string for the external key/value store backing accounts,
    /// tokens, and per-user data. `"memory"` selects the in-process store
    /// used by tests.
    pub database_url: String,
    /// Key mixed into classic-scheme password hashes.
    pub password_key: String,
    pub max_user_data_key_size: usize,
    pub max_user_data_value_size: usize,
    pub max_user_data_total_size: usize,
}

impl Default for UserServerConfig {
    fn default() -> Self {
        Self {
            listen: ListenConfig { port: 8102, ..ListenConfig::default() },
            database_url: "memory".to_string(),
            password_key: default_password_key(),
            max_user_data_key_size: default_max_key_size(),
            max_user_data_value_size: default_max_value_size(),
            max_user_data_total_size: default_max_total_size(),
        }
    }
}

impl UserServerConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        self.listen.validate(&mut issues, "userserver.listen");
        if self.password_key == default_password_key() {
            issues.push("WARNING: userserver.password_key is the insecure default, set a real key in production".to_string());
        }
        if self.max_user_data_key_size == 0 {
            issues.push("ERROR: userserver.max_user_data_key_size must be nonzero".to_string());
        }
        if self.max_user_data_value_size == 0 {
            issues.push("ERROR: userserver.max_user_data_value_size must be nonzero".to_string());
        }
        if self.max_user_data_total_size < self.max_user_data_value_size {
            issues.push("ERROR: userserver.max_user_data_total_size must be at least max_user_data_value_size".to_string());
        }
        if self.database_url.trim().is_empty() {
            issues.push("ERROR: userserver.database_url must not be empty".to_string());
        }
        if issues.iter().any(|i| i.starts_with("ERROR")) {
            Err(issues)
        } else if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_error(issues: &[String]) -> bool {
        issues.iter().any(|i| i.starts_with("ERROR"))
    }

    fn has_warning(issues: &[String]) -> bool {
        issues.iter().any(|i| i.starts_with("WARNING"))
    }

    #[test]
    fn router_default_has_no_hard_errors() {
        let config = RouterConfig::default();
        match config.validate() {
            Ok(()) => {}
            Err(issues) => assert!(!has_error(&issues), "unexpected errors: {issues:?}"),
        }
    }

    #[test]
    fn router_zero_port_is_error() {
        let mut config = RouterConfig::default();
        config.listen.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues));
    }

    #[test]
    fn router_short_virgin_timeout_is_warning_not_error() {
        let mut config = RouterConfig::default();
        config.virgin_timeout = 0;
        let issues = config.validate().unwrap_err();
        assert!(has_warning(&issues));
        assert!(!has_error(&issues));
    }

    #[test]
    fn fileserver_memory_backend_skips_storage_root_checks() {
        let mut config = FileServerConfig::default();
        config.backend = StorageBackend::Memory;
        config.storage_root = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fileserver_local_backend_requires_storage_root() {
        let mut config = FileServerConfig::default();
        config.backend = StorageBackend::Local;
        config.storage_root = String::new();
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues));
    }

    #[test]
    fn userserver_default_password_key_warns() {
        let config = UserServerConfig::default();
        let issues = config.validate().unwrap_err();
        assert!(has_warning(&issues));
        assert!(!has_error(&issues));
    }

    #[test]
    fn userserver_total_size_below_value_size_is_error() {
        let mut config = UserServerConfig::default();
        config.max_user_data_total_size = 1;
        config.max_user_data_value_size = 100;
        let issues = config.validate().unwrap_err();
        assert!(has_error(&issues));
    }

    #[test]
    fn load_config_falls_back_to_defaults_for_missing_file() {
        let config: RouterConfig = load_config(Path::new("/nonexistent/forge-router.toml")).unwrap();
        assert_eq!(config.listen.port, 8100);
    }
}
