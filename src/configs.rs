use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::certificate_chain_builder::DEFAULT_HOST_NAMES;
use crate::request_authorizer::DEFAULT_PROMPT_TIMEOUT;

pub const DEFAULT_CONFIG_FILE: &str = "localgate.toml";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub certificates: CertificateConfig,
    pub authorization: AuthorizationConfig,
    pub browser: BrowserConfig,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            certificates: CertificateConfig::default(),
            authorization: AuthorizationConfig::default(),
            browser: BrowserConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Listener settings
///
/// Ports are tried pairwise: `secure_ports[i]` with `insecure_ports[i]`,
/// moving to the next pair when either is taken.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_secure_ports")]
    pub secure_ports: Vec<u16>,
    #[serde(default = "default_insecure_ports")]
    pub insecure_ports: Vec<u16>,
    #[serde(default = "default_true")]
    pub enable_insecure: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            secure_ports: default_secure_ports(),
            insecure_ports: default_insecure_ports(),
            enable_insecure: true,
        }
    }
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_secure_ports() -> Vec<u16> {
    vec![8181, 8282, 8383, 8484]
}

fn default_insecure_ports() -> Vec<u16> {
    vec![8182, 8283, 8384, 8485]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificateConfig {
    #[serde(default = "default_host_names")]
    pub host_names: Vec<String>,
    /// Replaces the platform's candidate data directories when non-empty
    #[serde(default)]
    pub data_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub force_new: bool,
    /// Install the root into the OS trust store when it is not trusted yet
    #[serde(default = "default_true")]
    pub install_trust: bool,
    #[serde(default = "default_renew_within_days")]
    pub renew_within_days: i32,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            host_names: default_host_names(),
            data_dirs: Vec::new(),
            force_new: false,
            install_trust: true,
            renew_within_days: default_renew_within_days(),
        }
    }
}

fn default_host_names() -> Vec<String> {
    DEFAULT_HOST_NAMES.iter().map(|h| h.to_string()).collect()
}

fn default_renew_within_days() -> i32 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub block_anonymous: bool,
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,
    /// Root that caller identity certificates must chain to
    #[serde(default)]
    pub trusted_root: Option<PathBuf>,
    /// Deny every prompt instead of asking on the terminal
    #[serde(default)]
    pub headless: bool,
    /// Where allow/block lists live; defaults to the user data directory
    #[serde(default)]
    pub decision_dir: Option<PathBuf>,
}

impl AuthorizationConfig {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            block_anonymous: false,
            prompt_timeout_secs: default_prompt_timeout_secs(),
            trusted_root: None,
            headless: false,
            decision_dir: None,
        }
    }
}

fn default_prompt_timeout_secs() -> u64 {
    DEFAULT_PROMPT_TIMEOUT.as_secs()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrowserConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        let config: AppConfig = toml::from_str(&config_str)
            .context(format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load `path`, or the default file; a missing file means defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.server.secure_ports[0], 8181);
        assert_eq!(config.server.insecure_ports[0], 8182);
        assert_eq!(config.certificates.host_names, vec!["localhost", "localhost.localgate.dev"]);
        assert_eq!(config.authorization.prompt_timeout(), Duration::from_secs(600));
        assert!(config.browser.enabled);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("localgate.toml");
        fs::write(
            &path,
            r#"
log_level = "debug"

[server]
secure_ports = [9443]
enable_insecure = false

[authorization]
block_anonymous = true
prompt_timeout_secs = 30
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.server.secure_ports, vec![9443]);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(!config.server.enable_insecure);
        assert!(config.authorization.block_anonymous);
        assert_eq!(config.authorization.prompt_timeout(), Duration::from_secs(30));
        assert!(config.certificates.install_trust);
        assert_eq!(config.certificates.renew_within_days, 60);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[server\nhost = 1").unwrap();
        assert!(AppConfig::load(Some(&path)).is_err());
    }
}
