//! Configuration loading and validation for Warden.
//!
//! Loads configuration once at startup from `~/.warden/config.toml` (or the
//! path in `WARDEN_CONFIG`) with a few environment variable overrides.
//! There is no runtime mutation API: switching whitelist profiles means
//! restarting the process with a different file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum length of a whitelist pattern.
pub const MAX_PATTERN_LEN: usize = 256;

/// The root configuration structure.
///
/// Maps directly to `~/.warden/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Command, path, and URL-scheme whitelists
    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// Subprocess, file, and HTTP execution limits
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Network-layer URL policy
    #[serde(default)]
    pub network: NetworkConfig,

    /// Audit log configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Encrypted secrets vault configuration
    #[serde(default)]
    pub vault: VaultConfig,

    /// HTTP surface configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// Risk classification of a whitelist entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistConfig {
    /// Directories under which `base_dir` arguments must lie.
    #[serde(default = "default_path_roots")]
    pub path_roots: Vec<String>,

    #[serde(default = "default_url_schemes")]
    pub url_schemes: Vec<String>,

    #[serde(default = "default_commands")]
    pub commands: Vec<CommandEntryConfig>,
}

/// One command whitelist entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntryConfig {
    /// Exact executable name, or a regex when `regex = true`.
    pub pattern: String,

    #[serde(default)]
    pub regex: bool,

    #[serde(default)]
    pub risk_level: RiskLevel,

    /// Allows `|`, `||`, `&&`, and `;` between whitelisted commands.
    #[serde(default)]
    pub pipeline_safe: bool,
}

impl CommandEntryConfig {
    pub fn exact(pattern: &str, risk_level: RiskLevel) -> Self {
        Self {
            pattern: pattern.into(),
            regex: false,
            risk_level,
            pipeline_safe: false,
        }
    }
}

fn default_commands() -> Vec<CommandEntryConfig> {
    let mut commands: Vec<CommandEntryConfig> = ["ls", "cat", "head", "tail", "wc", "echo", "date", "pwd"]
        .into_iter()
        .map(|c| CommandEntryConfig::exact(c, RiskLevel::Low))
        .collect();
    commands.push(CommandEntryConfig {
        pipeline_safe: true,
        ..CommandEntryConfig::exact("grep", RiskLevel::Low)
    });
    commands.push(CommandEntryConfig::exact("wp", RiskLevel::Medium));
    commands.push(CommandEntryConfig::exact("git", RiskLevel::Medium));
    commands.push(CommandEntryConfig::exact("tar", RiskLevel::Medium));
    commands.push(CommandEntryConfig::exact("rsync", RiskLevel::High));
    commands
}

fn default_path_roots() -> Vec<String> {
    vec!["~/.warden/workspace".into()]
}

fn default_url_schemes() -> Vec<String> {
    vec!["http".into(), "https".into()]
}

impl Default for WhitelistConfig {
    fn default() -> Self {
        Self {
            path_roots: default_path_roots(),
            url_schemes: default_url_schemes(),
            commands: default_commands(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_max_file_bytes")]
    pub max_read_bytes: usize,

    #[serde(default = "default_max_file_bytes")]
    pub max_response_bytes: usize,

    #[serde(default = "default_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_timeout_secs() -> u64 {
    600
}
fn default_max_output_bytes() -> usize {
    1024 * 1024
}
fn default_max_file_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            max_read_bytes: default_max_file_bytes(),
            max_response_bytes: default_max_file_bytes(),
            http_timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Reject URLs whose host is a literal private, loopback, or link-local
    /// address (no DNS resolution is performed).
    #[serde(default)]
    pub block_private_hosts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_path")]
    pub path: String,

    /// Also emit every record through `tracing`.
    #[serde(default)]
    pub mirror_to_tracing: bool,
}

fn default_audit_path() -> String {
    "~/.warden/audit.jsonl".into()
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            mirror_to_tracing: false,
        }
    }
}

impl AuditConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_path(&self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    #[serde(default = "default_vault_path")]
    pub path: String,

    #[serde(default = "default_index_path")]
    pub index_path: String,

    /// Environment variable holding the vault passphrase.
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,

    /// File holding the vault passphrase (takes precedence over the env var).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase_file: Option<String>,

    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_vault_path() -> String {
    "~/.warden/secrets.vault".into()
}
fn default_index_path() -> String {
    "~/.warden/secrets.index.json".into()
}
fn default_passphrase_env() -> String {
    "WARDEN_VAULT_PASSPHRASE".into()
}
fn default_kdf_iterations() -> u32 {
    210_000
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            path: default_vault_path(),
            index_path: default_index_path(),
            passphrase_env: default_passphrase_env(),
            passphrase_file: None,
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

impl VaultConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_path(&self.path)
    }

    pub fn resolved_index_path(&self) -> PathBuf {
        expand_path(&self.index_path)
    }

    /// Read the passphrase from `passphrase_file`, falling back to the env var.
    ///
    /// Returns `None` when neither source yields a non-empty value.
    pub fn passphrase(&self) -> Option<String> {
        if let Some(file) = &self.passphrase_file
            && let Ok(content) = std::fs::read_to_string(expand_path(file))
        {
            let trimmed = content.trim_end_matches(['\r', '\n']);
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        std::env::var(&self.passphrase_env)
            .ok()
            .filter(|p| !p.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment variable holding comma-separated bearer tokens for `/v1`.
    #[serde(default = "default_tokens_env")]
    pub bearer_tokens_env: String,

    /// Requests per minute per client on `/v1`. `0` disables the limit.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: usize,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    42718
}
fn default_tokens_env() -> String {
    "WARDEN_API_TOKENS".into()
}
fn default_rate_limit() -> usize {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            bearer_tokens_env: default_tokens_env(),
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

impl ServerConfig {
    /// Bearer tokens from the configured env var. Empty = no auth.
    pub fn bearer_tokens(&self) -> Vec<String> {
        std::env::var(&self.bearer_tokens_env)
            .map(|raw| parse_token_list(&raw))
            .unwrap_or_default()
    }
}

fn parse_token_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

impl AppConfig {
    /// Load configuration from `WARDEN_CONFIG` or the default path.
    ///
    /// Environment overrides applied after parsing:
    /// - `WARDEN_AUDIT_PATH`
    /// - `WARDEN_VAULT_PATH`
    /// - `WARDEN_PORT`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Like [`load`](Self::load), but an explicit path wins over `WARDEN_CONFIG`.
    pub fn load_with(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = Self::config_path(path);
        let mut config = Self::load_from(&config_path)?;

        if let Ok(path) = std::env::var("WARDEN_AUDIT_PATH") {
            config.audit.path = path;
        }
        if let Ok(path) = std::env::var("WARDEN_VAULT_PATH") {
            config.vault.path = path;
        }
        if let Ok(port) = std::env::var("WARDEN_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::ValidationError(format!("WARDEN_PORT is not a port: {port}")))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// The file `load_with` reads: `explicit`, else `WARDEN_CONFIG`, else
    /// `~/.warden/config.toml`.
    pub fn config_path(explicit: Option<&Path>) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None => std::env::var("WARDEN_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| Self::config_dir().join("config.toml")),
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".warden")
    }

    /// Get the default workspace directory path.
    pub fn workspace_dir() -> PathBuf {
        Self::config_dir().join("workspace")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let wl = &self.whitelist;
        if wl.url_schemes.is_empty() {
            return Err(ConfigError::ValidationError(
                "whitelist.url_schemes must not be empty".into(),
            ));
        }
        if let Some(bad) = wl
            .url_schemes
            .iter()
            .find(|s| s.is_empty() || !s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c)))
        {
            return Err(ConfigError::ValidationError(format!(
                "invalid URL scheme '{bad}' (must be lowercase ASCII)"
            )));
        }
        for entry in &wl.commands {
            if entry.pattern.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "whitelist command pattern must not be empty".into(),
                ));
            }
            if entry.pattern.len() > MAX_PATTERN_LEN {
                return Err(ConfigError::ValidationError(format!(
                    "whitelist command pattern longer than {MAX_PATTERN_LEN} characters"
                )));
            }
        }

        let ex = &self.executor;
        if ex.default_timeout_secs == 0 || ex.max_timeout_secs == 0 || ex.http_timeout_secs == 0 {
            return Err(ConfigError::ValidationError("timeouts must be > 0".into()));
        }
        if ex.default_timeout_secs > ex.max_timeout_secs {
            return Err(ConfigError::ValidationError(
                "executor.default_timeout_secs must not exceed executor.max_timeout_secs".into(),
            ));
        }
        if ex.max_output_bytes == 0 || ex.max_read_bytes == 0 || ex.max_response_bytes == 0 {
            return Err(ConfigError::ValidationError("size caps must be > 0".into()));
        }

        if self.vault.kdf_iterations < 1_000 {
            return Err(ConfigError::ValidationError(
                "vault.kdf_iterations must be at least 1000".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if path == "~" {
        return dirs_home();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return dirs_home().join(rest);
    }
    PathBuf::from(path)
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for warden_core::Error {
    fn from(err: ConfigError) -> Self {
        warden_core::Error::Config {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 42718);
        assert_eq!(config.whitelist.url_schemes, vec!["http", "https"]);
        assert!(!config.network.block_private_hosts);
    }

    #[test]
    fn default_whitelist_marks_only_grep_pipeline_safe() {
        let config = AppConfig::default();
        let safe: Vec<_> = config
            .whitelist
            .commands
            .iter()
            .filter(|c| c.pipeline_safe)
            .map(|c| c.pattern.as_str())
            .collect();
        assert_eq!(safe, vec!["grep"]);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.server.port, config.server.port);
        assert_eq!(parsed.whitelist.commands, config.whitelist.commands);
    }

    #[test]
    fn parses_whitelist_entries() {
        let toml_str = r#"
[whitelist]
url_schemes = ["https"]
path_roots = ["/srv/data"]

[[whitelist.commands]]
pattern = "wp"
risk_level = "medium"

[[whitelist.commands]]
pattern = "git(-[a-z]+)?"
regex = true
risk_level = "high"
pipeline_safe = true
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.whitelist.url_schemes, vec!["https"]);
        assert_eq!(config.whitelist.commands.len(), 2);
        assert_eq!(config.whitelist.commands[0].risk_level, RiskLevel::Medium);
        assert!(!config.whitelist.commands[0].regex);
        assert!(config.whitelist.commands[1].regex);
        assert!(config.whitelist.commands[1].pipeline_safe);
        // Untouched sections fall back to defaults
        assert_eq!(config.executor.default_timeout_secs, 30);
    }

    #[test]
    fn empty_schemes_rejected() {
        let mut config = AppConfig::default();
        config.whitelist.url_schemes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn uppercase_scheme_rejected() {
        let mut config = AppConfig::default();
        config.whitelist.url_schemes = vec!["HTTPS".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn overlong_pattern_rejected() {
        let mut config = AppConfig::default();
        config.whitelist.commands.push(CommandEntryConfig::exact(
            &"a".repeat(MAX_PATTERN_LEN + 1),
            RiskLevel::Low,
        ));
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_timeout_above_max_rejected() {
        let mut config = AppConfig::default();
        config.executor.default_timeout_secs = 700;
        assert!(config.validate().is_err());
    }

    #[test]
    fn weak_kdf_rejected() {
        let mut config = AppConfig::default();
        config.vault.kdf_iterations = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/warden.toml"));
        let config = result.unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn invalid_file_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[executor\nbroken").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn passphrase_file_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pass");
        std::fs::write(&file, "from-file\n").unwrap();
        let vault = VaultConfig {
            passphrase_file: Some(file.to_string_lossy().into_owned()),
            passphrase_env: "WARDEN_TEST_UNSET_PASSPHRASE_VAR".into(),
            ..VaultConfig::default()
        };
        assert_eq!(vault.passphrase().as_deref(), Some("from-file"));
    }

    #[test]
    fn missing_passphrase_is_none() {
        let vault = VaultConfig {
            passphrase_env: "WARDEN_TEST_UNSET_PASSPHRASE_VAR".into(),
            ..VaultConfig::default()
        };
        assert!(vault.passphrase().is_none());
    }

    #[test]
    fn token_list_parsing() {
        assert_eq!(parse_token_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(parse_token_list("").is_empty());
    }

    #[test]
    fn tilde_expansion() {
        let expanded = expand_path("~/.warden/audit.jsonl");
        assert!(expanded.ends_with(".warden/audit.jsonl"));
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_path("/var/log/x"), PathBuf::from("/var/log/x"));
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = Path::new("/tmp/warden-explicit.toml");
        assert_eq!(AppConfig::config_path(Some(path)), path);
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("42718"));
        assert!(toml_str.contains("https"));
    }
}
