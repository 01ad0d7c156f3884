use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub llm: LlmConfig,
    pub retention: RetentionConfig,
    pub jobs: JobsConfig,
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path of the SQLite file on disk
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Single-user application password
    pub app_password: String,
    /// Secret used to sign session tokens (min 32 chars)
    pub session_secret: String,
    pub token_expiration_hours: i64,
}

/// Settings for the summarization provider (OpenAI-compatible chat API)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_url: String,
    /// Comma-separated list of API keys, rotated round-robin
    pub api_keys: String,
    pub model: String,
    pub max_rpm: u32,
    pub timeout_secs: u64,
    pub summary_language: String,
    /// Circuit breaker: consecutive failures before opening
    pub failure_threshold: u32,
    /// Circuit breaker: seconds in OPEN before probing
    pub recovery_timeout_secs: i64,
    /// Circuit breaker: consecutive HALF successes before closing
    pub half_open_max_requests: u32,
    /// Path to the hot-reloadable prompt bundle
    pub prompts_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_post_age_days: i64,
    pub max_unread_days: i64,
    pub max_db_size_mb: i64,
    /// Hour of day (UTC) for the cleanup job
    pub cleanup_hour: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub feed_update_interval_minutes: u64,
    pub summary_lock_timeout_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub timeout_secs: u64,
    pub max_size_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub origins: String,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone)]
#[command(name = "lumen")]
#[command(version, about = "Lumen - feed aggregator with AI summaries")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// SQLite database path (overrides config file)
    #[arg(long, value_name = "PATH")]
    pub database_path: Option<String>,

    /// Session signing secret (overrides config file)
    #[arg(long, value_name = "SECRET")]
    pub session_secret: Option<String>,

    /// Logging level (overrides config file, e.g., "info,lumen=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Feed update interval in minutes (overrides config file)
    #[arg(long, value_name = "MINUTES")]
    pub feed_update_interval: Option<u64>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        // Pick up a local .env before reading the environment
        let _ = dotenvy::dotenv();

        let cli_args = CommandLineArgs::parse();

        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(&cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST / APP_SERVER_PORT
    /// - APP_DATABASE_PATH
    /// - APP_PASSWORD, APP_SESSION_SECRET, APP_TOKEN_EXPIRATION_HOURS
    /// - APP_LLM_API_URL, APP_LLM_API_KEYS (comma-separated), APP_LLM_MODEL,
    ///   APP_LLM_MAX_RPM, APP_LLM_TIMEOUT_SECS, APP_SUMMARY_LANGUAGE
    /// - APP_MAX_POST_AGE_DAYS, APP_MAX_UNREAD_DAYS, APP_MAX_DB_SIZE_MB, APP_CLEANUP_HOUR
    /// - APP_FEED_UPDATE_INTERVAL_MINUTES, APP_SUMMARY_LOCK_TIMEOUT_SECONDS
    /// - APP_LOG_LEVEL, APP_LOG_FILE
    /// - APP_CORS_ORIGINS
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("APP_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(path) = std::env::var("APP_DATABASE_PATH") {
            self.database.path = path;
        }
        if let Ok(password) = std::env::var("APP_PASSWORD") {
            self.auth.app_password = password;
        }
        if let Ok(secret) = std::env::var("APP_SESSION_SECRET") {
            self.auth.session_secret = secret;
        }
        if let Ok(hours) = std::env::var("APP_TOKEN_EXPIRATION_HOURS") {
            if let Ok(hours) = hours.parse() {
                self.auth.token_expiration_hours = hours;
            }
        }
        if let Ok(url) = std::env::var("APP_LLM_API_URL") {
            self.llm.api_url = url;
        }
        if let Ok(keys) = std::env::var("APP_LLM_API_KEYS") {
            self.llm.api_keys = keys;
        }
        if let Ok(model) = std::env::var("APP_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(rpm) = std::env::var("APP_LLM_MAX_RPM") {
            if let Ok(rpm) = rpm.parse() {
                self.llm.max_rpm = rpm;
            }
        }
        if let Ok(timeout) = std::env::var("APP_LLM_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse() {
                self.llm.timeout_secs = timeout;
            }
        }
        if let Ok(language) = std::env::var("APP_SUMMARY_LANGUAGE") {
            self.llm.summary_language = language;
        }
        if let Ok(days) = std::env::var("APP_MAX_POST_AGE_DAYS") {
            if let Ok(days) = days.parse() {
                self.retention.max_post_age_days = days;
            }
        }
        if let Ok(days) = std::env::var("APP_MAX_UNREAD_DAYS") {
            if let Ok(days) = days.parse() {
                self.retention.max_unread_days = days;
            }
        }
        if let Ok(mb) = std::env::var("APP_MAX_DB_SIZE_MB") {
            if let Ok(mb) = mb.parse() {
                self.retention.max_db_size_mb = mb;
            }
        }
        if let Ok(hour) = std::env::var("APP_CLEANUP_HOUR") {
            if let Ok(hour) = hour.parse() {
                self.retention.cleanup_hour = hour;
            }
        }
        if let Ok(minutes) = std::env::var("APP_FEED_UPDATE_INTERVAL_MINUTES") {
            if let Ok(minutes) = minutes.parse() {
                self.jobs.feed_update_interval_minutes = minutes;
            }
        }
        if let Ok(secs) = std::env::var("APP_SUMMARY_LOCK_TIMEOUT_SECONDS") {
            if let Ok(secs) = secs.parse() {
                self.jobs.summary_lock_timeout_seconds = secs;
            }
        }
        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(file) = std::env::var("APP_LOG_FILE") {
            self.logging.file = Some(file);
        }
        if let Ok(origins) = std::env::var("APP_CORS_ORIGINS") {
            self.cors.origins = origins;
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
        }
        if let Some(port) = args.server_port {
            self.server.port = port;
        }
        if let Some(path) = &args.database_path {
            self.database.path = path.clone();
        }
        if let Some(secret) = &args.session_secret {
            self.auth.session_secret = secret.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(minutes) = args.feed_update_interval {
            self.jobs.feed_update_interval_minutes = minutes;
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.auth.session_secret.len() < 32 {
            anyhow::bail!(
                "session secret must be at least 32 characters long (current: {})",
                self.auth.session_secret.len()
            );
        }
        if self.auth.app_password.is_empty() {
            anyhow::bail!("application password cannot be empty");
        }
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        if self.database.path.is_empty() {
            anyhow::bail!("Database path cannot be empty");
        }
        if self.llm.max_rpm == 0 {
            anyhow::bail!("llm.max_rpm must be > 0");
        }
        if self.retention.cleanup_hour > 23 {
            anyhow::bail!("retention.cleanup_hour must be 0-23");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl LlmConfig {
    /// API keys as an ordered list (comma-separated in config)
    pub fn api_key_list(&self) -> Vec<String> {
        self.api_keys
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "data/lumen.db".to_string() }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            app_password: String::new(),
            session_secret: String::new(),
            token_expiration_hours: 24,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.cerebras.ai/v1/chat/completions".to_string(),
            api_keys: String::new(),
            model: "llama-3.3-70b".to_string(),
            max_rpm: 20,
            timeout_secs: 30,
            summary_language: "Brazilian Portuguese".to_string(),
            failure_threshold: 5,
            recovery_timeout_secs: 300,
            half_open_max_requests: 3,
            prompts_path: "prompts.yaml".to_string(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { max_post_age_days: 365, max_unread_days: 90, max_db_size_mb: 1024, cleanup_hour: 3 }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self { feed_update_interval_minutes: 30, summary_lock_timeout_seconds: 300 }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { timeout_secs: 10, max_size_bytes: 10 * 1024 * 1024 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,lumen=debug".to_string(), file: Some("logs/lumen.log".to_string()) }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { origins: "*".to_string() }
    }
}

/// Prompt bundle loaded from prompts.yaml.
///
/// Re-read on every call so prompt edits take effect without a restart.
#[derive(Debug, Clone, Default)]
pub struct PromptBundle {
    prompts: HashMap<String, String>,
}

impl PromptBundle {
    pub fn load(path: &str) -> Self {
        let prompts = fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_yaml::from_str::<HashMap<String, String>>(&content).ok())
            .unwrap_or_default();
        Self { prompts }
    }

    pub fn get<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.prompts.get(key).map(String::as_str).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_short_secret() {
        let mut config = Config::default();
        config.auth.app_password = "hunter2".to_string();
        config.auth.session_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_complete_config() {
        let mut config = Config::default();
        config.auth.app_password = "hunter2".to_string();
        config.auth.session_secret = "0123456789abcdef0123456789abcdef".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn api_key_list_splits_and_trims() {
        let mut llm = LlmConfig::default();
        llm.api_keys = "key-a, key-b ,,key-c".to_string();
        assert_eq!(llm.api_key_list(), vec!["key-a", "key-b", "key-c"]);
    }
}
