use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub assistant: AssistantConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub gateway_url: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub api_port: u16,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

/// Tunables for the streaming assistant pipeline.
#[derive(Clone, Debug)]
pub struct AssistantConfig {
    pub rate_limit_max_admissions: u32,
    pub rate_limit_window_secs: u64,
    pub hard_timeout_secs: u64,
    pub soft_fallback_ms: u64,
    pub max_tool_iterations: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_gateway_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://brokerdesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                gateway_url: "https://ai.gateway.lovable.dev/v1/chat/completions".to_string(),
                api_key: None,
                model: "google/gemini-2.5-flash".to_string(),
                timeout_secs: 60,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                api_port: 8090,
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            assistant: AssistantConfig {
                rate_limit_max_admissions: 10,
                rate_limit_window_secs: 15,
                hard_timeout_secs: 30,
                soft_fallback_ms: 2_000,
                max_tool_iterations: 5,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("brokerdesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(gateway_url) = llm.gateway_url {
                self.llm.gateway_url = gateway_url;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(api_port) = server.api_port {
                self.server.api_port = api_port;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(assistant) = patch.assistant {
            if let Some(max_admissions) = assistant.rate_limit_max_admissions {
                self.assistant.rate_limit_max_admissions = max_admissions;
            }
            if let Some(window_secs) = assistant.rate_limit_window_secs {
                self.assistant.rate_limit_window_secs = window_secs;
            }
            if let Some(hard_timeout_secs) = assistant.hard_timeout_secs {
                self.assistant.hard_timeout_secs = hard_timeout_secs;
            }
            if let Some(soft_fallback_ms) = assistant.soft_fallback_ms {
                self.assistant.soft_fallback_ms = soft_fallback_ms;
            }
            if let Some(max_tool_iterations) = assistant.max_tool_iterations {
                self.assistant.max_tool_iterations = max_tool_iterations;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("BROKERDESK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("BROKERDESK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("BROKERDESK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("BROKERDESK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("BROKERDESK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("BROKERDESK_LLM_GATEWAY_URL") {
            self.llm.gateway_url = value;
        }
        if let Some(value) = read_env("BROKERDESK_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("BROKERDESK_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("BROKERDESK_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("BROKERDESK_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("BROKERDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("BROKERDESK_SERVER_API_PORT") {
            self.server.api_port = parse_u16("BROKERDESK_SERVER_API_PORT", &value)?;
        }
        if let Some(value) = read_env("BROKERDESK_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("BROKERDESK_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("BROKERDESK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("BROKERDESK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("BROKERDESK_ASSISTANT_RATE_LIMIT_MAX_ADMISSIONS") {
            self.assistant.rate_limit_max_admissions =
                parse_u32("BROKERDESK_ASSISTANT_RATE_LIMIT_MAX_ADMISSIONS", &value)?;
        }
        if let Some(value) = read_env("BROKERDESK_ASSISTANT_RATE_LIMIT_WINDOW_SECS") {
            self.assistant.rate_limit_window_secs =
                parse_u64("BROKERDESK_ASSISTANT_RATE_LIMIT_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("BROKERDESK_ASSISTANT_HARD_TIMEOUT_SECS") {
            self.assistant.hard_timeout_secs =
                parse_u64("BROKERDESK_ASSISTANT_HARD_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("BROKERDESK_ASSISTANT_SOFT_FALLBACK_MS") {
            self.assistant.soft_fallback_ms =
                parse_u64("BROKERDESK_ASSISTANT_SOFT_FALLBACK_MS", &value)?;
        }
        if let Some(value) = read_env("BROKERDESK_ASSISTANT_MAX_TOOL_ITERATIONS") {
            self.assistant.max_tool_iterations =
                parse_u32("BROKERDESK_ASSISTANT_MAX_TOOL_ITERATIONS", &value)?;
        }

        let log_level =
            read_env("BROKERDESK_LOGGING_LEVEL").or_else(|| read_env("BROKERDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("BROKERDESK_LOGGING_FORMAT").or_else(|| read_env("BROKERDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(gateway_url) = overrides.llm_gateway_url {
            self.llm.gateway_url = gateway_url;
        }
        if let Some(api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(api_key));
        }
        if let Some(model) = overrides.llm_model {
            self.llm.model = model;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_assistant(&self.assistant)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("brokerdesk.toml"), PathBuf::from("config/brokerdesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    let gateway_url = llm.gateway_url.trim();
    if !gateway_url.starts_with("http://") && !gateway_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "llm.gateway_url must start with http:// or https://".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if let Some(api_key) = &llm.api_key {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ConfigError::Validation(
                "llm.api_key must not be empty when provided".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.api_port == 0 {
        return Err(ConfigError::Validation(
            "server.api_port must be greater than zero".to_string(),
        ));
    }

    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.api_port == server.health_check_port {
        return Err(ConfigError::Validation(
            "server.api_port and server.health_check_port must differ".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_assistant(assistant: &AssistantConfig) -> Result<(), ConfigError> {
    if assistant.rate_limit_max_admissions == 0 {
        return Err(ConfigError::Validation(
            "assistant.rate_limit_max_admissions must be greater than zero".to_string(),
        ));
    }

    if assistant.rate_limit_window_secs == 0 || assistant.rate_limit_window_secs > 3_600 {
        return Err(ConfigError::Validation(
            "assistant.rate_limit_window_secs must be in range 1..=3600".to_string(),
        ));
    }

    if assistant.hard_timeout_secs == 0 || assistant.hard_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "assistant.hard_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if assistant.soft_fallback_ms == 0 {
        return Err(ConfigError::Validation(
            "assistant.soft_fallback_ms must be greater than zero".to_string(),
        ));
    }

    if assistant.soft_fallback_ms >= assistant.hard_timeout_secs * 1_000 {
        return Err(ConfigError::Validation(
            "assistant.soft_fallback_ms must be shorter than the hard timeout".to_string(),
        ));
    }

    if assistant.max_tool_iterations == 0 {
        return Err(ConfigError::Validation(
            "assistant.max_tool_iterations must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    assistant: Option<AssistantPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    gateway_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    api_port: Option<u16>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AssistantPatch {
    rate_limit_max_admissions: Option<u32>,
    rate_limit_window_secs: Option<u64>,
    hard_timeout_secs: Option<u64>,
    soft_fallback_ms: Option<u64>,
    max_tool_iterations: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::PathBuf;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    fn load_from_toml(contents: &str) -> Result<AppConfig, ConfigError> {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write config");

        AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            ..LoadOptions::default()
        })
    }

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.assistant.rate_limit_max_admissions, 10);
        assert_eq!(config.assistant.rate_limit_window_secs, 15);
        assert_eq!(config.assistant.hard_timeout_secs, 30);
        assert_eq!(config.assistant.soft_fallback_ms, 2_000);
    }

    #[test]
    fn toml_patch_overrides_selected_sections() {
        let config = load_from_toml(
            r#"
            [database]
            url = "sqlite::memory:"

            [assistant]
            rate_limit_max_admissions = 3
            hard_timeout_secs = 20

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .expect("config should load");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.assistant.rate_limit_max_admissions, 3);
        assert_eq!(config.assistant.hard_timeout_secs, 20);
        // Untouched sections keep their defaults.
        assert_eq!(config.assistant.rate_limit_window_secs, 15);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some(PathBuf::from("/nonexistent/brokerdesk.toml")),
            require_file: true,
            ..LoadOptions::default()
        });
        assert!(matches!(result, Err(ConfigError::MissingConfigFile(_))));
    }

    #[test]
    fn programmatic_overrides_take_precedence() {
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                llm_model: Some("google/gemini-2.5-pro".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("config should load");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.llm.model, "google/gemini-2.5-pro");
    }

    #[test]
    fn rejects_non_sqlite_database_url() {
        let result = load_from_toml(
            r#"
            [database]
            url = "postgres://localhost/brokerdesk"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_soft_fallback_longer_than_hard_timeout() {
        let result = load_from_toml(
            r#"
            [assistant]
            hard_timeout_secs = 2
            soft_fallback_ms = 5000
            "#,
        );
        let message = match result {
            Err(ConfigError::Validation(message)) => message,
            other => panic!("expected validation error, got {other:?}"),
        };
        assert!(message.contains("soft_fallback_ms"));
    }

    #[test]
    fn rejects_colliding_server_ports() {
        let result = load_from_toml(
            r#"
            [server]
            api_port = 9000
            health_check_port = 9000
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_unknown_log_format() {
        let result = load_from_toml(
            r#"
            [logging]
            level = "verbose"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
