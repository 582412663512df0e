use brokerdesk_core::config::{AppConfig, LoadOptions};
use secrecy::ExposeSecret;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.push(render("database.url", &config.database.url, "BROKERDESK_DATABASE_URL"));
    lines.push(render(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        "BROKERDESK_DATABASE_MAX_CONNECTIONS",
    ));
    lines.push(render("llm.gateway_url", &config.llm.gateway_url, "BROKERDESK_LLM_GATEWAY_URL"));
    lines.push(render("llm.api_key", &api_key, "BROKERDESK_LLM_API_KEY"));
    lines.push(render("llm.model", &config.llm.model, "BROKERDESK_LLM_MODEL"));
    lines.push(render(
        "server.bind_address",
        &config.server.bind_address,
        "BROKERDESK_SERVER_BIND_ADDRESS",
    ));
    lines.push(render(
        "server.api_port",
        &config.server.api_port.to_string(),
        "BROKERDESK_SERVER_API_PORT",
    ));
    lines.push(render(
        "server.health_check_port",
        &config.server.health_check_port.to_string(),
        "BROKERDESK_SERVER_HEALTH_CHECK_PORT",
    ));
    lines.push(render(
        "assistant.rate_limit_max_admissions",
        &config.assistant.rate_limit_max_admissions.to_string(),
        "BROKERDESK_ASSISTANT_RATE_LIMIT_MAX_ADMISSIONS",
    ));
    lines.push(render(
        "assistant.rate_limit_window_secs",
        &config.assistant.rate_limit_window_secs.to_string(),
        "BROKERDESK_ASSISTANT_RATE_LIMIT_WINDOW_SECS",
    ));
    lines.push(render(
        "assistant.hard_timeout_secs",
        &config.assistant.hard_timeout_secs.to_string(),
        "BROKERDESK_ASSISTANT_HARD_TIMEOUT_SECS",
    ));
    lines.push(render(
        "assistant.soft_fallback_ms",
        &config.assistant.soft_fallback_ms.to_string(),
        "BROKERDESK_ASSISTANT_SOFT_FALLBACK_MS",
    ));
    lines.push(render(
        "assistant.max_tool_iterations",
        &config.assistant.max_tool_iterations.to_string(),
        "BROKERDESK_ASSISTANT_MAX_TOOL_ITERATIONS",
    ));
    lines.push(render("logging.level", &config.logging.level, "BROKERDESK_LOGGING_LEVEL"));
    lines.push(render(
        "logging.format",
        &format!("{:?}", config.logging.format).to_lowercase(),
        "BROKERDESK_LOGGING_FORMAT",
    ));
    lines.join("\n")
}

fn render(key: &str, value: &str, env_var: &str) -> String {
    format!("  {key} = {value} (env override: {env_var})")
}

fn redact(secret: &str) -> String {
    if secret.len() <= 4 {
        return "****".to_string();
    }
    format!("{}****", &secret[..4])
}
