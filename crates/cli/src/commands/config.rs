use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use tradeback_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// One reported setting: dotted key, env override and rendered value.
struct Field {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

impl Field {
    fn new(key: &'static str, env_key: &'static str, value: impl ToString) -> Self {
        Self { key, env_key, value: value.to_string() }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(
            field.key,
            Some(field.env_key),
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key, &field.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let driver_api_key = config
        .driver
        .api_key
        .as_ref()
        .map(|key| redact_token(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    vec![
        Field::new("database.url", "TRADEBACK_DATABASE_URL", &config.database.url),
        Field::new(
            "database.max_connections",
            "TRADEBACK_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections,
        ),
        Field::new("database.timeout_secs", "TRADEBACK_DATABASE_TIMEOUT_SECS", config.database.timeout_secs),
        Field::new("driver.mode", "TRADEBACK_DRIVER_MODE", format!("{:?}", config.driver.mode)),
        Field::new(
            "driver.endpoint",
            "TRADEBACK_DRIVER_ENDPOINT",
            config.driver.endpoint.as_deref().unwrap_or("<unset>"),
        ),
        Field::new("driver.api_key", "TRADEBACK_DRIVER_API_KEY", driver_api_key),
        Field::new("driver.timeout_ms", "TRADEBACK_DRIVER_TIMEOUT_MS", config.driver.timeout_ms),
        Field::new("negotiation.max_rounds", "TRADEBACK_NEGOTIATION_MAX_ROUNDS", config.negotiation.max_rounds),
        Field::new(
            "negotiation.block_severity_threshold",
            "TRADEBACK_NEGOTIATION_BLOCK_SEVERITY_THRESHOLD",
            config.negotiation.block_severity_threshold,
        ),
        Field::new(
            "negotiation.failure_cooldown_secs",
            "TRADEBACK_NEGOTIATION_FAILURE_COOLDOWN_SECS",
            config.negotiation.failure_cooldown_secs,
        ),
        Field::new("execution.max_attempts", "TRADEBACK_EXECUTION_MAX_ATTEMPTS", config.execution.max_attempts),
        Field::new(
            "execution.task_timeout_ms",
            "TRADEBACK_EXECUTION_TASK_TIMEOUT_MS",
            config.execution.task_timeout_ms,
        ),
        Field::new(
            "execution.max_concurrent_tasks",
            "TRADEBACK_EXECUTION_MAX_CONCURRENT_TASKS",
            config.execution.max_concurrent_tasks,
        ),
        Field::new(
            "execution.fulfillment_deadline_secs",
            "TRADEBACK_EXECUTION_FULFILLMENT_DEADLINE_SECS",
            config.execution.fulfillment_deadline_secs,
        ),
        Field::new(
            "workers.default_daily_cap",
            "TRADEBACK_WORKERS_DEFAULT_DAILY_CAP",
            config.workers.default_daily_cap,
        ),
        Field::new("workers.cooldown_secs", "TRADEBACK_WORKERS_COOLDOWN_SECS", config.workers.cooldown_secs),
        Field::new("server.bind_address", "TRADEBACK_SERVER_BIND_ADDRESS", &config.server.bind_address),
        Field::new(
            "server.health_check_port",
            "TRADEBACK_SERVER_HEALTH_CHECK_PORT",
            config.server.health_check_port,
        ),
        Field::new("logging.level", "TRADEBACK_LOGGING_LEVEL", &config.logging.level),
        Field::new("logging.format", "TRADEBACK_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("tradeback.toml"), PathBuf::from("config/tradeback.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
