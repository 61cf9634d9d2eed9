use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::exchange::ActionType;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub transport: TransportConfig,
    pub driver: DriverConfig,
    pub negotiation: NegotiationConfig,
    pub execution: ExecutionConfig,
    pub workers: WorkersConfig,
    pub alerts: AlertsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

/// Retry policy for outbound sends on the messaging transport.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub mode: DriverMode,
    pub endpoint: Option<String>,
    pub api_key: Option<SecretString>,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NegotiationConfig {
    pub max_rounds: u32,
    pub initial_reliability: f64,
    pub reliability_decay: f64,
    pub block_severity_threshold: u8,
    pub confidence_floor: u8,
    pub max_term_quantity: u32,
    pub outbound_max_attempts: u32,
    pub failure_cooldown_secs: u64,
    /// Actions offered in the opening proposal, one unit each.
    pub opening_actions: Vec<ActionType>,
    /// Our content, the target of every requested term.
    pub our_target_reference: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionConfig {
    pub max_attempts: u32,
    pub task_timeout_ms: u64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub requeue_delay_ms: u64,
    pub max_concurrent_tasks: usize,
    pub fulfillment_deadline_secs: u64,
    pub deadline_sweep_secs: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkersConfig {
    pub default_daily_cap: u32,
    pub ban_signal_step: f64,
    pub ban_signal_recovery: f64,
    pub cooldown_threshold: f64,
    pub cooldown_secs: u64,
    pub max_cooldowns: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AlertsConfig {
    pub completion_rate_floor: f64,
    pub min_sample: u64,
    pub pool_exhaustion_threshold: u64,
    pub ban_spike_threshold: usize,
    pub ban_spike_window_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverMode {
    DryRun,
    Http,
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
    pub driver_mode: Option<DriverMode>,
    pub driver_endpoint: Option<String>,
    pub driver_api_key: Option<String>,
    pub max_rounds: Option<u32>,
    pub fulfillment_deadline_secs: Option<u64>,
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

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://tradeback.db".to_string(), max_connections: 5, timeout_secs: 30 }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { max_retries: 5, base_delay_ms: 500, max_delay_ms: 30_000 }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { mode: DriverMode::DryRun, endpoint: None, api_key: None, timeout_ms: 20_000 }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 4,
            initial_reliability: 0.5,
            reliability_decay: 0.8,
            block_severity_threshold: 70,
            confidence_floor: 40,
            max_term_quantity: 10,
            outbound_max_attempts: 3,
            failure_cooldown_secs: 24 * 60 * 60,
            opening_actions: vec![ActionType::View, ActionType::Endorse],
            our_target_reference: "our-channel".to_string(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            task_timeout_ms: 30_000,
            jitter_min_ms: 500,
            jitter_max_ms: 5_000,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            requeue_delay_ms: 30_000,
            max_concurrent_tasks: 8,
            fulfillment_deadline_secs: 72 * 60 * 60,
            deadline_sweep_secs: 60,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            default_daily_cap: 50,
            ban_signal_step: 0.2,
            ban_signal_recovery: 0.05,
            cooldown_threshold: 0.6,
            cooldown_secs: 60 * 60,
            max_cooldowns: 3,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            completion_rate_floor: 0.5,
            min_sample: 10,
            pool_exhaustion_threshold: 5,
            ban_spike_threshold: 3,
            ban_spike_window_secs: 60 * 60,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            health_check_port: 8080,
            graceful_shutdown_secs: 15,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Compact }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            transport: TransportConfig::default(),
            driver: DriverConfig::default(),
            negotiation: NegotiationConfig::default(),
            execution: ExecutionConfig::default(),
            workers: WorkersConfig::default(),
            alerts: AlertsConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for DriverMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dry_run" | "dry-run" | "dryrun" => Ok(Self::DryRun),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::Validation(format!(
                "unsupported driver mode `{other}` (expected dry_run|http)"
            ))),
        }
    }
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tradeback.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            set(&mut self.database.url, database.url);
            set(&mut self.database.max_connections, database.max_connections);
            set(&mut self.database.timeout_secs, database.timeout_secs);
        }

        if let Some(transport) = patch.transport {
            set(&mut self.transport.max_retries, transport.max_retries);
            set(&mut self.transport.base_delay_ms, transport.base_delay_ms);
            set(&mut self.transport.max_delay_ms, transport.max_delay_ms);
        }

        if let Some(driver) = patch.driver {
            set(&mut self.driver.mode, driver.mode);
            if let Some(endpoint) = driver.endpoint {
                self.driver.endpoint = Some(endpoint);
            }
            if let Some(driver_api_key_value) = driver.api_key {
                self.driver.api_key = Some(secret_value(driver_api_key_value));
            }
            set(&mut self.driver.timeout_ms, driver.timeout_ms);
        }

        if let Some(negotiation) = patch.negotiation {
            let target = &mut self.negotiation;
            set(&mut target.max_rounds, negotiation.max_rounds);
            set(&mut target.initial_reliability, negotiation.initial_reliability);
            set(&mut target.reliability_decay, negotiation.reliability_decay);
            set(&mut target.block_severity_threshold, negotiation.block_severity_threshold);
            set(&mut target.confidence_floor, negotiation.confidence_floor);
            set(&mut target.max_term_quantity, negotiation.max_term_quantity);
            set(&mut target.outbound_max_attempts, negotiation.outbound_max_attempts);
            set(&mut target.failure_cooldown_secs, negotiation.failure_cooldown_secs);
            set(&mut target.opening_actions, negotiation.opening_actions);
            set(&mut target.our_target_reference, negotiation.our_target_reference);
        }

        if let Some(execution) = patch.execution {
            let target = &mut self.execution;
            set(&mut target.max_attempts, execution.max_attempts);
            set(&mut target.task_timeout_ms, execution.task_timeout_ms);
            set(&mut target.jitter_min_ms, execution.jitter_min_ms);
            set(&mut target.jitter_max_ms, execution.jitter_max_ms);
            set(&mut target.retry_base_delay_ms, execution.retry_base_delay_ms);
            set(&mut target.retry_max_delay_ms, execution.retry_max_delay_ms);
            set(&mut target.requeue_delay_ms, execution.requeue_delay_ms);
            set(&mut target.max_concurrent_tasks, execution.max_concurrent_tasks);
            set(&mut target.fulfillment_deadline_secs, execution.fulfillment_deadline_secs);
            set(&mut target.deadline_sweep_secs, execution.deadline_sweep_secs);
        }

        if let Some(workers) = patch.workers {
            let target = &mut self.workers;
            set(&mut target.default_daily_cap, workers.default_daily_cap);
            set(&mut target.ban_signal_step, workers.ban_signal_step);
            set(&mut target.ban_signal_recovery, workers.ban_signal_recovery);
            set(&mut target.cooldown_threshold, workers.cooldown_threshold);
            set(&mut target.cooldown_secs, workers.cooldown_secs);
            set(&mut target.max_cooldowns, workers.max_cooldowns);
        }

        if let Some(alerts) = patch.alerts {
            let target = &mut self.alerts;
            set(&mut target.completion_rate_floor, alerts.completion_rate_floor);
            set(&mut target.min_sample, alerts.min_sample);
            set(&mut target.pool_exhaustion_threshold, alerts.pool_exhaustion_threshold);
            set(&mut target.ban_spike_threshold, alerts.ban_spike_threshold);
            set(&mut target.ban_spike_window_secs, alerts.ban_spike_window_secs);
        }

        if let Some(server) = patch.server {
            set(&mut self.server.bind_address, server.bind_address);
            set(&mut self.server.health_check_port, server.health_check_port);
            set(&mut self.server.graceful_shutdown_secs, server.graceful_shutdown_secs);
        }

        if let Some(logging) = patch.logging {
            set(&mut self.logging.level, logging.level);
            set(&mut self.logging.format, logging.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TRADEBACK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TRADEBACK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("TRADEBACK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TRADEBACK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("TRADEBACK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TRADEBACK_DRIVER_MODE") {
            self.driver.mode = value.parse()?;
        }
        if let Some(value) = read_env("TRADEBACK_DRIVER_ENDPOINT") {
            self.driver.endpoint = Some(value);
        }
        if let Some(value) = read_env("TRADEBACK_DRIVER_API_KEY") {
            self.driver.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("TRADEBACK_DRIVER_TIMEOUT_MS") {
            self.driver.timeout_ms = parse_env("TRADEBACK_DRIVER_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = read_env("TRADEBACK_NEGOTIATION_MAX_ROUNDS") {
            self.negotiation.max_rounds = parse_env("TRADEBACK_NEGOTIATION_MAX_ROUNDS", &value)?;
        }
        if let Some(value) = read_env("TRADEBACK_NEGOTIATION_BLOCK_SEVERITY_THRESHOLD") {
            self.negotiation.block_severity_threshold =
                parse_env("TRADEBACK_NEGOTIATION_BLOCK_SEVERITY_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("TRADEBACK_NEGOTIATION_FAILURE_COOLDOWN_SECS") {
            self.negotiation.failure_cooldown_secs =
                parse_env("TRADEBACK_NEGOTIATION_FAILURE_COOLDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("TRADEBACK_EXECUTION_MAX_ATTEMPTS") {
            self.execution.max_attempts = parse_env("TRADEBACK_EXECUTION_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("TRADEBACK_EXECUTION_TASK_TIMEOUT_MS") {
            self.execution.task_timeout_ms =
                parse_env("TRADEBACK_EXECUTION_TASK_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = read_env("TRADEBACK_EXECUTION_MAX_CONCURRENT_TASKS") {
            self.execution.max_concurrent_tasks =
                parse_env("TRADEBACK_EXECUTION_MAX_CONCURRENT_TASKS", &value)?;
        }
        if let Some(value) = read_env("TRADEBACK_EXECUTION_FULFILLMENT_DEADLINE_SECS") {
            self.execution.fulfillment_deadline_secs =
                parse_env("TRADEBACK_EXECUTION_FULFILLMENT_DEADLINE_SECS", &value)?;
        }

        if let Some(value) = read_env("TRADEBACK_WORKERS_DEFAULT_DAILY_CAP") {
            self.workers.default_daily_cap =
                parse_env("TRADEBACK_WORKERS_DEFAULT_DAILY_CAP", &value)?;
        }
        if let Some(value) = read_env("TRADEBACK_WORKERS_COOLDOWN_SECS") {
            self.workers.cooldown_secs = parse_env("TRADEBACK_WORKERS_COOLDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("TRADEBACK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TRADEBACK_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_env("TRADEBACK_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("TRADEBACK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_env("TRADEBACK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("TRADEBACK_LOGGING_LEVEL").or_else(|| read_env("TRADEBACK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TRADEBACK_LOGGING_FORMAT").or_else(|| read_env("TRADEBACK_LOG_FORMAT"));
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
        if let Some(driver_mode) = overrides.driver_mode {
            self.driver.mode = driver_mode;
        }
        if let Some(driver_endpoint) = overrides.driver_endpoint {
            self.driver.endpoint = Some(driver_endpoint);
        }
        if let Some(driver_api_key) = overrides.driver_api_key {
            self.driver.api_key = Some(secret_value(driver_api_key));
        }
        if let Some(max_rounds) = overrides.max_rounds {
            self.negotiation.max_rounds = max_rounds;
        }
        if let Some(deadline) = overrides.fulfillment_deadline_secs {
            self.execution.fulfillment_deadline_secs = deadline;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_transport(&self.transport)?;
        validate_driver(&self.driver)?;
        validate_negotiation(&self.negotiation)?;
        validate_execution(&self.execution)?;
        validate_workers(&self.workers)?;
        validate_alerts(&self.alerts)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tradeback.toml"), PathBuf::from("config/tradeback.toml")]
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

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(invalid(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
        ));
    }

    if database.max_connections == 0 {
        return Err(invalid("database.max_connections must be greater than zero"));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(invalid("database.timeout_secs must be in range 1..=300"));
    }

    Ok(())
}

fn validate_transport(transport: &TransportConfig) -> Result<(), ConfigError> {
    if transport.base_delay_ms > transport.max_delay_ms {
        return Err(invalid("transport.base_delay_ms must not exceed transport.max_delay_ms"));
    }
    Ok(())
}

fn validate_driver(driver: &DriverConfig) -> Result<(), ConfigError> {
    if driver.timeout_ms == 0 {
        return Err(invalid("driver.timeout_ms must be greater than zero"));
    }

    if driver.mode == DriverMode::Http {
        let endpoint = driver.endpoint.as_deref().map(str::trim).unwrap_or_default();
        if endpoint.is_empty() {
            return Err(invalid("driver.endpoint is required when driver.mode is `http`"));
        }
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(invalid("driver.endpoint must start with http:// or https://"));
        }
    }

    Ok(())
}

fn validate_negotiation(negotiation: &NegotiationConfig) -> Result<(), ConfigError> {
    if negotiation.max_rounds == 0 {
        return Err(invalid("negotiation.max_rounds must be greater than zero"));
    }
    if !(0.0..=1.0).contains(&negotiation.initial_reliability) {
        return Err(invalid("negotiation.initial_reliability must be in range 0.0..=1.0"));
    }
    if !(0.0..1.0).contains(&negotiation.reliability_decay) {
        return Err(invalid("negotiation.reliability_decay must be in range 0.0..1.0"));
    }
    if negotiation.block_severity_threshold > 100 || negotiation.confidence_floor > 100 {
        return Err(invalid(
            "negotiation.block_severity_threshold and confidence_floor must be at most 100",
        ));
    }
    if negotiation.max_term_quantity == 0 {
        return Err(invalid("negotiation.max_term_quantity must be greater than zero"));
    }
    if negotiation.outbound_max_attempts == 0 {
        return Err(invalid("negotiation.outbound_max_attempts must be greater than zero"));
    }
    if negotiation.opening_actions.is_empty() {
        return Err(invalid("negotiation.opening_actions must name at least one action"));
    }
    if negotiation.our_target_reference.trim().is_empty() {
        return Err(invalid("negotiation.our_target_reference must not be empty"));
    }
    Ok(())
}

fn validate_execution(execution: &ExecutionConfig) -> Result<(), ConfigError> {
    if execution.max_attempts == 0 {
        return Err(invalid("execution.max_attempts must be greater than zero"));
    }
    if execution.task_timeout_ms == 0 {
        return Err(invalid("execution.task_timeout_ms must be greater than zero"));
    }
    if execution.jitter_min_ms > execution.jitter_max_ms {
        return Err(invalid("execution.jitter_min_ms must not exceed execution.jitter_max_ms"));
    }
    if execution.retry_base_delay_ms > execution.retry_max_delay_ms {
        return Err(invalid(
            "execution.retry_base_delay_ms must not exceed execution.retry_max_delay_ms",
        ));
    }
    if execution.max_concurrent_tasks == 0 {
        return Err(invalid("execution.max_concurrent_tasks must be greater than zero"));
    }
    if execution.fulfillment_deadline_secs == 0 {
        return Err(invalid("execution.fulfillment_deadline_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_workers(workers: &WorkersConfig) -> Result<(), ConfigError> {
    if workers.default_daily_cap == 0 {
        return Err(invalid("workers.default_daily_cap must be greater than zero"));
    }
    for (name, value) in [
        ("workers.ban_signal_step", workers.ban_signal_step),
        ("workers.ban_signal_recovery", workers.ban_signal_recovery),
        ("workers.cooldown_threshold", workers.cooldown_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(invalid(format!("{name} must be in range 0.0..=1.0")));
        }
    }
    if workers.ban_signal_step == 0.0 {
        return Err(invalid("workers.ban_signal_step must be greater than zero"));
    }
    Ok(())
}

fn validate_alerts(alerts: &AlertsConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&alerts.completion_rate_floor) {
        return Err(invalid("alerts.completion_rate_floor must be in range 0.0..=1.0"));
    }
    if alerts.min_sample == 0
        || alerts.pool_exhaustion_threshold == 0
        || alerts.ban_spike_threshold == 0
    {
        return Err(invalid("alerts thresholds must be greater than zero"));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(invalid("server.health_check_port must be greater than zero"));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(invalid("server.graceful_shutdown_secs must be greater than zero"));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(invalid("logging.level must be one of trace|debug|info|warn|error")),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    transport: Option<TransportPatch>,
    driver: Option<DriverPatch>,
    negotiation: Option<NegotiationPatch>,
    execution: Option<ExecutionPatch>,
    workers: Option<WorkersPatch>,
    alerts: Option<AlertsPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TransportPatch {
    max_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DriverPatch {
    mode: Option<DriverMode>,
    endpoint: Option<String>,
    api_key: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct NegotiationPatch {
    max_rounds: Option<u32>,
    initial_reliability: Option<f64>,
    reliability_decay: Option<f64>,
    block_severity_threshold: Option<u8>,
    confidence_floor: Option<u8>,
    max_term_quantity: Option<u32>,
    outbound_max_attempts: Option<u32>,
    failure_cooldown_secs: Option<u64>,
    opening_actions: Option<Vec<ActionType>>,
    our_target_reference: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecutionPatch {
    max_attempts: Option<u32>,
    task_timeout_ms: Option<u64>,
    jitter_min_ms: Option<u64>,
    jitter_max_ms: Option<u64>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    requeue_delay_ms: Option<u64>,
    max_concurrent_tasks: Option<usize>,
    fulfillment_deadline_secs: Option<u64>,
    deadline_sweep_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkersPatch {
    default_daily_cap: Option<u32>,
    ban_signal_step: Option<f64>,
    ban_signal_recovery: Option<f64>,
    cooldown_threshold: Option<f64>,
    cooldown_secs: Option<u64>,
    max_cooldowns: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct AlertsPatch {
    completion_rate_floor: Option<f64>,
    min_sample: Option<u64>,
    pool_exhaustion_threshold: Option<u64>,
    ban_spike_threshold: Option<usize>,
    ban_spike_window_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
