use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, info, warn};

use tradeback_core::config::{DriverConfig, DriverMode};
use tradeback_core::domain::execution::{ActionRequest, ActionResponse, ActionStatus};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver misconfigured: {0}")]
    Configuration(String),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Performs one engagement action with one worker identity.
///
/// Failures are reported in the response, never as `Err`, so the caller can apply the
/// retry policy uniformly.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> ActionResponse;
}

pub fn build_driver(config: &DriverConfig) -> Result<Arc<dyn AutomationDriver>, DriverError> {
    match config.mode {
        DriverMode::DryRun => Ok(Arc::new(DryRunAutomationDriver)),
        DriverMode::Http => Ok(Arc::new(HttpAutomationDriver::from_config(config)?)),
    }
}

/// Logs every action and reports success without touching any platform.
#[derive(Clone, Debug, Default)]
pub struct DryRunAutomationDriver;

#[async_trait]
impl AutomationDriver for DryRunAutomationDriver {
    async fn execute(&self, request: &ActionRequest) -> ActionResponse {
        info!(
            event_name = "executor.driver.dry_run",
            task_id = %request.task_id,
            worker_id = %request.worker_id,
            action_type = request.action_type.as_str(),
            target_reference = %request.target_reference,
            quantity = request.quantity,
            "dry-run action"
        );
        ActionResponse::success("dry-run")
    }
}

/// POSTs the action request as JSON to an automation service.
pub struct HttpAutomationDriver {
    client: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpAutomationDriver {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, DriverError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint: endpoint.into(), api_key })
    }

    pub fn from_config(config: &DriverConfig) -> Result<Self, DriverError> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            DriverError::Configuration("driver.endpoint is required in http mode".to_string())
        })?;
        Self::new(endpoint, config.api_key.clone(), Duration::from_millis(config.timeout_ms))
    }
}

#[async_trait]
impl AutomationDriver for HttpAutomationDriver {
    async fn execute(&self, request: &ActionRequest) -> ActionResponse {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                warn!(
                    event_name = "executor.driver.request_failed",
                    task_id = %request.task_id,
                    error = %error,
                    "automation request failed"
                );
                return ActionResponse::transient(format!("request failed: {error}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(task_id = %request.task_id, %status, "automation endpoint rejected action");
            return ActionResponse {
                status: classify_status(status),
                detail: format!("endpoint returned {status}: {}", truncate(&body, 200)),
            };
        }

        match response.json::<ActionResponse>().await {
            Ok(parsed) => parsed,
            Err(error) => ActionResponse::transient(format!("unreadable driver response: {error}")),
        }
    }
}

/// Throttling and server-side errors are worth retrying; other client errors are not.
fn classify_status(status: StatusCode) -> ActionStatus {
    if status.is_success() {
        ActionStatus::Success
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ActionStatus::TransientError
    } else {
        ActionStatus::PermanentError
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use tradeback_core::config::{DriverConfig, DriverMode};
    use tradeback_core::domain::exchange::ActionType;
    use tradeback_core::domain::execution::{ActionRequest, ActionStatus, TaskId};
    use tradeback_core::domain::worker::WorkerId;

    use super::{build_driver, classify_status, DriverError, HttpAutomationDriver};

    #[test]
    fn status_classification_separates_retryable_errors() {
        assert_eq!(classify_status(StatusCode::OK), ActionStatus::Success);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ActionStatus::TransientError);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ActionStatus::TransientError);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ActionStatus::PermanentError);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ActionStatus::PermanentError);
    }

    #[test]
    fn http_mode_requires_endpoint() {
        let config = DriverConfig { mode: DriverMode::Http, ..DriverConfig::default() };
        let error = HttpAutomationDriver::from_config(&config).err().expect("missing endpoint");
        assert!(matches!(error, DriverError::Configuration(_)));
    }

    #[tokio::test]
    async fn dry_run_driver_always_succeeds() {
        let driver = build_driver(&DriverConfig::default()).expect("dry-run driver");
        let response = driver
            .execute(&ActionRequest {
                task_id: TaskId("T-1".to_string()),
                action_type: ActionType::Endorse,
                target_reference: "post-1".to_string(),
                quantity: 2,
                worker_id: WorkerId("w-1".to_string()),
            })
            .await;

        assert_eq!(response.status, ActionStatus::Success);
    }
}
