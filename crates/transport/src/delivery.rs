use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use tradeback_core::config::TransportConfig;
use tradeback_core::domain::message::OutboundMessage;
use tradeback_core::ports::{OutboundSink, PortError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Worth another try: timeouts, rate limits, dropped connections.
    #[error("transport send failed: {0}")]
    Send(String),
    #[error("transport rejected message: {0}")]
    Rejected(String),
}

impl TransportError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Send(_))
    }
}

/// Backoff for synchronous send failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, retry: u32) -> Duration {
        let multiplier = 1_u64 << retry.min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms))
    }
}

/// Outgoing half of a messaging channel to contacts.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError>;
}

/// Transport with no peers; sends are dropped.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl MessageTransport for NoopTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        debug!(contact_id = %message.contact_id, "noop transport dropped outbound message");
        Ok(())
    }
}

/// Adapts a transport to the runtime's outbound port, retrying retryable send failures.
pub struct TransportOutbound {
    transport: Arc<dyn MessageTransport>,
    policy: RetryPolicy,
}

impl TransportOutbound {
    pub fn new(transport: Arc<dyn MessageTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }
}

#[async_trait]
impl OutboundSink for TransportOutbound {
    async fn send(&self, message: &OutboundMessage) -> Result<(), PortError> {
        let mut retry = 0;
        loop {
            let error = match self.transport.send(message).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };
            if !error.is_retryable() || retry >= self.policy.max_retries {
                return Err(PortError::Delivery(error.to_string()));
            }

            let delay = self.policy.backoff(retry);
            warn!(
                event_name = "transport.send.retry",
                contact_id = %message.contact_id,
                retry = retry + 1,
                max_retries = self.policy.max_retries,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "outbound send failed; backing off"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            retry += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use tradeback_core::domain::contact::ContactId;
    use tradeback_core::domain::message::OutboundMessage;
    use tradeback_core::ports::{OutboundSink, PortError};

    use super::{MessageTransport, RetryPolicy, TransportError, TransportOutbound};

    #[derive(Default)]
    struct ScriptedTransport {
        results: Mutex<VecDeque<Result<(), TransportError>>>,
        attempts: Mutex<usize>,
    }

    impl ScriptedTransport {
        fn with_results(results: Vec<Result<(), TransportError>>) -> Self {
            Self { results: Mutex::new(results.into()), ..Self::default() }
        }

        async fn attempts(&self) -> usize {
            *self.attempts.lock().await
        }
    }

    #[async_trait]
    impl MessageTransport for ScriptedTransport {
        async fn send(&self, _message: &OutboundMessage) -> Result<(), TransportError> {
            *self.attempts.lock().await += 1;
            self.results.lock().await.pop_front().unwrap_or(Ok(()))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy { max_retries: 2, base_delay_ms: 0, max_delay_ms: 0 }
    }

    fn message() -> OutboundMessage {
        OutboundMessage { contact_id: ContactId("c-1".to_owned()), text: "hi".to_owned() }
    }

    #[tokio::test]
    async fn retries_transient_failures_until_sent() {
        let transport = Arc::new(ScriptedTransport::with_results(vec![
            Err(TransportError::Send("timeout".to_owned())),
            Err(TransportError::Send("429".to_owned())),
            Ok(()),
        ]));
        let outbound = TransportOutbound::new(transport.clone(), policy());

        outbound.send(&message()).await.expect("third attempt is delivered");
        assert_eq!(transport.attempts().await, 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_configured_retries() {
        let transport = Arc::new(ScriptedTransport::with_results(vec![
            Err(TransportError::Send("fail-1".to_owned())),
            Err(TransportError::Send("fail-2".to_owned())),
            Err(TransportError::Send("fail-3".to_owned())),
            Ok(()),
        ]));
        let outbound = TransportOutbound::new(transport.clone(), policy());

        let error = outbound.send(&message()).await.expect_err("retries exhausted");
        assert_eq!(error, PortError::Delivery("transport send failed: fail-3".to_owned()));
        assert_eq!(transport.attempts().await, 3);
    }

    #[tokio::test]
    async fn rejected_messages_are_not_retried() {
        let transport = Arc::new(ScriptedTransport::with_results(vec![Err(TransportError::Rejected(
            "recipient unknown".to_owned(),
        ))]));
        let outbound = TransportOutbound::new(transport.clone(), policy());

        let error = outbound.send(&message()).await.expect_err("rejected");
        assert_eq!(error, PortError::Delivery("transport rejected message: recipient unknown".to_owned()));
        assert_eq!(transport.attempts().await, 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy { max_retries: 5, base_delay_ms: 100, max_delay_ms: 350 };
        assert_eq!(policy.backoff(0).as_millis(), 100);
        assert_eq!(policy.backoff(1).as_millis(), 200);
        assert_eq!(policy.backoff(2).as_millis(), 350);
    }
}
