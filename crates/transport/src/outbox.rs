use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use tradeback_core::domain::message::OutboundMessage;
use tradeback_core::ports::{OutboundSink, PortError};

/// Records outbound messages in memory.
///
/// Scripted failures are consumed one per send before any message is recorded, which lets
/// callers exercise delivery retries without a network.
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    sent: Mutex<Vec<OutboundMessage>>,
    scripted_failures: Mutex<VecDeque<String>>,
    attempts: AtomicUsize,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, reason: impl Into<String>) {
        match self.scripted_failures.lock() {
            Ok(mut failures) => failures.push_back(reason.into()),
            Err(poisoned) => poisoned.into_inner().push_back(reason.into()),
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Every send call, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent_to(&self, contact_id: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|message| message.contact_id.0 == contact_id)
            .map(|message| message.text)
            .collect()
    }

    fn next_failure(&self) -> Option<String> {
        match self.scripted_failures.lock() {
            Ok(mut failures) => failures.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

#[async_trait]
impl OutboundSink for InMemoryOutbox {
    async fn send(&self, message: &OutboundMessage) -> Result<(), PortError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.next_failure() {
            return Err(PortError::Delivery(reason));
        }

        match self.sent.lock() {
            Ok(mut sent) => sent.push(message.clone()),
            Err(poisoned) => poisoned.into_inner().push(message.clone()),
        }
        Ok(())
    }
}
