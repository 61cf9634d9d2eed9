use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tradeback_core::domain::message::{DeliveryFailure, FulfillmentConfirmation, InboundMessage};
use tradeback_transport::{
    EventContext, EventDispatcher, HandlerResult, TransportEnvelope, TransportEvent,
};

/// Webhook body pushed by the messaging platform.
#[derive(Debug, Deserialize)]
pub struct IngressEnvelope {
    pub envelope_id: String,
    pub event: IngressEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngressEvent {
    Message(InboundMessage),
    DeliveryFailed(DeliveryFailure),
    Fulfillment(FulfillmentConfirmation),
}

impl From<IngressEnvelope> for TransportEnvelope {
    fn from(envelope: IngressEnvelope) -> Self {
        let event = match envelope.event {
            IngressEvent::Message(message) => TransportEvent::Message(message),
            IngressEvent::DeliveryFailed(failure) => TransportEvent::DeliveryFailed(failure),
            IngressEvent::Fulfillment(confirmation) => TransportEvent::Fulfillment(confirmation),
        };
        Self { envelope_id: envelope.envelope_id, event }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngressResponse {
    pub envelope_id: String,
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router(dispatcher: Arc<EventDispatcher>) -> Router {
    Router::new().route("/events", post(receive)).with_state(dispatcher)
}

pub async fn receive(
    State(dispatcher): State<Arc<EventDispatcher>>,
    Json(envelope): Json<IngressEnvelope>,
) -> (StatusCode, Json<IngressResponse>) {
    let envelope = TransportEnvelope::from(envelope);
    let envelope_id = envelope.envelope_id.clone();
    info!(
        event_name = "ingress.transport.envelope_received",
        envelope_id = %envelope_id,
        correlation_id = %envelope_id,
        event_type = ?envelope.event.event_type(),
        contact_id = envelope.event.contact_id().unwrap_or("unknown"),
        exchange_id = envelope.event.exchange_id().unwrap_or("unknown"),
        "received transport envelope"
    );

    let context = EventContext { correlation_id: envelope_id.clone() };
    match dispatcher.dispatch(&envelope, &context).await {
        Ok(result) => {
            let result = match result {
                HandlerResult::Processed => "processed",
                HandlerResult::Ignored => "ignored",
            };
            (StatusCode::ACCEPTED, Json(IngressResponse { envelope_id, result, error: None }))
        }
        Err(error) => {
            warn!(
                event_name = "ingress.transport.dispatch_failed",
                envelope_id = %envelope_id,
                correlation_id = %envelope_id,
                error = %error,
                "event dispatch failed"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IngressResponse { envelope_id, result: "failed", error: Some(error.to_string()) }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::json;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use tradeback_core::config::AppConfig;

    use crate::bootstrap::bootstrap_with_config;
    use crate::ingress::router;

    fn post(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/events")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("request")
    }

    #[tokio::test]
    async fn pushed_message_reaches_the_runtime() {
        let dir = TempDir::new().expect("temp dir");
        let mut config = AppConfig::default();
        config.database.url =
            format!("sqlite://{}?mode=rwc", dir.path().join("tradeback.db").display());
        let app = bootstrap_with_config(config).await.expect("bootstrap");

        let body = json!({
            "envelope_id": "env-7",
            "event": {
                "type": "message",
                "contact_id": "creator-7",
                "raw_text": "I'm interested",
                "received_at": "2026-10-01T12:00:00Z"
            }
        });
        let response = router(app.dispatcher.clone())
            .oneshot(post(body.to_string()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(app.metrics.snapshot(chrono::Utc::now()).negotiations_started, 1);

        let malformed = router(app.dispatcher.clone())
            .oneshot(post(json!({ "envelope_id": "env-8", "event": { "type": "typing" } }).to_string()))
            .await
            .expect("response");
        assert!(malformed.status().is_client_error());

        app.orchestrator_task.abort();
        app.db_pool.close().await;
    }
}
