use tracing::{error, warn};

use tradeback_core::metrics::{Alert, AlertSeverity, AlertSink};

/// Raises alerts as structured log events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        let kind = serde_json::to_value(alert.kind)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", alert.kind));

        match alert.severity {
            AlertSeverity::Critical => error!(
                event_name = "system.alert.raised",
                alert_kind = %kind,
                severity = "critical",
                raised_at = %alert.raised_at,
                "{}",
                alert.message
            ),
            AlertSeverity::Warning => warn!(
                event_name = "system.alert.raised",
                alert_kind = %kind,
                severity = "warning",
                raised_at = %alert.raised_at,
                "{}",
                alert.message
            ),
        }
    }
}
