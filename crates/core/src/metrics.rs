//! Health counters and operator alerts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AlertsConfig;
use crate::domain::exchange::ExchangeOutcome;
use crate::workers::PoolSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CompletionRateDrop,
    WorkerPoolExhausted,
    BanSignalSpike,
    PersistenceUnavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

#[derive(Clone, Default)]
pub struct InMemoryAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl InMemoryAlertSink {
    pub fn alerts(&self) -> Vec<Alert> {
        match self.alerts.lock() {
            Ok(alerts) => alerts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, kind: AlertKind) -> usize {
        self.alerts().iter().filter(|alert| alert.kind == kind).count()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn raise(&self, alert: Alert) {
        match self.alerts.lock() {
            Ok(mut alerts) => alerts.push(alert),
            Err(poisoned) => poisoned.into_inner().push(alert),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub negotiations_started: u64,
    pub negotiations_agreed: u64,
    pub exchanges_completed: u64,
    pub exchanges_failed: u64,
    pub exchanges_abandoned: u64,
    pub exchanges_blocked: u64,
    pub negotiation_success_rate: Option<f64>,
    pub completion_rate: Option<f64>,
    pub average_time_to_agreement_secs: Option<f64>,
    pub task_attempts: u64,
    pub task_retries: u64,
    pub retry_rate: Option<f64>,
    pub unavailable_acquisitions: u64,
    pub worker_cooldowns: u64,
    pub persistence_failures: u64,
    pub pool: PoolSnapshot,
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MetricsState {
    snapshot: HealthSnapshot,
    agreement_secs_total: f64,
    consecutive_unavailable: u64,
    recent_cooldowns: VecDeque<DateTime<Utc>>,
    completion_alert_active: bool,
    spike_alert_active: bool,
}

pub struct MetricsAggregator {
    config: AlertsConfig,
    sink: Arc<dyn AlertSink>,
    state: Mutex<MetricsState>,
}

impl MetricsAggregator {
    pub fn new(config: AlertsConfig, sink: Arc<dyn AlertSink>) -> Self {
        Self { config, sink, state: Mutex::new(MetricsState::default()) }
    }

    fn state(&self) -> MutexGuard<'_, MetricsState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_negotiation_started(&self) {
        self.state().snapshot.negotiations_started += 1;
    }

    pub fn record_agreement(&self, time_to_agreement: Duration) {
        let mut state = self.state();
        state.snapshot.negotiations_agreed += 1;
        state.agreement_secs_total += time_to_agreement.num_milliseconds().max(0) as f64 / 1_000.0;
    }

    pub fn record_terminal(&self, outcome: ExchangeOutcome, now: DateTime<Utc>) {
        let alert = {
            let mut state = self.state();
            match outcome {
                ExchangeOutcome::Completed => state.snapshot.exchanges_completed += 1,
                ExchangeOutcome::Failed => state.snapshot.exchanges_failed += 1,
                ExchangeOutcome::Abandoned => state.snapshot.exchanges_abandoned += 1,
                ExchangeOutcome::Blocked => state.snapshot.exchanges_blocked += 1,
            }

            let terminal = terminal_count(&state.snapshot);
            let rate = ratio(state.snapshot.exchanges_completed, terminal).unwrap_or(1.0);
            let below_floor =
                terminal >= self.config.min_sample && rate < self.config.completion_rate_floor;

            match (below_floor, state.completion_alert_active) {
                (true, false) => {
                    state.completion_alert_active = true;
                    Some(Alert {
                        kind: AlertKind::CompletionRateDrop,
                        severity: AlertSeverity::Warning,
                        message: format!(
                            "completion rate {rate:.2} below floor {:.2} over {terminal} exchanges",
                            self.config.completion_rate_floor
                        ),
                        raised_at: now,
                    })
                }
                (false, true) => {
                    state.completion_alert_active = false;
                    None
                }
                _ => None,
            }
        };
        self.emit(alert);
    }

    pub fn record_task_attempt(&self, is_retry: bool) {
        let mut state = self.state();
        state.snapshot.task_attempts += 1;
        if is_retry {
            state.snapshot.task_retries += 1;
        }
    }

    /// Tracks acquisition results. One alert per unbroken run of `Unavailable`.
    pub fn record_acquisition(&self, unavailable: bool, now: DateTime<Utc>) {
        let alert = {
            let mut state = self.state();
            if !unavailable {
                state.consecutive_unavailable = 0;
                None
            } else {
                state.snapshot.unavailable_acquisitions += 1;
                state.consecutive_unavailable += 1;
                (state.consecutive_unavailable == self.config.pool_exhaustion_threshold).then(|| {
                    Alert {
                        kind: AlertKind::WorkerPoolExhausted,
                        severity: AlertSeverity::Warning,
                        message: format!(
                            "no worker available for {} consecutive acquisitions",
                            state.consecutive_unavailable
                        ),
                        raised_at: now,
                    }
                })
            }
        };
        self.emit(alert);
    }

    pub fn record_cooldown(&self, now: DateTime<Utc>) {
        let alert = {
            let mut state = self.state();
            state.snapshot.worker_cooldowns += 1;

            let window = Duration::seconds(
                i64::try_from(self.config.ban_spike_window_secs).unwrap_or(i64::MAX / 1_000),
            );
            state.recent_cooldowns.push_back(now);
            while state.recent_cooldowns.front().is_some_and(|at| now - *at > window) {
                state.recent_cooldowns.pop_front();
            }

            let spiking = state.recent_cooldowns.len() >= self.config.ban_spike_threshold;
            if spiking && !state.spike_alert_active {
                state.spike_alert_active = true;
                Some(Alert {
                    kind: AlertKind::BanSignalSpike,
                    severity: AlertSeverity::Warning,
                    message: format!(
                        "{} worker cooldowns within {}s",
                        state.recent_cooldowns.len(),
                        self.config.ban_spike_window_secs
                    ),
                    raised_at: now,
                })
            } else {
                if !spiking {
                    state.spike_alert_active = false;
                }
                None
            }
        };
        self.emit(alert);
    }

    pub fn record_persistence_failure(&self, detail: impl Into<String>, now: DateTime<Utc>) {
        self.state().snapshot.persistence_failures += 1;
        self.emit(Some(Alert {
            kind: AlertKind::PersistenceUnavailable,
            severity: AlertSeverity::Critical,
            message: detail.into(),
            raised_at: now,
        }));
    }

    pub fn update_pool(&self, pool: PoolSnapshot) {
        self.state().snapshot.pool = pool;
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let state = self.state();
        let mut snapshot = state.snapshot.clone();
        snapshot.negotiation_success_rate =
            ratio(snapshot.negotiations_agreed, snapshot.negotiations_started);
        snapshot.completion_rate = ratio(snapshot.exchanges_completed, terminal_count(&snapshot));
        snapshot.retry_rate = ratio(snapshot.task_retries, snapshot.task_attempts);
        snapshot.average_time_to_agreement_secs = (snapshot.negotiations_agreed > 0)
            .then(|| state.agreement_secs_total / snapshot.negotiations_agreed as f64);
        snapshot.captured_at = Some(now);
        snapshot
    }

    fn emit(&self, alert: Option<Alert>) {
        if let Some(alert) = alert {
            self.sink.raise(alert);
        }
    }
}

fn terminal_count(snapshot: &HealthSnapshot) -> u64 {
    snapshot.exchanges_completed
        + snapshot.exchanges_failed
        + snapshot.exchanges_abandoned
        + snapshot.exchanges_blocked
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}
