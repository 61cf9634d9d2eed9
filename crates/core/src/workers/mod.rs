//! Worker pool rules: least-recently-used selection under a daily cap, ban-signal
//! scoring, cooldown and retirement.
//!
//! The pool is plain data. The executor wraps it in a single async mutex and persists
//! every changed record before releasing the lock.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WorkersConfig;
use crate::domain::exchange::ActionType;
use crate::domain::execution::ErrorKind;
use crate::domain::worker::{WorkerId, WorkerIdentity, WorkerStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acquisition {
    Assigned(WorkerId),
    /// Backpressure signal: no worker qualifies right now.
    Unavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(ErrorKind),
    /// The attempt never reached the platform (cancelled before the driver answered).
    Abandoned,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerTransition {
    Unchanged,
    CooledDown { until: DateTime<Utc> },
    Reactivated,
    Retired,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("unknown worker identity `{0}`")]
    UnknownWorker(WorkerId),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub active: usize,
    pub cooling_down: usize,
    pub retired: usize,
    pub in_flight: u32,
    /// Share of today's non-retired capacity already used or reserved.
    pub utilization: f64,
}

#[derive(Clone, Debug)]
pub struct WorkerPool {
    policy: WorkersConfig,
    workers: BTreeMap<WorkerId, WorkerIdentity>,
    in_flight: HashMap<WorkerId, u32>,
}

impl WorkerPool {
    pub fn new(policy: WorkersConfig) -> Self {
        Self { policy, workers: BTreeMap::new(), in_flight: HashMap::new() }
    }

    pub fn register(&mut self, worker: WorkerIdentity) {
        self.workers.insert(worker.worker_id.clone(), worker);
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&WorkerIdentity> {
        self.workers.get(worker_id)
    }

    pub fn in_flight(&self, worker_id: &WorkerId) -> u32 {
        self.in_flight.get(worker_id).copied().unwrap_or(0)
    }

    /// Rolls daily counters and ends expired cooldowns. Returns the workers whose
    /// record changed.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Vec<(WorkerId, WorkerTransition)> {
        let mut changed = Vec::new();
        for worker in self.workers.values_mut() {
            let counter_day = worker.counter_day;
            worker.roll_day(now);
            let mut transition = WorkerTransition::Unchanged;

            if worker.status == WorkerStatus::CoolingDown
                && worker.cooldown_until.map_or(true, |until| until <= now)
            {
                worker.status = WorkerStatus::Active;
                worker.cooldown_until = None;
                worker.ban_signal_score /= 2.0;
                transition = WorkerTransition::Reactivated;
            }

            if transition != WorkerTransition::Unchanged || counter_day != worker.counter_day {
                changed.push((worker.worker_id.clone(), transition));
            }
        }
        changed
    }

    /// Picks the least-recently-used active worker that supports `action_type` and has
    /// room under its daily cap, counting attempts already in flight.
    pub fn acquire(&mut self, action_type: ActionType, now: DateTime<Utc>) -> Acquisition {
        let in_flight = &self.in_flight;
        let candidate = self
            .workers
            .values()
            .filter(|worker| worker.status == WorkerStatus::Active)
            .filter(|worker| worker.supports(action_type))
            .filter(|worker| {
                let reserved = in_flight.get(&worker.worker_id).copied().unwrap_or(0);
                worker.daily_action_count.saturating_add(reserved) < worker.daily_action_cap
            })
            .min_by(|left, right| {
                left.last_used_at
                    .cmp(&right.last_used_at)
                    .then_with(|| left.worker_id.cmp(&right.worker_id))
            })
            .map(|worker| worker.worker_id.clone());

        let Some(worker_id) = candidate else {
            return Acquisition::Unavailable;
        };

        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.last_used_at = Some(now);
        }
        *self.in_flight.entry(worker_id.clone()).or_insert(0) += 1;
        Acquisition::Assigned(worker_id)
    }

    pub fn release(
        &mut self,
        worker_id: &WorkerId,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<WorkerTransition, PoolError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::UnknownWorker(worker_id.clone()))?;

        if let Some(reserved) = self.in_flight.get_mut(worker_id) {
            *reserved = reserved.saturating_sub(1);
        }

        worker.roll_day(now);
        match outcome {
            AttemptOutcome::Succeeded => {
                worker.daily_action_count = worker.daily_action_count.saturating_add(1);
                worker.ban_signal_score =
                    (worker.ban_signal_score - self.policy.ban_signal_recovery).max(0.0);
                Ok(WorkerTransition::Unchanged)
            }
            AttemptOutcome::Abandoned => Ok(WorkerTransition::Unchanged),
            AttemptOutcome::Failed(_) => {
                worker.ban_signal_score =
                    (worker.ban_signal_score + self.policy.ban_signal_step).min(1.0);
                if worker.status != WorkerStatus::Active
                    || worker.ban_signal_score < self.policy.cooldown_threshold
                {
                    return Ok(WorkerTransition::Unchanged);
                }

                if worker.cooldown_count >= self.policy.max_cooldowns {
                    worker.status = WorkerStatus::Retired;
                    worker.cooldown_until = None;
                    return Ok(WorkerTransition::Retired);
                }

                let cooldown = i64::try_from(self.policy.cooldown_secs).unwrap_or(i64::MAX / 1_000);
                let until = now + Duration::seconds(cooldown);
                worker.status = WorkerStatus::CoolingDown;
                worker.cooldown_until = Some(until);
                worker.cooldown_count = worker.cooldown_count.saturating_add(1);
                Ok(WorkerTransition::CooledDown { until })
            }
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let mut snapshot = PoolSnapshot { total: self.workers.len(), ..PoolSnapshot::default() };
        let mut capacity = 0u64;
        let mut used = 0u64;

        for worker in self.workers.values() {
            let reserved = self.in_flight(&worker.worker_id);
            snapshot.in_flight += reserved;
            match worker.status {
                WorkerStatus::Active => snapshot.active += 1,
                WorkerStatus::CoolingDown => snapshot.cooling_down += 1,
                WorkerStatus::Retired => {
                    snapshot.retired += 1;
                    continue;
                }
            }
            capacity += u64::from(worker.daily_action_cap);
            used += u64::from(worker.daily_action_count.saturating_add(reserved));
        }

        if capacity > 0 {
            snapshot.utilization = (used as f64 / capacity as f64).min(1.0);
        }
        snapshot
    }
}
