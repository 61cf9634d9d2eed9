use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use tradeback_core::config::WorkersConfig;
use tradeback_core::domain::exchange::ActionType;
use tradeback_core::domain::worker::{WorkerId, WorkerIdentity};
use tradeback_core::metrics::MetricsAggregator;
use tradeback_core::workers::{
    Acquisition, AttemptOutcome, PoolError, PoolSnapshot, WorkerPool, WorkerTransition,
};
use tradeback_db::repositories::{RepositoryError, WorkerRepository};

#[derive(Debug, Error)]
pub enum PoolManagerError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// The only state shared across conversations.
///
/// Every operation holds one async mutex from the in-memory change until the changed worker
/// records are persisted, so counters and status never diverge between callers.
pub struct PoolManager {
    pool: Mutex<WorkerPool>,
    repository: Arc<dyn WorkerRepository>,
    metrics: Arc<MetricsAggregator>,
}

impl PoolManager {
    pub async fn load(
        policy: WorkersConfig,
        repository: Arc<dyn WorkerRepository>,
        metrics: Arc<MetricsAggregator>,
    ) -> Result<Self, RepositoryError> {
        let mut pool = WorkerPool::new(policy);
        for worker in repository.list().await? {
            pool.register(worker);
        }
        metrics.update_pool(pool.snapshot());

        Ok(Self { pool: Mutex::new(pool), repository, metrics })
    }

    pub async fn register(&self, worker: WorkerIdentity) -> Result<(), RepositoryError> {
        let mut pool = self.pool.lock().await;
        self.repository.save(worker.clone()).await?;
        info!(
            event_name = "executor.pool.worker_registered",
            worker_id = %worker.worker_id,
            daily_action_cap = worker.daily_action_cap,
            "worker identity registered"
        );
        pool.register(worker);
        self.metrics.update_pool(pool.snapshot());
        Ok(())
    }

    pub async fn acquire(
        &self,
        action_type: ActionType,
        now: DateTime<Utc>,
    ) -> Result<Acquisition, RepositoryError> {
        let mut pool = self.pool.lock().await;

        for (worker_id, transition) in pool.refresh(now) {
            if transition == WorkerTransition::Reactivated {
                info!(
                    event_name = "executor.pool.worker_reactivated",
                    worker_id = %worker_id,
                    "worker cooldown ended"
                );
            }
            self.persist(&pool, &worker_id).await?;
        }

        let acquisition = pool.acquire(action_type, now);
        if let Acquisition::Assigned(worker_id) = &acquisition {
            if let Err(error) = self.persist(&pool, worker_id).await {
                let _ = pool.release(worker_id, AttemptOutcome::Abandoned, now);
                return Err(error);
            }
        }

        self.metrics.record_acquisition(acquisition == Acquisition::Unavailable, now);
        self.metrics.update_pool(pool.snapshot());
        Ok(acquisition)
    }

    pub async fn release(
        &self,
        worker_id: &WorkerId,
        outcome: AttemptOutcome,
        now: DateTime<Utc>,
    ) -> Result<WorkerTransition, PoolManagerError> {
        let mut pool = self.pool.lock().await;
        let transition = pool.release(worker_id, outcome, now)?;
        self.persist(&pool, worker_id).await?;

        match &transition {
            WorkerTransition::CooledDown { until } => {
                warn!(
                    event_name = "executor.pool.worker_cooled_down",
                    worker_id = %worker_id,
                    cooldown_until = %until,
                    "worker crossed ban-signal threshold"
                );
                self.metrics.record_cooldown(now);
            }
            WorkerTransition::Retired => {
                warn!(
                    event_name = "executor.pool.worker_retired",
                    worker_id = %worker_id,
                    "worker retired after repeated cooldowns"
                );
                self.metrics.record_cooldown(now);
            }
            WorkerTransition::Unchanged | WorkerTransition::Reactivated => {}
        }

        self.metrics.update_pool(pool.snapshot());
        Ok(transition)
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        self.pool.lock().await.snapshot()
    }

    async fn persist(&self, pool: &WorkerPool, worker_id: &WorkerId) -> Result<(), RepositoryError> {
        match pool.get(worker_id) {
            Some(worker) => self.repository.save(worker.clone()).await,
            None => Ok(()),
        }
    }
}
