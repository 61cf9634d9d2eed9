use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use tradeback_agent::{ConversationRuntime, NegotiationError, RuntimeDeps};
use tradeback_core::audit::NoopAuditSink;
use tradeback_core::config::AppConfig;
use tradeback_core::metrics::MetricsAggregator;
use tradeback_db::repositories::{
    SqlContactRepository, SqlExchangeRepository, SqlExecutionTaskRepository, SqlWorkerRepository,
};
use tradeback_db::{connect_with_settings, migrations, DbPool, RepositoryError};
use tradeback_executor::{build_driver, DriverError, Orchestrator, OrchestratorDeps, OrchestratorHandle, PoolManager};
use tradeback_transport::{
    dispatcher_for, EventDispatcher, MessageTransport, NoopTransport, RetryPolicy,
    TransportOutbound,
};

use crate::alerts::TracingAlertSink;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub metrics: Arc<MetricsAggregator>,
    pub runtime: Arc<ConversationRuntime>,
    pub orchestrator_task: JoinHandle<()>,
    /// Routes pushed transport events into the runtime.
    pub dispatcher: Arc<EventDispatcher>,
    pub resumed_exchanges: usize,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("worker pool could not be loaded: {0}")]
    WorkerPool(#[source] RepositoryError),
    #[error("interrupted executions could not be resumed: {0}")]
    Resume(#[source] RepositoryError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Templates(#[from] NegotiationError),
}

/// Wires the runtime against the configured database with the no-peer transport.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    bootstrap_with_transport(config, Arc::new(NoopTransport)).await
}

pub async fn bootstrap_with_transport(
    config: AppConfig,
    transport: Arc<dyn MessageTransport>,
) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let contacts = Arc::new(SqlContactRepository::new(db_pool.clone()));
    let exchanges = Arc::new(SqlExchangeRepository::new(db_pool.clone()));
    let tasks = Arc::new(SqlExecutionTaskRepository::new(db_pool.clone()));
    let metrics = Arc::new(MetricsAggregator::new(config.alerts.clone(), Arc::new(TracingAlertSink)));

    let pool = Arc::new(
        PoolManager::load(
            config.workers.clone(),
            Arc::new(SqlWorkerRepository::new(db_pool.clone())),
            metrics.clone(),
        )
        .await
        .map_err(BootstrapError::WorkerPool)?,
    );
    let driver = build_driver(&config.driver)?;

    let (handle, inbox) = OrchestratorHandle::new();
    let runtime = Arc::new(ConversationRuntime::new(
        &config.negotiation,
        &config.execution,
        RuntimeDeps {
            contacts,
            exchanges: exchanges.clone(),
            tasks: tasks.clone(),
            outbound: Arc::new(TransportOutbound::new(transport, RetryPolicy::from(&config.transport))),
            handoff: Arc::new(handle),
            metrics: metrics.clone(),
            audit: Arc::new(NoopAuditSink),
        },
    )?);

    let orchestrator = Orchestrator::new(
        &config.execution,
        OrchestratorDeps {
            tasks,
            exchanges,
            pool,
            driver,
            reports: runtime.clone(),
            metrics: metrics.clone(),
        },
    );
    let orchestrator_task = orchestrator.spawn(inbox);
    let resumed_exchanges = orchestrator.resume_pending().await.map_err(BootstrapError::Resume)?;
    info!(
        event_name = "system.bootstrap.executions_resumed",
        correlation_id = "bootstrap",
        resumed_exchanges,
        "interrupted executions resumed"
    );

    let dispatcher = Arc::new(dispatcher_for(runtime.clone()));

    Ok(Application {
        config,
        db_pool,
        metrics,
        runtime,
        orchestrator_task,
        dispatcher,
        resumed_exchanges,
    })
}
