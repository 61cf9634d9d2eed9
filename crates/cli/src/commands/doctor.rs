use serde::Serialize;
use tradeback_core::config::{AppConfig, DriverMode, LoadOptions};
use tradeback_core::domain::worker::WorkerStatus;
use tradeback_db::repositories::SqlWorkerRepository;
use tradeback_db::{connect_with_settings, migrations, ping, WorkerRepository};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> String {
    let report = build_report();

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.push(check_driver(&config));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            for name in ["driver_readiness", "database_connectivity", "worker_pool"] {
                checks.push(DoctorCheck::skipped(name, "configuration did not load"));
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_driver(config: &AppConfig) -> DoctorCheck {
    match (config.driver.mode, config.driver.endpoint.as_deref()) {
        (DriverMode::DryRun, _) => {
            DoctorCheck::pass("driver_readiness", "dry_run driver: actions are logged, not performed")
        }
        (DriverMode::Http, Some(endpoint)) => {
            DoctorCheck::pass("driver_readiness", format!("http driver targeting `{endpoint}`"))
        }
        (DriverMode::Http, None) => DoctorCheck::fail("driver_readiness", "http driver has no endpoint"),
    }
}

/// Connectivity, then the worker pool read from the migrated schema.
fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck::fail(
                    "database_connectivity",
                    format!("failed to initialize async runtime: {error}"),
                ),
                DoctorCheck::skipped("worker_pool", "the async runtime did not start"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck::fail("database_connectivity", format!("failed to connect to database: {error}")),
                    DoctorCheck::skipped("worker_pool", "the database is unreachable"),
                ];
            }
        };

        let mut checks = Vec::with_capacity(2);
        if let Err(error) = ping(&pool).await {
            checks.push(DoctorCheck::fail("database_connectivity", format!("ping failed: {error}")));
            checks.push(DoctorCheck::skipped("worker_pool", "the database is unreachable"));
            pool.close().await;
            return checks;
        }
        checks.push(DoctorCheck::pass(
            "database_connectivity",
            format!("connected using `{}`", config.database.url),
        ));

        let workers = match migrations::run_pending(&pool).await {
            Ok(()) => SqlWorkerRepository::new(pool.clone()).list().await.map_err(|error| error.to_string()),
            Err(error) => Err(format!("migrations failed: {error}")),
        };
        checks.push(match workers {
            Ok(workers) => {
                let active = workers.iter().filter(|worker| worker.status == WorkerStatus::Active).count();
                if active == 0 {
                    DoctorCheck::fail("worker_pool", "no active worker identities; use `tradeback workers add`")
                } else {
                    DoctorCheck::pass("worker_pool", format!("{active} of {} worker(s) active", workers.len()))
                }
            }
            Err(error) => DoctorCheck::fail("worker_pool", error),
        });

        pool.close().await;
        checks
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
