//! Report Sync
//!
//! Polls a report backend and logs snapshots, changes and conflicts until
//! interrupted.

use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use report_sync::reports::{HttpReportStore, ReportFilters, ReportStatus};
use report_sync::{Config, ReportSyncService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "report_sync=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Report Sync v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Report API: {}", config.api.base_url);
    tracing::info!(
        "Conflict resolution: {:?}, max concurrent updates: {}",
        config.updates.conflict_resolution,
        config.updates.max_concurrent_updates
    );

    let store = HttpReportStore::new(&config.api)?;
    let service = ReportSyncService::new(Arc::new(store), config);

    service.start_polling(filters_from_env()?, None);

    let mut snapshots = service.subscribe();
    let watcher = {
        let service = service.clone();
        tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let snapshot = snapshots.borrow_and_update().clone();
                if let Some(error) = &snapshot.list_error {
                    tracing::warn!("Report list unavailable: {}", error);
                }
                if let Some(page) = &snapshot.reports {
                    tracing::info!(
                        reports = page.data.len(),
                        total = page.pagination.total,
                        last_update = ?snapshot.last_update,
                        "Snapshot updated"
                    );
                }
                if let Some(stats) = &snapshot.statistics {
                    tracing::info!(
                        pending = stats.pending_reports,
                        approved = stats.approved_reports,
                        declined = stats.declined_reports,
                        overdue = stats.overdue_reports,
                        "Statistics updated"
                    );
                }
                for conflict in service.conflicts() {
                    tracing::warn!(
                        conflict_id = %conflict.id,
                        report_id = %conflict.update.report_id,
                        conflict_type = ?conflict.conflict_type,
                        "Conflict awaiting a decision"
                    );
                }
            }
        })
    };

    shutdown_signal().await;

    service.shutdown();
    watcher.abort();
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Report list filters from `REPORTS_BRANCH_ID`, `REPORTS_STATUS` and `REPORTS_PAGE_SIZE`
fn filters_from_env() -> anyhow::Result<ReportFilters> {
    let mut filters = ReportFilters {
        branch_id: std::env::var("REPORTS_BRANCH_ID").ok(),
        ..Default::default()
    };

    if let Ok(status) = std::env::var("REPORTS_STATUS") {
        let status: ReportStatus = serde_json::from_value(serde_json::Value::String(status.clone()))
            .map_err(|_| anyhow::anyhow!("Unknown report status: {}", status))?;
        filters.status = Some(status);
    }
    if let Ok(limit) = std::env::var("REPORTS_PAGE_SIZE") {
        filters.limit = limit.parse()?;
    }

    Ok(filters)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        },
    }
}
