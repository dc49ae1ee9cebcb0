pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod merge;
pub mod migration;
pub mod sources;

use config::Config;
use database::Database;
use error::AppError;
use migration::{MigrationContext, MigrationCoordinator, MigrationReport};
use sources::SourceRegistry;
use std::sync::Arc;

/// Long-lived handles shared by every caller in the process.
#[derive(Clone)]
pub struct AppContext {
    pub db: Arc<Database>,
    pub sources: SourceRegistry,
    pub migrations: Arc<MigrationCoordinator>,
}

impl AppContext {
    pub fn open(config: &Config) -> Result<Self, AppError> {
        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Arc::new(Database::new(&config.database_path)?);
        let sources = config.source_registry();
        let migrations = Arc::new(MigrationCoordinator::new(MigrationContext {
            db: db.clone(),
            sources: sources.clone(),
        }));

        log::info!("Opened library at {}", config.database_path.display());

        Ok(Self {
            db,
            sources,
            migrations,
        })
    }
}

/// Run pending data migrations on the blocking pool. Failures are logged as
/// warnings and never abort startup; un-migrated groups resolve to their own
/// episodes, without deduplication, until a later pass succeeds.
pub fn spawn_migrations(
    coordinator: Arc<MigrationCoordinator>,
) -> tokio::task::JoinHandle<Option<MigrationReport>> {
    tokio::task::spawn_blocking(move || match coordinator.run() {
        Ok(report) => {
            match &report.failed {
                Some((name, reason)) => log::warn!(
                    "Data migration {} did not complete ({}); merged groups may show duplicate episodes",
                    name,
                    reason
                ),
                None if !report.applied.is_empty() => log::info!(
                    "Data migrations applied: {} (now v{})",
                    report.applied.join(", "),
                    report.to_version
                ),
                None => log::debug!("Data already at v{}", report.to_version),
            }
            Some(report)
        }
        Err(e) => {
            log::warn!("Data migrations did not run: {}", e);
            None
        }
    })
}
