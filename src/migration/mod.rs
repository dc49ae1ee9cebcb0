//! Versioned one-shot data migrations, run at startup on a background thread.

pub mod legacy;
pub mod merge_config;

#[cfg(test)]
mod tests;

use crate::database::Database;
use crate::error::AppError;
use crate::sources::SourceRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// `app_settings` key holding the last applied migration version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Everything a migration step may touch.
#[derive(Clone)]
pub struct MigrationContext {
    pub db: Arc<Database>,
    pub sources: SourceRegistry,
}

/// A migration returns `Ok(true)` when it completed. `Ok(false)` or an error
/// stops the pass without recording the version.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub run: fn(&MigrationContext) -> Result<bool, AppError>,
}

pub fn registered_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        name: "legacy_merge_config",
        run: merge_config::migrate,
    }]
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub to_version: u32,
    pub applied: Vec<&'static str>,
    /// Name and reason of the migration that stopped the pass.
    pub failed: Option<(&'static str, String)>,
}

impl MigrationReport {
    pub fn succeeded(&self) -> bool {
        self.failed.is_none()
    }
}

/// Runs pending migrations in version order. Only one pass may run at a time.
pub struct MigrationCoordinator {
    ctx: MigrationContext,
    migrations: Vec<Migration>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MigrationCoordinator {
    pub fn new(ctx: MigrationContext) -> Self {
        Self::with_migrations(ctx, registered_migrations())
    }

    pub fn with_migrations(ctx: MigrationContext, mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self {
            ctx,
            migrations,
            running: AtomicBool::new(false),
        }
    }

    pub fn current_version(&self) -> Result<u32, AppError> {
        let stored = self.ctx.db.get_setting(SCHEMA_VERSION_KEY)?;
        Ok(stored.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Apply every migration newer than the recorded version. A failing
    /// migration is logged and reported, never propagated: the application
    /// keeps working with un-migrated data and the step is retried on the
    /// next start.
    pub fn run(&self) -> Result<MigrationReport, AppError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::MigrationInProgress);
        }
        let _guard = RunningGuard(&self.running);

        let from_version = self.current_version()?;
        let mut report = MigrationReport {
            from_version,
            to_version: from_version,
            applied: Vec::new(),
            failed: None,
        };

        for migration in self.migrations.iter().filter(|m| m.version > from_version) {
            log::info!(
                "Running migration v{} ({})",
                migration.version,
                migration.name
            );
            let outcome = (migration.run)(&self.ctx);
            match outcome {
                Ok(true) => {
                    self.ctx
                        .db
                        .set_setting(SCHEMA_VERSION_KEY, &migration.version.to_string())?;
                    report.to_version = migration.version;
                    report.applied.push(migration.name);
                }
                Ok(false) => {
                    log::warn!("Migration {} reported failure", migration.name);
                    report.failed = Some((migration.name, "reported failure".to_string()));
                    break;
                }
                Err(e) => {
                    log::warn!("Migration {} failed: {}", migration.name, e);
                    report.failed = Some((migration.name, e.to_string()));
                    break;
                }
            }
        }

        Ok(report)
    }
}
