// Legacy merge configuration migration and coordinator tests
// Run with: cargo test --lib migration::tests

use super::*;
use crate::database::{Database, NewEpisode};
use crate::sources::MERGED_SOURCE_ID;
use serde_json::json;
use std::sync::{Barrier, OnceLock};
use tempfile::TempDir;

fn setup_test_ctx() -> (MigrationContext, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("test.db")).unwrap();
    let ctx = MigrationContext {
        db: Arc::new(db),
        sources: SourceRegistry::default(),
    };
    (ctx, temp_dir)
}

fn legacy_root_url(children: &[(i64, &str)]) -> String {
    let children: Vec<_> = children
        .iter()
        .map(|(source, url)| json!({ "source": source, "url": url }))
        .collect();
    json!({ "children": children }).to_string()
}

fn legacy_episode_url(source: i64, url: &str, owner: &str) -> String {
    json!({ "source": source, "url": url, "ownerEntryUrl": owner }).to_string()
}

fn episode(url: &str, number: f64, source_order: i64) -> NewEpisode {
    NewEpisode {
        url: url.to_string(),
        name: format!("Chapter {}", number),
        episode_number: Some(number),
        source_order,
        ..Default::default()
    }
}

struct Fixture {
    ctx: MigrationContext,
    _temp: TempDir,
    root: i64,
    a: i64,
    b: i64,
}

/// Members A (source 1) and B (source 2) with two episodes each, and a legacy
/// root listing A, B and a member that no longer exists.
fn setup_legacy_group() -> Fixture {
    let (ctx, temp) = setup_test_ctx();
    let db = &ctx.db;

    let a = db.insert_entry(1, "/a", "Series", None).unwrap();
    let b = db.insert_entry(2, "/b", "Series", None).unwrap();
    db.insert_episodes(a, &[episode("/a/1", 1.0, 1), episode("/a/2", 2.0, 0)])
        .unwrap();
    db.insert_episodes(b, &[episode("/b/1", 1.0, 1), episode("/b/2", 2.0, 0)])
        .unwrap();

    let root = db
        .insert_entry(
            MERGED_SOURCE_ID,
            &legacy_root_url(&[(1, "/a"), (2, "/b"), (3, "/gone")]),
            "Series (merged)",
            None,
        )
        .unwrap();

    Fixture {
        ctx,
        _temp: temp,
        root,
        a,
        b,
    }
}

// =========================================================================
// Legacy merge configuration
// =========================================================================

#[test]
fn test_migration_creates_references() {
    let f = setup_legacy_group();
    assert!(merge_config::migrate(&f.ctx).unwrap());

    let root = f.ctx.db.get_entry(f.root).unwrap().unwrap();
    assert_eq!(root.url, "/a");
    assert_eq!(root.source_id, MERGED_SOURCE_ID);

    let refs = f.ctx.db.get_references(f.root).unwrap();
    assert_eq!(refs.len(), 3);
    assert!(refs.iter().all(|r| r.group_url == "/a"));

    let root_refs: Vec<_> = refs
        .iter()
        .filter(|r| r.member_source_id == MERGED_SOURCE_ID)
        .collect();
    assert_eq!(root_refs.len(), 1);
    assert_eq!(root_refs[0].member_entry_id, Some(f.root));

    let ref_a = refs.iter().find(|r| r.member_entry_id == Some(f.a)).unwrap();
    let ref_b = refs.iter().find(|r| r.member_entry_id == Some(f.b)).unwrap();
    assert!(ref_a.is_info_source);
    assert!(!ref_b.is_info_source);
    assert!(ref_a.supplies_episode_updates && ref_b.supplies_episode_updates);
    assert!(ref_a.download_episodes && ref_b.download_episodes);
    assert_eq!(ref_a.member_entry_url, "/a");
    assert_eq!(ref_b.member_source_id, 2);
}

#[test]
fn test_missing_member_is_dropped() {
    let f = setup_legacy_group();
    merge_config::migrate(&f.ctx).unwrap();

    let refs = f.ctx.db.get_all_references().unwrap();
    assert!(refs.iter().all(|r| r.member_entry_url != "/gone"));
}

#[test]
fn test_migration_is_idempotent() {
    let f = setup_legacy_group();
    merge_config::migrate(&f.ctx).unwrap();
    let first = f.ctx.db.get_all_references().unwrap();

    assert!(merge_config::migrate(&f.ctx).unwrap());
    let second = f.ctx.db.get_all_references().unwrap();
    assert_eq!(first, second);
    assert_eq!(f.ctx.db.get_entry(f.root).unwrap().unwrap().url, "/a");
}

#[test]
fn test_non_legacy_roots_untouched() {
    let (ctx, _temp) = setup_test_ctx();
    let root = ctx
        .db
        .insert_entry(MERGED_SOURCE_ID, "/already-plain", "Plain", None)
        .unwrap();
    let empty = ctx
        .db
        .insert_entry(MERGED_SOURCE_ID, r#"{"children":[]}"#, "Empty", None)
        .unwrap();

    assert!(merge_config::migrate(&ctx).unwrap());
    assert_eq!(ctx.db.get_entry(root).unwrap().unwrap().url, "/already-plain");
    assert_eq!(
        ctx.db.get_entry(empty).unwrap().unwrap().url,
        r#"{"children":[]}"#
    );
    assert!(ctx.db.get_all_references().unwrap().is_empty());
}

#[test]
fn test_second_root_for_same_primary_is_skipped() {
    let f = setup_legacy_group();
    let twin = f
        .ctx
        .db
        .insert_entry(
            MERGED_SOURCE_ID,
            &legacy_root_url(&[(1, "/a"), (2, "/b"), (1, "/a")]),
            "Series (twin)",
            None,
        )
        .unwrap();

    assert!(merge_config::migrate(&f.ctx).unwrap());

    // Only the first root claims the "/a" url
    assert_eq!(f.ctx.db.get_entry(f.root).unwrap().unwrap().url, "/a");
    assert!(f.ctx.db.get_entry(twin).unwrap().unwrap().url.starts_with('{'));
    assert!(f.ctx.db.get_references(twin).unwrap().is_empty());
}

#[test]
fn test_legacy_progress_moves_to_member_episode() {
    let f = setup_legacy_group();
    let db = &f.ctx.db;
    db.insert_episodes(
        f.root,
        &[
            NewEpisode {
                url: legacy_episode_url(1, "/a/1", "/a"),
                name: "Chapter 1".to_string(),
                read: true,
                ..Default::default()
            },
            NewEpisode {
                url: legacy_episode_url(2, "/b/2", "/b"),
                name: "Chapter 2".to_string(),
                last_position_seen: 17,
                source_order: 1,
                ..Default::default()
            },
        ],
    )
    .unwrap();

    merge_config::migrate(&f.ctx).unwrap();

    assert!(db.get_episodes_by_owner(f.root, false).unwrap().is_empty());

    let a1 = db.get_episodes_by_url("/a/1").unwrap().remove(0);
    assert_eq!(a1.owner_entry_id, f.a);
    assert!(a1.read);

    let b2 = db.get_episodes_by_url("/b/2").unwrap().remove(0);
    assert_eq!(b2.owner_entry_id, f.b);
    assert!(!b2.read);
    assert_eq!(b2.last_position_seen, 17);

    // Untouched siblings keep their state
    let a2 = db.get_episodes_by_url("/a/2").unwrap().remove(0);
    assert!(!a2.read);
    assert_eq!(a2.version, 0);
}

#[test]
fn test_legacy_progress_never_regresses() {
    let f = setup_legacy_group();
    let db = &f.ctx.db;

    let a1 = db.get_episodes_by_url("/a/1").unwrap().remove(0);
    db.bulk_update_episodes(&[crate::database::PartialEpisodeUpdate {
        id: a1.id,
        read: Some(true),
        last_position_seen: Some(50),
        ..Default::default()
    }])
    .unwrap();

    db.insert_episodes(
        f.root,
        &[NewEpisode {
            url: legacy_episode_url(1, "/a/1", "/a"),
            name: "Chapter 1".to_string(),
            last_position_seen: 10,
            ..Default::default()
        }],
    )
    .unwrap();

    merge_config::migrate(&f.ctx).unwrap();

    let a1 = db.get_episode(a1.id).unwrap().unwrap();
    assert!(a1.read);
    assert_eq!(a1.last_position_seen, 50);
}

#[test]
fn test_legacy_rows_without_progress_are_deleted() {
    let f = setup_legacy_group();
    let db = &f.ctx.db;
    db.insert_episodes(
        f.root,
        &[
            NewEpisode {
                url: legacy_episode_url(1, "/a/2", "/a"),
                name: "Chapter 2".to_string(),
                ..Default::default()
            },
            NewEpisode {
                url: "not-a-locator".to_string(),
                name: "Chapter 9".to_string(),
                read: true,
                source_order: 1,
                ..Default::default()
            },
        ],
    )
    .unwrap();

    merge_config::migrate(&f.ctx).unwrap();

    assert!(db.get_episodes_by_owner(f.root, false).unwrap().is_empty());
    assert_eq!(db.get_episodes_by_owner(f.a, false).unwrap().len(), 2);
    assert!(db
        .get_episodes_by_owner(f.a, false)
        .unwrap()
        .iter()
        .all(|e| !e.read));
}

// =========================================================================
// Coordinator
// =========================================================================

fn succeed(_: &MigrationContext) -> Result<bool, AppError> {
    Ok(true)
}

fn report_failure(_: &MigrationContext) -> Result<bool, AppError> {
    Ok(false)
}

fn explode(_: &MigrationContext) -> Result<bool, AppError> {
    Err(AppError::Other("boom".to_string()))
}

#[test]
fn test_coordinator_records_version() {
    let f = setup_legacy_group();
    let coordinator = MigrationCoordinator::new(f.ctx.clone());
    assert_eq!(coordinator.current_version().unwrap(), 0);

    let report = coordinator.run().unwrap();
    assert!(report.succeeded());
    assert_eq!(report.from_version, 0);
    assert_eq!(report.to_version, 1);
    assert_eq!(report.applied, vec!["legacy_merge_config"]);
    assert_eq!(
        f.ctx.db.get_setting(SCHEMA_VERSION_KEY).unwrap().as_deref(),
        Some("1")
    );
    assert_eq!(f.ctx.db.get_references(f.root).unwrap().len(), 3);

    // Nothing left to apply
    let again = coordinator.run().unwrap();
    assert!(again.applied.is_empty());
    assert_eq!(again.from_version, 1);
    assert_eq!(again.to_version, 1);
}

#[test]
fn test_coordinator_runs_in_version_order_and_stops_on_error() {
    let (ctx, _temp) = setup_test_ctx();
    let coordinator = MigrationCoordinator::with_migrations(
        ctx.clone(),
        vec![
            Migration {
                version: 3,
                name: "third",
                run: succeed,
            },
            Migration {
                version: 2,
                name: "explode",
                run: explode,
            },
            Migration {
                version: 1,
                name: "first",
                run: succeed,
            },
        ],
    );

    let report = coordinator.run().unwrap();
    assert_eq!(report.applied, vec!["first"]);
    assert_eq!(report.to_version, 1);
    assert_eq!(report.failed, Some(("explode", "boom".to_string())));
    assert_eq!(coordinator.current_version().unwrap(), 1);

    // The failed step is retried on the next pass
    let retry = coordinator.run().unwrap();
    assert_eq!(retry.from_version, 1);
    assert_eq!(retry.failed.map(|(name, _)| name), Some("explode"));
}

#[test]
fn test_reported_failure_does_not_bump_version() {
    let (ctx, _temp) = setup_test_ctx();
    let coordinator = MigrationCoordinator::with_migrations(
        ctx,
        vec![Migration {
            version: 1,
            name: "flaky",
            run: report_failure,
        }],
    );

    let report = coordinator.run().unwrap();
    assert!(!report.succeeded());
    assert!(report.applied.is_empty());
    assert_eq!(coordinator.current_version().unwrap(), 0);
}

static STARTED: OnceLock<Barrier> = OnceLock::new();
static RELEASE: OnceLock<Barrier> = OnceLock::new();

fn block_until_released(_: &MigrationContext) -> Result<bool, AppError> {
    STARTED.get_or_init(|| Barrier::new(2)).wait();
    RELEASE.get_or_init(|| Barrier::new(2)).wait();
    Ok(true)
}

#[test]
fn test_concurrent_run_is_rejected() {
    let (ctx, _temp) = setup_test_ctx();
    let coordinator = Arc::new(MigrationCoordinator::with_migrations(
        ctx,
        vec![Migration {
            version: 1,
            name: "slow",
            run: block_until_released,
        }],
    ));

    let background = {
        let coordinator = coordinator.clone();
        std::thread::spawn(move || coordinator.run())
    };

    STARTED.get_or_init(|| Barrier::new(2)).wait();
    assert!(matches!(
        coordinator.run(),
        Err(AppError::MigrationInProgress)
    ));
    RELEASE.get_or_init(|| Barrier::new(2)).wait();

    let report = background.join().unwrap().unwrap();
    assert_eq!(report.applied, vec!["slow"]);

    // Guard is released once the pass ends
    assert!(coordinator.run().unwrap().applied.is_empty());
}
