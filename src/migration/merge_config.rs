//! Materializes join configuration that older versions embedded in merge-root
//! urls into `merged_references` rows, and moves reading progress from the
//! old per-root episode copies onto the member-owned episodes.

use super::legacy::{self, LegacyEpisodeUrl};
use super::MigrationContext;
use crate::database::{
    EntryUrlUpdate, Entry, EpisodeSortMode, MemberReference, PartialEpisodeUpdate,
};
use crate::error::AppError;
use std::collections::{HashMap, HashSet};

/// A merge root whose legacy configuration resolved to a migration target.
struct PlannedGroup {
    root: Entry,
    new_url: String,
    members: Vec<Entry>,
}

/// Run the legacy merge configuration migration. Safe to re-run: roots whose
/// url no longer parses, or whose target already exists, are skipped.
pub fn migrate(ctx: &MigrationContext) -> Result<bool, AppError> {
    let groups = plan_groups(ctx)?;
    if groups.is_empty() {
        log::info!("No legacy merge configurations to migrate");
        return Ok(true);
    }

    let references = persist_groups(ctx, &groups)?;
    let (deleted, updated) = reconcile_progress(ctx, &groups)?;

    log::info!(
        "Migrated {} merged groups: {} references, {} legacy episodes removed, {} episodes updated",
        groups.len(),
        references,
        deleted,
        updated
    );
    Ok(true)
}

fn plan_groups(ctx: &MigrationContext) -> Result<Vec<PlannedGroup>, AppError> {
    let merged_source = ctx.sources.merged_source_id();
    let roots = ctx.db.get_entries_by_source(merged_source)?;

    let mut claimed: HashSet<String> = HashSet::new();
    let mut groups = Vec::new();

    for root in roots {
        let Some(config) = legacy::parse_merge_config(&root.url) else {
            continue;
        };
        let children = config.distinct_children();
        let Some(primary) = children.first() else {
            continue;
        };

        if claimed.contains(&primary.url)
            || ctx
                .db
                .get_entry_by_url_and_source(&primary.url, merged_source)?
                .is_some()
        {
            log::info!(
                "Merge root {} already migrated to {}, skipping",
                root.id,
                primary.url
            );
            continue;
        }
        claimed.insert(primary.url.clone());

        let mut members = Vec::with_capacity(children.len());
        for child in &children {
            match ctx.db.get_entry_by_url_and_source(&child.url, child.source)? {
                Some(entry) => members.push(entry),
                None => log::warn!(
                    "Dropping member {} (source {}) of merge root {}: entry not found",
                    child.url,
                    child.source,
                    root.id
                ),
            }
        }

        groups.push(PlannedGroup {
            new_url: primary.url.clone(),
            root,
            members,
        });
    }

    Ok(groups)
}

/// Rewrite root urls and insert the reference rows. Returns the number of
/// references inserted.
fn persist_groups(ctx: &MigrationContext, groups: &[PlannedGroup]) -> Result<usize, AppError> {
    let merged_source = ctx.sources.merged_source_id();

    let url_updates: Vec<EntryUrlUpdate> = groups
        .iter()
        .map(|g| EntryUrlUpdate {
            id: g.root.id,
            url: g.new_url.clone(),
        })
        .collect();

    let mut references = Vec::new();
    for group in groups {
        // Root reference. Its member is the root entry itself, which now
        // carries the primary member's url. Sort mode and priorities are
        // supplied again from user settings.
        references.push(MemberReference {
            id: None,
            is_info_source: false,
            supplies_episode_updates: false,
            episode_sort_mode: EpisodeSortMode::None,
            episode_priority: 0,
            download_episodes: false,
            group_id: Some(group.root.id),
            group_url: group.new_url.clone(),
            member_entry_id: Some(group.root.id),
            member_entry_url: group.new_url.clone(),
            member_source_id: merged_source,
        });

        for (position, member) in group.members.iter().enumerate() {
            references.push(MemberReference {
                id: None,
                is_info_source: position == 0,
                supplies_episode_updates: true,
                episode_sort_mode: EpisodeSortMode::None,
                episode_priority: position as i32,
                download_episodes: true,
                group_id: Some(group.root.id),
                group_url: group.new_url.clone(),
                member_entry_id: Some(member.id),
                member_entry_url: member.url.clone(),
                member_source_id: member.source_id,
            });
        }
    }

    ctx.db.bulk_update_entry_urls(&url_updates)?;
    let inserted = ctx.db.insert_references(&references)?;
    Ok(inserted)
}

/// Copy progress from legacy episode rows onto the matching member episodes,
/// then drop every legacy row. Returns (deleted, updated).
fn reconcile_progress(
    ctx: &MigrationContext,
    groups: &[PlannedGroup],
) -> Result<(usize, usize), AppError> {
    let mut legacy_ids = Vec::new();
    let mut with_progress: Vec<(LegacyEpisodeUrl, bool, i64)> = Vec::new();

    for group in groups {
        for episode in ctx.db.get_episodes_by_owner(group.root.id, false)? {
            legacy_ids.push(episode.id);
            if !episode.has_progress() {
                continue;
            }
            if let Some(locator) = legacy::parse_episode_url(&episode.url) {
                with_progress.push((locator, episode.read, episode.last_position_seen));
            }
        }
    }

    // (url, source, owner url) -> canonical episode
    let mut canonical: HashMap<(String, i64, String), (i64, bool, i64)> = HashMap::new();
    if !with_progress.is_empty() {
        for group in groups {
            for member in &group.members {
                for episode in ctx.db.get_episodes_by_owner(member.id, false)? {
                    canonical.insert(
                        (episode.url, member.source_id, member.url.clone()),
                        (episode.id, episode.read, episode.last_position_seen),
                    );
                }
            }
        }
    }

    let mut updates = Vec::new();
    for (locator, read, last_position_seen) in with_progress {
        let key = (locator.url, locator.source, locator.owner_entry_url);
        match canonical.get(&key) {
            Some(&(id, current_read, current_position)) => updates.push(PartialEpisodeUpdate {
                id,
                read: Some(read || current_read),
                last_position_seen: Some(last_position_seen.max(current_position)),
                ..Default::default()
            }),
            None => log::debug!(
                "No member episode for legacy progress on {} (source {})",
                key.0,
                key.1
            ),
        }
    }

    let deleted = ctx.db.bulk_delete_episodes(&legacy_ids)?;
    let updated = ctx.db.bulk_update_episodes(&updates)?;
    Ok((deleted, updated))
}
