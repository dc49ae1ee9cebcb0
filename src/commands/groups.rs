use crate::database::{Database, Entry, Episode, EpisodeSortMode, MemberReference, PartialEpisodeUpdate};
use crate::error::AppError;
use crate::merge;
use crate::sources::{SourceRegistry, MERGED_SOURCE_ID};
use std::collections::HashSet;

fn is_root(reference: &MemberReference) -> bool {
    reference.member_source_id == MERGED_SOURCE_ID
}

fn member_references(refs: &[MemberReference]) -> impl Iterator<Item = &MemberReference> {
    refs.iter().filter(|r| !is_root(r))
}

/// References of an existing group; `NotFound` when the group entry is gone.
fn load_group(db: &Database, group_id: i64) -> Result<Vec<MemberReference>, AppError> {
    let refs = db.get_references(group_id).map_err(AppError::lookup)?;
    if refs.is_empty() && db.get_entry(group_id).map_err(AppError::lookup)?.is_none() {
        return Err(AppError::NotFound(format!("merged group {}", group_id)));
    }
    Ok(refs)
}

fn root_reference(refs: &[MemberReference], group_id: i64) -> Result<MemberReference, AppError> {
    refs.iter()
        .find(|r| is_root(r))
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("root reference of merged group {}", group_id)))
}

/// Union of the members' episodes. A group without member references has not
/// been migrated yet and still owns its episodes directly.
fn raw_group_episodes(db: &Database, group_id: i64, refs: &[MemberReference]) -> Result<Vec<Episode>, AppError> {
    if member_references(refs).next().is_none() {
        log::debug!("Merged group {} has no member references, using its own episodes", group_id);
        return db
            .get_episodes_by_owner(group_id, true)
            .map_err(AppError::lookup);
    }

    let mut seen = HashSet::new();
    let mut raw = Vec::new();
    for member_id in member_references(refs).filter_map(|r| r.member_entry_id) {
        if !seen.insert(member_id) {
            continue;
        }
        let episodes = db
            .get_episodes_by_owner(member_id, true)
            .map_err(AppError::lookup)?;
        raw.extend(episodes);
    }
    Ok(raw)
}

/// Episode timeline of a merged group. `dedupe = false` returns the raw union
/// of all member episodes.
pub fn merged_episodes(db: &Database, group_id: i64, dedupe: bool) -> Result<Vec<Episode>, AppError> {
    let refs = load_group(db, group_id)?;
    let raw = raw_group_episodes(db, group_id, &refs)?;
    Ok(merge::resolve(group_id, raw, &refs, dedupe))
}

/// Create a merged group from existing entries. The first member supplies
/// metadata and the group's url; join order becomes the default priority.
pub fn merge_entries(db: &Database, title: &str, member_ids: &[i64]) -> Result<i64, AppError> {
    let mut seen = HashSet::new();
    let distinct: Vec<i64> = member_ids.iter().copied().filter(|id| seen.insert(*id)).collect();
    if distinct.len() < 2 {
        return Err(AppError::Other(
            "A merged group needs at least two distinct entries".to_string(),
        ));
    }

    let mut members = Vec::with_capacity(distinct.len());
    for id in &distinct {
        let entry = db
            .get_entry(*id)?
            .ok_or_else(|| AppError::NotFound(format!("entry {}", id)))?;
        if entry.source_id == MERGED_SOURCE_ID {
            return Err(AppError::Other(format!(
                "Entry {} is already a merged group",
                entry.id
            )));
        }
        members.push(entry);
    }

    let primary = &members[0];
    if db
        .get_entry_by_url_and_source(&primary.url, MERGED_SOURCE_ID)?
        .is_some()
    {
        return Err(AppError::Other(format!(
            "Entry {} already leads a merged group",
            primary.id
        )));
    }

    let group_id = db.insert_entry(
        MERGED_SOURCE_ID,
        &primary.url,
        title,
        primary.description.as_deref(),
    )?;

    // Root reference; the root entry stands in for the primary member.
    let mut refs = vec![MemberReference {
        id: None,
        is_info_source: false,
        supplies_episode_updates: false,
        episode_sort_mode: EpisodeSortMode::None,
        episode_priority: 0,
        download_episodes: false,
        group_id: Some(group_id),
        group_url: primary.url.clone(),
        member_entry_id: Some(group_id),
        member_entry_url: primary.url.clone(),
        member_source_id: MERGED_SOURCE_ID,
    }];
    refs.extend(members.iter().enumerate().map(|(position, member)| MemberReference {
        id: None,
        is_info_source: position == 0,
        supplies_episode_updates: true,
        episode_sort_mode: EpisodeSortMode::None,
        episode_priority: position as i32,
        download_episodes: true,
        group_id: Some(group_id),
        group_url: primary.url.clone(),
        member_entry_id: Some(member.id),
        member_entry_url: member.url.clone(),
        member_source_id: member.source_id,
    }));
    db.insert_references(&refs)?;

    log::info!("Created merged group {} with {} members", group_id, members.len());
    Ok(group_id)
}

/// Add an entry to a group as its least preferred member. Returns false when
/// it already was a member.
pub fn add_member(db: &Database, group_id: i64, entry_id: i64) -> Result<bool, AppError> {
    let refs = load_group(db, group_id)?;
    let root = root_reference(&refs, group_id)?;
    let entry = db
        .get_entry(entry_id)?
        .ok_or_else(|| AppError::NotFound(format!("entry {}", entry_id)))?;
    if entry.source_id == MERGED_SOURCE_ID {
        return Err(AppError::Other(format!(
            "Entry {} is a merged group and cannot be a member",
            entry_id
        )));
    }

    let next_priority = member_references(&refs)
        .map(|r| r.episode_priority)
        .max()
        .map_or(0, |p| p + 1);

    let inserted = db.insert_references(&[MemberReference {
        id: None,
        is_info_source: false,
        supplies_episode_updates: true,
        episode_sort_mode: EpisodeSortMode::None,
        episode_priority: next_priority,
        download_episodes: true,
        group_id: Some(group_id),
        group_url: root.group_url,
        member_entry_id: Some(entry.id),
        member_entry_url: entry.url,
        member_source_id: entry.source_id,
    }])?;
    Ok(inserted > 0)
}

/// Remove one member's reference. Its episodes stay with the member entry.
pub fn remove_member(db: &Database, group_id: i64, entry_id: i64) -> Result<usize, AppError> {
    let removed = db.delete_references_for_member(group_id, entry_id)?;
    if removed > 0 {
        log::info!("Removed entry {} from merged group {}", entry_id, group_id);
    }
    Ok(removed)
}

/// Delete the group's references and its root entry. Member entries and
/// their episodes are untouched.
pub fn dissolve_group(db: &Database, group_id: i64) -> Result<(), AppError> {
    let root = db
        .get_entry(group_id)?
        .ok_or_else(|| AppError::NotFound(format!("merged group {}", group_id)))?;
    if root.source_id != MERGED_SOURCE_ID {
        return Err(AppError::Other(format!(
            "Entry {} is not a merged group",
            group_id
        )));
    }

    let removed = db.delete_references_by_group(group_id)?;
    db.delete_entry(group_id)?;
    log::info!("Dissolved merged group {} ({} references)", group_id, removed);
    Ok(())
}

pub fn set_sort_mode(db: &Database, group_id: i64, mode: EpisodeSortMode) -> Result<(), AppError> {
    let refs = load_group(db, group_id)?;
    let mut root = root_reference(&refs, group_id)?;
    root.episode_sort_mode = mode;
    db.update_reference_settings(&root)?;
    Ok(())
}

/// Re-rank members: position in `ordered_member_ids` becomes the priority.
/// Members not listed keep their relative order after the listed ones.
pub fn set_priorities(db: &Database, group_id: i64, ordered_member_ids: &[i64]) -> Result<(), AppError> {
    let refs = load_group(db, group_id)?;
    let mut unlisted = ordered_member_ids.len() as i32;

    for reference in member_references(&refs) {
        let position = reference
            .member_entry_id
            .and_then(|id| ordered_member_ids.iter().position(|m| *m == id));
        let mut updated = reference.clone();
        updated.episode_priority = match position {
            Some(p) => p as i32,
            None => {
                unlisted += 1;
                unlisted - 1
            }
        };
        if updated.episode_priority != reference.episode_priority {
            db.update_reference_settings(&updated)?;
        }
    }
    Ok(())
}

/// Mark every member episode of the group, duplicates included.
pub fn mark_group_read(db: &Database, group_id: i64, read: bool) -> Result<usize, AppError> {
    let episodes = merged_episodes(db, group_id, false)?;
    let updates: Vec<PartialEpisodeUpdate> = episodes
        .iter()
        .filter(|e| e.read != read)
        .map(|e| PartialEpisodeUpdate {
            id: e.id,
            read: Some(read),
            ..Default::default()
        })
        .collect();
    Ok(db.bulk_update_episodes(&updates)?)
}

/// Resolved episodes restricted to members that allow downloads.
pub fn episodes_for_download(db: &Database, group_id: i64) -> Result<Vec<Episode>, AppError> {
    let refs = load_group(db, group_id)?;
    let allowed: HashSet<i64> = member_references(&refs)
        .filter(|r| r.download_episodes)
        .filter_map(|r| r.member_entry_id)
        .collect();

    let raw = raw_group_episodes(db, group_id, &refs)?;
    Ok(merge::resolve(group_id, raw, &refs, true)
        .into_iter()
        .filter(|e| allowed.contains(&e.owner_entry_id))
        .collect())
}

/// Member entries that should be refreshed when the group is updated.
pub fn members_for_update(db: &Database, group_id: i64) -> Result<Vec<Entry>, AppError> {
    let refs = load_group(db, group_id)?;
    let mut entries = Vec::new();
    for reference in member_references(&refs).filter(|r| r.supplies_episode_updates) {
        if let Some(entry) = reference
            .member_entry_id
            .map(|id| db.get_entry(id))
            .transpose()?
            .flatten()
        {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// The member that supplies the group's title, description and cover.
///
/// A single flagged member wins. Otherwise the most preferred member from a
/// metadata source is used, then simply the most preferred member.
pub fn info_source(db: &Database, sources: &SourceRegistry, group_id: i64) -> Result<Option<Entry>, AppError> {
    let refs = load_group(db, group_id)?;
    let members: Vec<&MemberReference> = member_references(&refs).collect();

    let flagged: Vec<&&MemberReference> = members.iter().filter(|r| r.is_info_source).collect();
    let chosen = if flagged.len() == 1 {
        Some(*flagged[0])
    } else {
        members
            .iter()
            .find(|r| sources.is_metadata_source(r.member_source_id))
            .or_else(|| members.first())
            .copied()
    };

    match chosen.and_then(|r| r.member_entry_id) {
        Some(id) => Ok(db.get_entry(id)?),
        None => Ok(None),
    }
}
