//! Reconciles the raw union of a merged group's episodes into one timeline.
//!
//! Everything here is pure: the same references and episodes always produce
//! the same output, and nothing is read from or written to storage.

use crate::database::{EpisodeSortMode, Episode, MemberReference};
use crate::sources::MERGED_SOURCE_ID;
use std::collections::HashMap;

/// Resolve the episode list of a merged group.
///
/// `raw_episodes` is the union of every member's episodes, in any order, and
/// `references` every reference row of the group. With `dedupe = false`, or
/// whenever the group's policy cannot be determined, the raw union is
/// returned unchanged.
pub fn resolve(
    group_id: i64,
    raw_episodes: Vec<Episode>,
    references: &[MemberReference],
    dedupe: bool,
) -> Vec<Episode> {
    if !dedupe || raw_episodes.is_empty() {
        return raw_episodes;
    }

    let mode = group_sort_mode(references);
    log::debug!(
        "Resolving merged group {} ({} raw episodes, mode {})",
        group_id,
        raw_episodes.len(),
        mode
    );

    match mode {
        EpisodeSortMode::None | EpisodeSortMode::NoDedupe => raw_episodes,
        EpisodeSortMode::MostEpisodes => keep_most_episodes(raw_episodes),
        EpisodeSortMode::HighestEpisodeNumber => keep_highest_episode_number(raw_episodes),
        EpisodeSortMode::Priority => dedupe_by_priority(raw_episodes, references),
    }
}

/// The policy stored on the group's root reference. Missing or duplicated
/// root references fall back to `None`.
pub fn group_sort_mode(references: &[MemberReference]) -> EpisodeSortMode {
    let mut roots = references
        .iter()
        .filter(|r| r.member_source_id == MERGED_SOURCE_ID);
    match (roots.next(), roots.next()) {
        (Some(root), None) => root.episode_sort_mode,
        (None, _) => EpisodeSortMode::None,
        (Some(_), Some(_)) => {
            log::warn!("Merged group has several root references, ignoring sort mode");
            EpisodeSortMode::None
        }
    }
}

/// Group episodes by owner, each group in source order. Owners are returned
/// by ascending entry id.
fn group_by_owner(episodes: Vec<Episode>) -> Vec<(i64, Vec<Episode>)> {
    let mut groups: HashMap<i64, Vec<Episode>> = HashMap::new();
    for episode in episodes {
        groups.entry(episode.owner_entry_id).or_default().push(episode);
    }

    let mut groups: Vec<(i64, Vec<Episode>)> = groups.into_iter().collect();
    groups.sort_by_key(|(owner, _)| *owner);
    for (_, list) in &mut groups {
        list.sort_by_key(|e| (e.source_order, e.id));
    }
    groups
}

fn keep_owner(episodes: Vec<Episode>, owner: i64) -> Vec<Episode> {
    episodes
        .into_iter()
        .filter(|e| e.owner_entry_id == owner)
        .collect()
}

/// Keep only the member with the most episodes; ties go to the lowest entry id.
fn keep_most_episodes(raw_episodes: Vec<Episode>) -> Vec<Episode> {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for episode in &raw_episodes {
        *counts.entry(episode.owner_entry_id).or_default() += 1;
    }

    let winner = counts
        .into_iter()
        .max_by(|(a_owner, a_count), (b_owner, b_count)| {
            a_count.cmp(b_count).then_with(|| b_owner.cmp(a_owner))
        })
        .map(|(owner, _)| owner);

    match winner {
        Some(owner) => keep_owner(raw_episodes, owner),
        None => raw_episodes,
    }
}

/// Keep only the member owning the highest recognized episode number; ties go
/// to the lowest entry id.
fn keep_highest_episode_number(raw_episodes: Vec<Episode>) -> Vec<Episode> {
    let winner = raw_episodes
        .iter()
        .filter(|e| e.is_recognized_number())
        .max_by(|a, b| {
            a.episode_number
                .total_cmp(&b.episode_number)
                .then_with(|| b.owner_entry_id.cmp(&a.owner_entry_id))
        })
        .map(|e| e.owner_entry_id);

    match winner {
        Some(owner) => keep_owner(raw_episodes, owner),
        None => raw_episodes,
    }
}

/// Walk members from most to least preferred. A member's episode is dropped
/// when a preferred member already placed the same recognized number;
/// everything else is inserted right after the last episode this member
/// placed or matched, which keeps each member's local order intact.
fn dedupe_by_priority(raw_episodes: Vec<Episode>, references: &[MemberReference]) -> Vec<Episode> {
    let priorities: HashMap<i64, i32> = references
        .iter()
        .filter(|r| r.member_source_id != MERGED_SOURCE_ID)
        .filter_map(|r| r.member_entry_id.map(|id| (id, r.episode_priority)))
        .collect();

    let mut groups = group_by_owner(raw_episodes);
    // Stable sort: equal priorities keep ascending entry id order.
    groups.sort_by_key(|(owner, _)| {
        priorities
            .get(owner)
            .map_or(i64::MAX, |p| i64::from(*p))
    });

    let mut merged: Vec<Episode> = Vec::new();
    for (_, episodes) in groups {
        let mut cursor: Option<usize> = None;
        for episode in episodes {
            if episode.is_recognized_number() {
                let existing = merged.iter().position(|placed| {
                    placed.owner_entry_id != episode.owner_entry_id
                        && placed.is_recognized_number()
                        && placed.episode_number == episode.episode_number
                });
                if let Some(index) = existing {
                    cursor = Some(index);
                    continue;
                }
            }
            let at = cursor.map_or(0, |c| c + 1);
            merged.insert(at, episode);
            cursor = Some(at);
        }
    }

    for (index, episode) in merged.iter_mut().enumerate() {
        episode.source_order = index as i64;
    }
    merged
}
