//! Read-only parsers for configuration that older versions stored inside
//! `url` columns. Nothing writes these formats any more.

use serde::Deserialize;

/// Join configuration formerly stored as a merge root's url:
/// `{"children": [{"source": 1, "url": "/a"}, ...]}`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LegacyMergeConfig {
    pub children: Vec<LegacyMergeChild>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Hash)]
pub struct LegacyMergeChild {
    pub source: i64,
    pub url: String,
}

/// Episode locator formerly stored as a merged episode's url:
/// `{"source": 1, "url": "/e/1", "ownerEntryUrl": "/a"}`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEpisodeUrl {
    pub source: i64,
    pub url: String,
    pub owner_entry_url: String,
}

impl LegacyMergeConfig {
    /// Children with repeated (source, url) pairs removed, join order kept.
    pub fn distinct_children(&self) -> Vec<LegacyMergeChild> {
        let mut seen = std::collections::HashSet::new();
        self.children
            .iter()
            .filter(|child| seen.insert((*child).clone()))
            .cloned()
            .collect()
    }
}

/// `None` when the url is not a legacy join configuration or lists no children.
pub fn parse_merge_config(url: &str) -> Option<LegacyMergeConfig> {
    let trimmed = url.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<LegacyMergeConfig>(trimmed) {
        Ok(config) if !config.children.is_empty() => Some(config),
        Ok(_) => None,
        Err(e) => {
            log::debug!("Not a legacy merge config ({}): {}", e, trimmed);
            None
        }
    }
}

pub fn parse_episode_url(url: &str) -> Option<LegacyEpisodeUrl> {
    let trimmed = url.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}
