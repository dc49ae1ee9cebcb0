use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ============================================================================
// Entries (one per upstream source entry, plus synthetic merge roots)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entry {
    pub id: i64,
    pub source_id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub added_at: String,
}

/// Rewrite of a single entry's `url` column.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryUrlUpdate {
    pub id: i64,
    pub url: String,
}

// ============================================================================
// Episodes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    pub id: i64,
    pub owner_entry_id: i64,
    pub url: String,
    pub name: String,
    pub scanlator: Option<String>,
    /// Negative or non-finite means the number was not recognized.
    pub episode_number: f64,
    pub source_order: i64,
    pub read: bool,
    pub bookmark: bool,
    pub last_position_seen: i64,
    pub date_fetch: i64,
    pub date_upload: i64,
    pub version: i64,
}

impl Episode {
    pub fn is_recognized_number(&self) -> bool {
        self.episode_number.is_finite() && self.episode_number >= 0.0
    }

    pub fn has_progress(&self) -> bool {
        self.read || self.last_position_seen != 0
    }
}

/// Episode row as reported by a source, before it has an id.
#[derive(Debug, Clone, Default)]
pub struct NewEpisode {
    pub url: String,
    pub name: String,
    pub scanlator: Option<String>,
    /// `None` asks the repository to recognize the number from `name`.
    pub episode_number: Option<f64>,
    pub source_order: i64,
    pub read: bool,
    pub bookmark: bool,
    pub last_position_seen: i64,
    pub date_upload: i64,
}

/// Field-level update of an episode row. Unset fields are left untouched.
///
/// When `expected_version` is set the update only lands if the row still
/// carries that version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialEpisodeUpdate {
    pub id: i64,
    pub read: Option<bool>,
    pub bookmark: Option<bool>,
    pub last_position_seen: Option<i64>,
    pub expected_version: Option<i64>,
}

/// Recognize an episode number from a display name such as "Chapter 12",
/// "Ep. 3.5" or "#7". Returns `-1.0` when nothing matches.
pub fn recognize_episode_number(name: &str) -> f64 {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"(?i)\b(?:chapter|chap|ch\.?)\s*(\d+(?:\.\d+)?)",
            r"(?i)\b(?:episode|ep\.?)\s*(\d+(?:\.\d+)?)",
            r"#(\d+(?:\.\d+)?)",
            r"^\s*(\d+(?:\.\d+)?)\s*(?:[-:.]|$)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    for re in patterns {
        if let Some(num) = re.captures(name).and_then(|caps| caps.get(1)) {
            if let Ok(n) = num.as_str().parse::<f64>() {
                return n;
            }
        }
    }
    -1.0
}

// ============================================================================
// Merge references
// ============================================================================

/// How a merged group reconciles episodes that several members provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeSortMode {
    None,
    NoDedupe,
    Priority,
    MostEpisodes,
    HighestEpisodeNumber,
}

impl Default for EpisodeSortMode {
    fn default() -> Self {
        Self::None
    }
}

impl EpisodeSortMode {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::None => 0,
            Self::NoDedupe => 1,
            Self::Priority => 2,
            Self::MostEpisodes => 3,
            Self::HighestEpisodeNumber => 4,
        }
    }
}

/// Unknown stored values degrade to `None`.
impl From<i64> for EpisodeSortMode {
    fn from(v: i64) -> Self {
        match v {
            1 => Self::NoDedupe,
            2 => Self::Priority,
            3 => Self::MostEpisodes,
            4 => Self::HighestEpisodeNumber,
            _ => Self::None,
        }
    }
}

impl std::fmt::Display for EpisodeSortMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::NoDedupe => write!(f, "no_dedupe"),
            Self::Priority => write!(f, "priority"),
            Self::MostEpisodes => write!(f, "most_episodes"),
            Self::HighestEpisodeNumber => write!(f, "highest_episode_number"),
        }
    }
}

impl std::str::FromStr for EpisodeSortMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "no_dedupe" => Ok(Self::NoDedupe),
            "priority" => Ok(Self::Priority),
            "most_episodes" => Ok(Self::MostEpisodes),
            "highest_episode_number" => Ok(Self::HighestEpisodeNumber),
            other => Err(format!("unknown sort mode: {}", other)),
        }
    }
}

/// Membership of one source entry in a merged group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberReference {
    /// `None` until the row has been inserted.
    pub id: Option<i64>,
    pub is_info_source: bool,
    pub supplies_episode_updates: bool,
    /// Only meaningful on the group's root reference.
    pub episode_sort_mode: EpisodeSortMode,
    /// Lower is preferred.
    pub episode_priority: i32,
    pub download_episodes: bool,
    pub group_id: Option<i64>,
    pub group_url: String,
    pub member_entry_id: Option<i64>,
    pub member_entry_url: String,
    pub member_source_id: i64,
}
