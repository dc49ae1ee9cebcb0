use std::collections::HashSet;

/// Pseudo-source id owning every synthetic merge-root entry.
pub const MERGED_SOURCE_ID: i64 = 6969;

/// Lookup of source capabilities, built once from configuration at startup
/// and handed to whoever needs it.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    metadata_sources: HashSet<i64>,
}

impl SourceRegistry {
    pub fn new(metadata_sources: impl IntoIterator<Item = i64>) -> Self {
        Self {
            metadata_sources: metadata_sources.into_iter().collect(),
        }
    }

    pub fn merged_source_id(&self) -> i64 {
        MERGED_SOURCE_ID
    }

    pub fn is_merged_source(&self, source_id: i64) -> bool {
        source_id == MERGED_SOURCE_ID
    }

    /// Whether the source provides its own title/description/cover metadata.
    pub fn is_metadata_source(&self, source_id: i64) -> bool {
        self.metadata_sources.contains(&source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookups() {
        let registry = SourceRegistry::new([10, 20]);
        assert!(registry.is_metadata_source(10));
        assert!(!registry.is_metadata_source(30));
        assert!(registry.is_merged_source(MERGED_SOURCE_ID));
        assert!(!registry.is_merged_source(10));
    }
}
