//! Static tool classification: category, parallelizability, cacheability,
//! timeout, priority, and fallback substitutes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Tool category. Write, Database and Agent tools are critical: their side
/// effects may depend on execution order, so they always run sequentially
/// and a failure aborts the rest of the sequential batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Read,
    Write,
    Search,
    Database,
    Agent,
    External,
    Unknown,
}

impl ToolCategory {
    /// Whether a failure in this category halts remaining sequential work.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ToolCategory::Write | ToolCategory::Database | ToolCategory::Agent
        )
    }
}

/// Classification record for one tool name. Never mutated per-call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub category: ToolCategory,
    pub parallelizable: bool,
    /// Write-like tools are never cacheable; a cached write is a correctness
    /// bug, not a staleness trade-off.
    pub cacheable: bool,
    pub timeout_ms: u64,
    /// Lower runs/orders first.
    pub priority: u8,
    /// Substitute tools tried (one substitution, no chains) after retries
    /// are exhausted.
    pub fallback_names: Vec<String>,
}

impl ToolMetadata {
    /// Category defaults used both for explicit registration and for
    /// naming-convention inference.
    pub fn for_category(category: ToolCategory) -> Self {
        let (parallelizable, cacheable, timeout_ms, priority) = match category {
            ToolCategory::Read => (true, true, 10_000, 1),
            ToolCategory::Search => (true, true, 15_000, 2),
            ToolCategory::External => (true, false, 30_000, 2),
            ToolCategory::Write => (false, false, 15_000, 3),
            ToolCategory::Database => (false, false, 20_000, 3),
            ToolCategory::Agent => (false, false, 60_000, 4),
            ToolCategory::Unknown => (false, false, 10_000, 5),
        };
        Self {
            category,
            parallelizable,
            cacheable,
            timeout_ms,
            priority,
            fallback_names: Vec::new(),
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_fallbacks(mut self, fallback_names: Vec<String>) -> Self {
        self.fallback_names = fallback_names;
        self
    }
}

/// Infer a category from naming conventions when a tool was never registered.
pub fn infer_category(name: &str) -> ToolCategory {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("get") || lower.starts_with("list") {
        ToolCategory::Read
    } else if lower.starts_with("search") || lower.starts_with("find") {
        ToolCategory::Search
    } else if lower.starts_with("create") || lower.starts_with("update") || lower.starts_with("delete")
    {
        ToolCategory::Write
    } else {
        ToolCategory::Unknown
    }
}

/// Registry of tool classifications with naming-convention fallback.
#[derive(Debug, Clone, Default)]
pub struct ToolMetadataRegistry {
    entries: HashMap<String, ToolMetadata>,
}

impl ToolMetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register explicit metadata for a tool name.
    pub fn register(&mut self, name: impl Into<String>, metadata: ToolMetadata) {
        self.entries.insert(name.into(), metadata);
    }

    /// Register a tool with its category defaults.
    pub fn register_category(&mut self, name: impl Into<String>, category: ToolCategory) {
        self.register(name, ToolMetadata::for_category(category));
    }

    /// Resolve metadata for a tool name, inferring from naming conventions
    /// when the tool was never registered.
    pub fn resolve(&self, name: &str) -> ToolMetadata {
        if let Some(metadata) = self.entries.get(name) {
            return metadata.clone();
        }
        let category = infer_category(name);
        tracing::debug!(tool = %name, category = ?category, "inferred tool category from name");
        ToolMetadata::for_category(category)
    }

    /// First registered fallback for the same category, if any.
    pub fn fallback_for(&self, name: &str) -> Option<String> {
        let metadata = self.resolve(name);
        metadata
            .fallback_names
            .iter()
            .find(|candidate| {
                candidate.as_str() != name
                    && self.resolve(candidate).category == metadata.category
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_defaults_keep_writes_sequential() {
        for category in [
            ToolCategory::Write,
            ToolCategory::Database,
            ToolCategory::Agent,
        ] {
            let metadata = ToolMetadata::for_category(category);
            assert!(!metadata.parallelizable, "{category:?} must be sequential");
            assert!(!metadata.cacheable, "{category:?} must not be cacheable");
            assert!(category.is_critical());
        }
    }

    #[test]
    fn reads_are_parallel_and_cacheable() {
        let metadata = ToolMetadata::for_category(ToolCategory::Read);
        assert!(metadata.parallelizable);
        assert!(metadata.cacheable);
        assert!(!ToolCategory::Read.is_critical());
    }

    #[test]
    fn naming_convention_inference() {
        assert_eq!(infer_category("get_note"), ToolCategory::Read);
        assert_eq!(infer_category("listFolders"), ToolCategory::Read);
        assert_eq!(infer_category("search_notes"), ToolCategory::Search);
        assert_eq!(infer_category("find_user"), ToolCategory::Search);
        assert_eq!(infer_category("create_folder"), ToolCategory::Write);
        assert_eq!(infer_category("update_note"), ToolCategory::Write);
        assert_eq!(infer_category("delete_note"), ToolCategory::Write);
        assert_eq!(infer_category("frobnicate"), ToolCategory::Unknown);
    }

    #[test]
    fn resolve_prefers_registered_over_inferred() {
        let mut registry = ToolMetadataRegistry::new();
        registry.register(
            "get_report",
            ToolMetadata::for_category(ToolCategory::Database).with_timeout_ms(25_000),
        );

        let metadata = registry.resolve("get_report");
        assert_eq!(metadata.category, ToolCategory::Database);
        assert_eq!(metadata.timeout_ms, 25_000);

        // Unregistered name falls back to inference
        assert_eq!(registry.resolve("get_note").category, ToolCategory::Read);
    }

    #[test]
    fn fallback_requires_same_category() {
        let mut registry = ToolMetadataRegistry::new();
        registry.register(
            "search_notes",
            ToolMetadata::for_category(ToolCategory::Search)
                .with_fallbacks(vec!["create_note".to_string(), "find_notes".to_string()]),
        );
        registry.register_category("create_note", ToolCategory::Write);
        registry.register_category("find_notes", ToolCategory::Search);

        // create_note is skipped: different category
        assert_eq!(
            registry.fallback_for("search_notes"),
            Some("find_notes".to_string())
        );
        assert_eq!(registry.fallback_for("find_notes"), None);
    }
}
