//! Run summary assembly.
//!
//! Stage outputs are collected into an insertion-ordered mapping that the
//! document exporters iterate in order, plus a flat log with one line per entry.

use crate::error::Result;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::path::Path;
use tracing::info;

/// Summary keys written by the pipeline, in the order they are produced.
pub mod keys {
    pub const OLD_QUESTION: &str = "Old Question";
    pub const NEW_QUESTION: &str = "New Question";
    pub const RATIONALE: &str = "Rationale";
    pub const DOCUMENT_TITLE: &str = "Document Title";
    pub const FILE_TITLE: &str = "File Title";
    pub const CLINICAL_STATEMENT: &str = "Best clinical question statement";
    pub const POPULATION_STATEMENT: &str = "Population Statement";
    pub const INCLUSION_EXCLUSION: &str = "Inclusion and Exclusion Criteria";
    pub const SEARCH_STRATEGY: &str = "Final Search Strategy";
    pub const DATABASES: &str = "List of suggested databases";
    pub const ALL_DATABASE_STRATEGY: &str = "All Database Strategy";
    pub const PUBMED_QUERY: &str = "Pubmed Query";

    /// Key of the strategy entry for one database
    pub fn database_strategy(database: &str) -> String {
        format!("Search strategy specific to {}", database)
    }
}

/// Ordered mapping of stage label to stage output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    entries: Vec<(String, String)>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, keeping its original position if it already exists
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flat log: one `key: value` line per entry, each newline-terminated
    pub fn to_log_text(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}: {}\n", k, v))
            .collect()
    }

    /// Write the flat log to `path`
    pub fn write_log(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_log_text())?;
        info!(path = %path.display(), entries = self.entries.len(), "Wrote summary log");
        Ok(())
    }
}

impl Serialize for RunSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}
