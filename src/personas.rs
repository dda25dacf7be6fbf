//! Persona catalogue.
//!
//! Maps each pipeline stage to the instruction text that conditions the LLM for
//! that stage. The catalogue is loaded once at startup, validated, and then only
//! read for the rest of the run.

use crate::error::{Result, StrategyError};
use crate::prompts::personas as builtin;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default catalogue path: `<config_dir>/synthscope/personas.json`
pub fn default_catalogue_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("synthscope").join("personas.json"))
}

/// Identifier of one persona in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PersonaKey {
    QuestionDeveloper,
    DocTitleDeveloper,
    FileTitleDeveloper,
    IntOrExpDeveloper,
    PicoDeveloper,
    PecoDeveloper,
    SpiderDeveloper,
    IncExcDeveloper,
    SearchStratDeveloper,
    DatabaseDeveloper,
    ListReturner,
    DatabaseSearchStratDeveloper,
    PubmedQueryDeveloper,
}

impl PersonaKey {
    /// Every key a catalogue must define
    pub const ALL: [PersonaKey; 13] = [
        PersonaKey::QuestionDeveloper,
        PersonaKey::DocTitleDeveloper,
        PersonaKey::FileTitleDeveloper,
        PersonaKey::IntOrExpDeveloper,
        PersonaKey::PicoDeveloper,
        PersonaKey::PecoDeveloper,
        PersonaKey::SpiderDeveloper,
        PersonaKey::IncExcDeveloper,
        PersonaKey::SearchStratDeveloper,
        PersonaKey::DatabaseDeveloper,
        PersonaKey::ListReturner,
        PersonaKey::DatabaseSearchStratDeveloper,
        PersonaKey::PubmedQueryDeveloper,
    ];

    /// Key as written in catalogue files
    pub fn as_str(&self) -> &'static str {
        match self {
            PersonaKey::QuestionDeveloper => "question_developer",
            PersonaKey::DocTitleDeveloper => "doctitle_developer",
            PersonaKey::FileTitleDeveloper => "filetitle_developer",
            PersonaKey::IntOrExpDeveloper => "intorexp_developer",
            PersonaKey::PicoDeveloper => "PICO_developer",
            PersonaKey::PecoDeveloper => "PECO_developer",
            PersonaKey::SpiderDeveloper => "SPIDER_developer",
            PersonaKey::IncExcDeveloper => "incexc_developer",
            PersonaKey::SearchStratDeveloper => "searchstrat_developer",
            PersonaKey::DatabaseDeveloper => "database_developer",
            PersonaKey::ListReturner => "list_returner",
            PersonaKey::DatabaseSearchStratDeveloper => "databasesearchstrat_developer",
            PersonaKey::PubmedQueryDeveloper => "pubmedquery_developer",
        }
    }

    fn builtin_text(&self) -> &'static str {
        match self {
            PersonaKey::QuestionDeveloper => builtin::QUESTION_DEVELOPER,
            PersonaKey::DocTitleDeveloper => builtin::DOCTITLE_DEVELOPER,
            PersonaKey::FileTitleDeveloper => builtin::FILETITLE_DEVELOPER,
            PersonaKey::IntOrExpDeveloper => builtin::INTOREXP_DEVELOPER,
            PersonaKey::PicoDeveloper => builtin::PICO_DEVELOPER,
            PersonaKey::PecoDeveloper => builtin::PECO_DEVELOPER,
            PersonaKey::SpiderDeveloper => builtin::SPIDER_DEVELOPER,
            PersonaKey::IncExcDeveloper => builtin::INCEXC_DEVELOPER,
            PersonaKey::SearchStratDeveloper => builtin::SEARCHSTRAT_DEVELOPER,
            PersonaKey::DatabaseDeveloper => builtin::DATABASE_DEVELOPER,
            PersonaKey::ListReturner => builtin::LIST_RETURNER,
            PersonaKey::DatabaseSearchStratDeveloper => builtin::DATABASESEARCHSTRAT_DEVELOPER,
            PersonaKey::PubmedQueryDeveloper => builtin::PUBMEDQUERY_DEVELOPER,
        }
    }
}

impl fmt::Display for PersonaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable stage-to-persona mapping.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct PersonaCatalogue {
    entries: BTreeMap<&'static str, String>,
}

impl PersonaCatalogue {
    /// Catalogue made of the compiled-in persona texts
    pub fn builtin() -> Self {
        let entries = PersonaKey::ALL
            .iter()
            .map(|k| (k.as_str(), k.builtin_text().to_string()))
            .collect();
        Self { entries }
    }

    /// Build a catalogue from a raw key/text mapping.
    ///
    /// Fails with a configuration error naming every missing or blank key.
    /// Unknown keys are ignored.
    pub fn from_map(raw: BTreeMap<String, String>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut missing = Vec::new();

        for key in PersonaKey::ALL {
            match raw.get(key.as_str()) {
                Some(text) if !text.trim().is_empty() => {
                    entries.insert(key.as_str(), text.clone());
                }
                _ => missing.push(key.as_str()),
            }
        }

        if !missing.is_empty() {
            return Err(StrategyError::Configuration(format!(
                "persona catalogue is missing keys: {}",
                missing.join(", ")
            )));
        }

        let extra = raw.len() - entries.len();
        if extra > 0 {
            debug!(extra, "Ignoring unknown persona keys");
        }

        Ok(Self { entries })
    }

    /// Parse a catalogue from JSON text (an object of string values)
    pub fn from_json(json: &str) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(transparent)]
        struct RawCatalogue(BTreeMap<String, String>);

        let raw: RawCatalogue = serde_json::from_str(json).map_err(|e| {
            StrategyError::Configuration(format!("persona catalogue is not a string map: {}", e))
        })?;
        Self::from_map(raw.0)
    }

    /// Load a catalogue file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrategyError::Configuration(format!(
                "cannot read persona catalogue {}: {}",
                path.display(),
                e
            ))
        })?;
        let catalogue = Self::from_json(&content)?;
        info!(path = %path.display(), count = catalogue.entries.len(), "Loaded persona catalogue");
        Ok(catalogue)
    }

    /// Load from `path`, else the default path if it exists, else the builtin set
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_catalogue_path() {
            Some(default) if default.exists() => Self::load(&default),
            _ => {
                debug!("Using built-in persona catalogue");
                Ok(Self::builtin())
            }
        }
    }

    /// Persona text for `key`
    pub fn get(&self, key: PersonaKey) -> &str {
        // construction guarantees every key is present
        self.entries.get(key.as_str()).map(String::as_str).unwrap_or_default()
    }

    /// Serialize as pretty JSON, suitable for editing and reloading
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl Default for PersonaCatalogue {
    fn default() -> Self {
        Self::builtin()
    }
}
