//! Summary export.
//!
//! Renders a finished [`RunSummary`] into downloadable artifacts: the plain
//! text log, a Markdown report laid out like the review document, and JSON
//! and CSV dumps of the ordered mapping.

use crate::error::{Result, StrategyError};
use crate::extract::clean_title;
use crate::summary::{keys, RunSummary};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// File stem used when the model's file title sanitizes to nothing
const FALLBACK_FILE_STEM: &str = "search_strategy";

/// Plain-text log file name inside the output folder
pub const LOG_FILE_NAME: &str = "summary.txt";

/// Report sections in document order: (heading, summary key)
const REPORT_SECTIONS: &[(&str, &str)] = &[
    ("Old Question", keys::OLD_QUESTION),
    ("New Question", keys::NEW_QUESTION),
    ("Rationale", keys::RATIONALE),
    ("Best Clinical Question Statement", keys::CLINICAL_STATEMENT),
    ("Population Statement", keys::POPULATION_STATEMENT),
    ("Inclusion and Exclusion Criteria", keys::INCLUSION_EXCLUSION),
    ("Final Search Strategy", keys::SEARCH_STRATEGY),
    ("List of suggested databases", keys::DATABASES),
    ("All Database Strategy", keys::ALL_DATABASE_STRATEGY),
    ("Pubmed Query", keys::PUBMED_QUERY),
];

/// Filesystem-safe file stem from the "File Title" answer.
///
/// Quotes and a trailing `.pdf` are stripped; anything other than letters,
/// digits, `-` and `_` becomes `_`.
pub fn file_base_name(file_title: &str) -> String {
    let title = clean_title(file_title);
    let title = if title.to_ascii_lowercase().ends_with(".pdf") {
        &title[..title.len() - 4]
    } else {
        title.as_str()
    };

    let mut stem = String::with_capacity(title.len());
    for c in title.trim().chars() {
        if c.is_alphanumeric() || c == '-' || c == '_' {
            stem.push(c);
        } else if !stem.ends_with('_') {
            stem.push('_');
        }
    }
    let stem = stem.trim_matches('_');

    if stem.is_empty() {
        FALLBACK_FILE_STEM.to_string()
    } else {
        stem.to_string()
    }
}

/// Render the summary as a Markdown report
pub fn render_markdown(summary: &RunSummary) -> String {
    let title = summary
        .get(keys::DOCUMENT_TITLE)
        .map(clean_title)
        .unwrap_or_else(|| "Search Strategy".to_string());

    let mut doc = format!("# {}\n", title);
    for (heading, key) in REPORT_SECTIONS {
        if let Some(value) = summary.get(key) {
            doc.push_str(&format!("\n## {}\n\n{}\n", heading, value.trim()));
        }
    }
    doc
}

#[derive(Serialize)]
struct CsvRow<'a> {
    stage: &'a str,
    value: &'a str,
}

/// Write `stage,value` rows in summary order
pub fn write_csv(summary: &RunSummary, path: &Path) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_error)?;

    for (stage, value) in summary.iter() {
        wtr.serialize(CsvRow { stage, value }).map_err(csv_error)?;
    }

    wtr.flush()?;
    Ok(())
}

fn csv_error(e: csv::Error) -> StrategyError {
    StrategyError::Io(std::io::Error::other(e))
}

/// Paths of the files written by [`export_all`]
#[derive(Debug, Clone)]
pub struct ExportedFiles {
    pub log: PathBuf,
    pub markdown: PathBuf,
    pub json: PathBuf,
    pub csv: PathBuf,
}

/// Write every artifact for `summary` into `dir`, named from its file title.
pub fn export_all(summary: &RunSummary, dir: &Path) -> Result<ExportedFiles> {
    std::fs::create_dir_all(dir)?;
    let stem = file_base_name(summary.get(keys::FILE_TITLE).unwrap_or_default());

    let files = ExportedFiles {
        log: dir.join(LOG_FILE_NAME),
        markdown: dir.join(format!("{}.md", stem)),
        json: dir.join(format!("{}.json", stem)),
        csv: dir.join(format!("{}.csv", stem)),
    };

    summary.write_log(&files.log)?;
    std::fs::write(&files.markdown, render_markdown(summary))?;
    std::fs::write(&files.json, serde_json::to_string_pretty(summary)?)?;
    write_csv(summary, &files.csv)?;

    info!(dir = %dir.display(), stem = %stem, "Exported search strategy");
    Ok(files)
}
