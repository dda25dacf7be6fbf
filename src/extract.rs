//! Field extraction from raw completion text.
//!
//! Completions carry no format guarantee, so every parser here either returns a
//! well-formed value or a classified error. Model output is never evaluated.

use crate::error::{OptionExt, Result, StrategyError};
use crate::personas::PersonaKey;
use regex::Regex;
use std::fmt;

/// Question and rationale pulled from a rephrasing candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefinedQuestion {
    pub question: String,
    pub rationale: String,
}

fn compile(pattern: &str, stage: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| StrategyError::extraction(stage, e.to_string()))
}

/// Extract the `New Question:` line and the `Rationale:` text.
///
/// The question runs to the end of its line; the rationale runs to the end of
/// the text. Both must be present and non-empty.
pub fn extract_new_question_and_rationale(text: &str, stage: &str) -> Result<RefinedQuestion> {
    let question_re = compile(r"New Question:[ \t]*\n?[ \t]*([^\n]*\S)", stage)?;
    let rationale_re = compile(r"(?s)Rationale:\s*(.*\S)", stage)?;

    let question = question_re
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_extraction(stage, "no \"New Question:\" line in completion")?;

    let rationale = rationale_re
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|r| !r.is_empty())
        .ok_or_extraction(stage, "no \"Rationale:\" text in completion")?;

    Ok(RefinedQuestion { question, rationale })
}

/// Clinical question framework chosen for the population statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClinicalFormat {
    Pico,
    Peco,
    Spider,
}

impl ClinicalFormat {
    /// Scan order; the first framework named in the answer wins
    const PRIORITY: [ClinicalFormat; 3] = [ClinicalFormat::Pico, ClinicalFormat::Peco, ClinicalFormat::Spider];

    /// Persona used to write the population statement
    pub fn persona_key(&self) -> PersonaKey {
        match self {
            ClinicalFormat::Pico => PersonaKey::PicoDeveloper,
            ClinicalFormat::Peco => PersonaKey::PecoDeveloper,
            ClinicalFormat::Spider => PersonaKey::SpiderDeveloper,
        }
    }

    fn needle(&self) -> &'static str {
        match self {
            ClinicalFormat::Pico => "pico",
            ClinicalFormat::Peco => "peco",
            ClinicalFormat::Spider => "spider",
        }
    }
}

impl fmt::Display for ClinicalFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClinicalFormat::Pico => "PICO",
            ClinicalFormat::Peco => "PECO",
            ClinicalFormat::Spider => "SPIDER",
        };
        f.write_str(name)
    }
}

/// Classify the framework answer by case-insensitive substring, PICO first.
pub fn classify(text: &str) -> Result<ClinicalFormat> {
    let lower = text.to_lowercase();
    ClinicalFormat::PRIORITY
        .into_iter()
        .find(|format| lower.contains(format.needle()))
        .ok_or_else(|| StrategyError::Classification(preview(text, 80)))
}

/// Strip whitespace and surrounding quote characters from a title answer
pub fn clean_title(text: &str) -> String {
    text.trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’'))
        .trim()
        .to_string()
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn list_error(text: &str, reason: &str) -> StrategyError {
    StrategyError::DatabaseListParse(format!("{}: {:?}", reason, preview(text, 120)))
}

fn is_quote(c: char) -> bool {
    c == '\'' || c == '"'
}

fn is_conjunction(token: &str) -> bool {
    token.eq_ignore_ascii_case("and")
}

/// Parse the list-reformatting answer into distinct database names.
///
/// Accepted shapes:
/// - `('PubMed', 'Embase')` or `["PubMed", "Embase"]`: quoted, comma separated
/// - `PubMed', 'Embase')`: the continuation of a prompt that ended in `('`
/// - `PubMed, Embase and CINAHL`: a bare list of at least two short,
///   capitalized names; sentence-like items reject the whole answer
///
/// A stray `and` between items is dropped. Anything else is rejected.
pub fn parse_database_list(text: &str) -> Result<Vec<String>> {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("List:") {
        body = rest.trim_start();
    }
    if body.is_empty() {
        return Err(list_error(text, "empty list answer"));
    }

    let first = body.chars().next().unwrap_or_default();
    let last = body.chars().last().unwrap_or_default();

    let names = if first == '(' || first == '[' {
        parse_bracketed(body, text)?
    } else if (last == ')' || last == ']') && body.contains(is_quote) {
        let opener = if last == ')' { '(' } else { '[' };
        let seeded = if is_quote(first) {
            format!("{}{}", opener, body)
        } else {
            format!("{}'{}", opener, body)
        };
        parse_bracketed(&seeded, text)?
    } else {
        parse_bare(body, text)?
    };

    let mut distinct: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !distinct.contains(&name) {
            distinct.push(name);
        }
    }

    if distinct.is_empty() {
        return Err(list_error(text, "list contains no database names"));
    }
    Ok(distinct)
}

fn parse_bracketed(body: &str, original: &str) -> Result<Vec<String>> {
    let mut chars = body.chars();
    let open = chars.next().unwrap_or_default();
    let close = if open == '(' { ')' } else { ']' };
    if !body.ends_with(close) || body.chars().count() < 2 {
        return Err(list_error(original, "unbalanced list brackets"));
    }
    let inner = &body[open.len_utf8()..body.len() - close.len_utf8()];

    let mut names = Vec::new();
    let mut iter = inner.chars().peekable();
    let mut expect_separator = false;

    while let Some(&c) = iter.peek() {
        if c.is_whitespace() {
            iter.next();
        } else if c == ',' {
            iter.next();
            expect_separator = false;
        } else if expect_separator {
            return Err(list_error(original, "missing comma between list items"));
        } else if is_quote(c) {
            iter.next();
            let mut token = String::new();
            let mut closed = false;
            for ch in iter.by_ref() {
                if ch == c {
                    closed = true;
                    break;
                }
                token.push(ch);
            }
            if !closed {
                return Err(list_error(original, "unterminated quoted item"));
            }
            let token = token.trim();
            if !token.is_empty() && !is_conjunction(token) {
                names.push(token.to_string());
            }
            expect_separator = true;
        } else {
            let mut word = String::new();
            while let Some(&ch) = iter.peek() {
                if ch.is_whitespace() || ch == ',' || is_quote(ch) {
                    break;
                }
                word.push(ch);
                iter.next();
            }
            if !is_conjunction(&word) {
                return Err(list_error(original, "unquoted list item"));
            }
        }
    }

    Ok(names)
}

/// Lowercase words allowed inside a multi-word database name
const NAME_CONNECTORS: &[&str] = &["of", "and", "to", "for", "the", "in", "on", "with", "at", "de", "&"];

/// Words that open a sentence rather than a database name
const SENTENCE_OPENERS: &[&str] = &[
    "i", "sure", "sorry", "yes", "no", "ok", "okay", "certainly", "here", "please",
    "unfortunately", "note", "however", "these", "this", "that", "it", "we", "you",
];

/// Longest bare item accepted, in words
const MAX_NAME_WORDS: usize = 8;

/// Words in a final `X and Y` piece at or below which it is read as two names
const MAX_SPLIT_PART_WORDS: usize = 3;

fn split_on_and(piece: &str) -> Vec<&str> {
    piece
        .split(" and ")
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

/// Bare item check: a few capitalized words, lowercase only for connectors.
fn is_name_like(item: &str) -> bool {
    let words: Vec<&str> = item.split_whitespace().collect();
    let Some(first) = words.first() else {
        return false;
    };
    if words.len() > MAX_NAME_WORDS || SENTENCE_OPENERS.contains(&first.to_lowercase().as_str()) {
        return false;
    }
    if item.ends_with(|c| matches!(c, '.' | '!' | '?')) {
        return false;
    }

    let starts_upper = |word: &str| {
        word.chars()
            .next()
            .is_some_and(|c| c.is_uppercase() || c.is_ascii_digit())
    };
    starts_upper(first)
        && words.iter().all(|word| starts_upper(word) || NAME_CONNECTORS.contains(word))
        && item
            .chars()
            .all(|c| c.is_alphanumeric() || c.is_whitespace() || "-&./()+:".contains(c))
}

fn parse_bare(body: &str, original: &str) -> Result<Vec<String>> {
    let body = body.strip_suffix('.').unwrap_or(body);
    let separators = compile(r"\s*[,;\n]\s*", "Database List Parse")?;
    let pieces: Vec<&str> = separators
        .split(body)
        .map(|piece| piece.trim().trim_matches(is_quote).trim())
        .filter(|piece| !piece.is_empty())
        .collect();

    // `and` separates names in `A and B` and in a trailing `..., A and B`, but a
    // longer final piece is a single name such as "Nursing and Allied Health".
    let last = pieces.len().saturating_sub(1);
    let mut items: Vec<String> = Vec::new();
    for (idx, piece) in pieces.iter().enumerate() {
        let piece = piece
            .strip_prefix("and ")
            .or_else(|| piece.strip_prefix("And "))
            .unwrap_or(piece)
            .trim();
        let parts = split_on_and(piece);
        let split = pieces.len() == 1
            || (idx == last && parts.iter().all(|p| p.split_whitespace().count() <= MAX_SPLIT_PART_WORDS));
        if split && parts.len() > 1 {
            items.extend(parts.iter().map(|p| p.trim_matches(is_quote).trim().to_string()));
        } else if !is_conjunction(piece) {
            items.push(piece.to_string());
        }
    }

    if items.len() < 2 {
        return Err(list_error(original, "answer is not a list"));
    }
    if !items.iter().all(|item| is_name_like(item)) {
        return Err(list_error(original, "list item is not a database name"));
    }
    Ok(items)
}
