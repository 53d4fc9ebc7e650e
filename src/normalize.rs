use crate::models::{EntryKind, EntrySource, Highlight, RawEntry};
use chrono::{NaiveDate, NaiveDateTime};
use sha2::{Digest, Sha256};

/// Joins hash components; the "symbol for unit separator" never shows up in
/// book text.
const HASH_DELIMITER: &str = "\u{241f}";

const DATETIME_FORMATS: &[&str] = &[
    "%A, %B %d, %Y %I:%M:%S %p",
    "%A, %d %B %Y %H:%M:%S",
    "%B %d, %Y %I:%M:%S %p",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

#[derive(Debug, PartialEq)]
pub enum ValidationError {
    EmptyTitle { source: EntrySource, location: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyTitle { source, location } => {
                write!(f, "Entry from {} at location '{}' has no title", source, location)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Turn a raw entry into a highlight.
///
/// Bookmarks and entries with neither text nor note give `Ok(None)`. A note
/// that was never paired with a highlight keeps its body in `note` and has
/// empty `text`.
pub fn normalize(raw: RawEntry) -> Result<Option<Highlight>, ValidationError> {
    if raw.kind == EntryKind::Bookmark {
        return Ok(None);
    }

    let (title, author) = match raw.author.as_deref() {
        Some(author) => (collapse_whitespace(&raw.header), non_empty(author)),
        None => split_title_author(&raw.header),
    };
    if title.is_empty() {
        return Err(ValidationError::EmptyTitle {
            source: raw.source,
            location: raw.location,
        });
    }

    let (text, note) = match raw.kind {
        EntryKind::Note => (String::new(), non_empty(&raw.text)),
        _ => (
            collapse_whitespace(&raw.text),
            raw.note.as_deref().and_then(non_empty),
        ),
    };
    if text.is_empty() && note.is_none() {
        return Ok(None);
    }

    let location = raw.location.trim().to_string();
    let content = if text.is_empty() {
        note.as_deref().unwrap_or_default()
    } else {
        text.as_str()
    };
    let hash = highlight_hash(&title, author.as_deref(), &location, content);

    let added = raw.date.as_deref().and_then(|date| {
        let parsed = parse_entry_date(date);
        if parsed.is_none() {
            tracing::debug!(date, "unrecognised entry date");
        }
        parsed
    });

    Ok(Some(Highlight {
        title,
        author,
        location,
        text,
        note,
        added,
        source: raw.source,
        hash,
    }))
}

/// Split "Title (Author)" on its trailing parenthesised segment. Nested
/// parentheses inside the author are balanced, so "Title (Smith (ed.))"
/// yields author "Smith (ed.)".
pub fn split_title_author(header: &str) -> (String, Option<String>) {
    let header = header.trim();
    let whole = || (collapse_whitespace(header), None);

    if !header.ends_with(')') {
        return whole();
    }

    let mut depth = 0usize;
    for (idx, ch) in header.char_indices().rev() {
        match ch {
            ')' => depth += 1,
            '(' => {
                depth -= 1;
                if depth == 0 {
                    let title = collapse_whitespace(&header[..idx]);
                    if title.is_empty() {
                        return whole();
                    }
                    let author = non_empty(&header[idx + 1..header.len() - 1]);
                    return (title, author);
                }
            }
            _ => {}
        }
    }

    whole()
}

pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn non_empty(value: &str) -> Option<String> {
    let collapsed = collapse_whitespace(value);
    (!collapsed.is_empty()).then_some(collapsed)
}

/// SHA-256 over the lower-cased, whitespace-collapsed identity fields.
pub fn highlight_hash(title: &str, author: Option<&str>, location: &str, text: &str) -> String {
    let material = [title, author.unwrap_or_default(), location, text]
        .iter()
        .map(|part| collapse_whitespace(part).to_lowercase())
        .collect::<Vec<_>>()
        .join(HASH_DELIMITER);

    hex::encode(Sha256::digest(material.as_bytes()))
}

fn parse_entry_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
