use crate::models::{BookGroup, Highlight};
use chrono::NaiveDateTime;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;

pub const DEFAULT_HEADING_TEMPLATE: &str = "Location {location}";

const MARKER_PREFIX: &str = "<!-- kindle-highlight-id:";
const MARKER_SUFFIX: &str = "-->";
const MANAGED_KEYS: &[&str] = &["updated", "highlight_ids"];

#[derive(Debug, Clone, PartialEq)]
pub enum FrontMatterCorrupt {
    Unterminated,
    InvalidYaml(String),
    NotAMapping,
}

impl std::fmt::Display for FrontMatterCorrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrontMatterCorrupt::Unterminated => write!(f, "Front matter has no closing delimiter"),
            FrontMatterCorrupt::InvalidYaml(e) => write!(f, "Front matter is not valid YAML: {}", e),
            FrontMatterCorrupt::NotAMapping => write!(f, "Front matter is not a key/value mapping"),
        }
    }
}

impl std::error::Error for FrontMatterCorrupt {}

#[derive(Debug)]
pub enum RenderError {
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::Yaml(e) => write!(f, "Failed to serialise front matter: {}", e),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Yaml(e) => Some(e),
        }
    }
}

impl From<serde_yaml::Error> for RenderError {
    fn from(e: serde_yaml::Error) -> Self {
        RenderError::Yaml(e)
    }
}

#[derive(Debug)]
pub enum FrontMatter<'a> {
    Missing,
    Parsed { raw: &'a str, fields: Mapping },
    Corrupt(FrontMatterCorrupt),
}

/// An existing note split into its front matter and the text after it.
#[derive(Debug)]
pub struct NoteDocument<'a> {
    pub front_matter: FrontMatter<'a>,
    pub body: &'a str,
}

impl<'a> NoteDocument<'a> {
    pub fn parse(content: &'a str) -> Self {
        let content = content.trim_start_matches('\u{feff}');
        let mut lines = content.split_inclusive('\n');

        match lines.next() {
            Some(first) if first.trim_end() == "---" => {}
            _ => {
                return NoteDocument {
                    front_matter: FrontMatter::Missing,
                    body: content,
                }
            }
        }

        let yaml_start = content.find('\n').map_or(content.len(), |i| i + 1);
        let mut offset = yaml_start;
        for line in lines {
            let trimmed = line.trim_end();
            if trimmed == "---" || trimmed == "..." {
                let raw = &content[yaml_start..offset];
                let body = &content[offset + line.len()..];
                return NoteDocument {
                    front_matter: parse_fields(raw),
                    body,
                };
            }
            offset += line.len();
        }

        NoteDocument {
            front_matter: FrontMatter::Corrupt(FrontMatterCorrupt::Unterminated),
            body: content,
        }
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        match &self.front_matter {
            FrontMatter::Parsed { fields, .. } => fields.get(key).and_then(Value::as_str),
            _ => None,
        }
    }

    /// Stored hashes in file order: front matter `highlight_ids` first, then
    /// any hash markers in the body the front matter does not list.
    pub fn stored_hashes(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();

        if let FrontMatter::Parsed { fields, .. } = &self.front_matter {
            if let Some(Value::Sequence(values)) = fields.get("highlight_ids") {
                for value in values {
                    let id = match value {
                        Value::String(s) => s.trim().to_string(),
                        Value::Number(n) => n.to_string(),
                        _ => continue,
                    };
                    if !id.is_empty() && seen.insert(id.clone()) {
                        ids.push(id);
                    }
                }
            }
        }

        for id in scan_markers(self.body) {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }

        ids
    }
}

fn parse_fields(raw: &str) -> FrontMatter<'_> {
    match serde_yaml::from_str::<Value>(raw) {
        Ok(Value::Mapping(fields)) => FrontMatter::Parsed { raw, fields },
        Ok(Value::Null) => FrontMatter::Parsed {
            raw,
            fields: Mapping::new(),
        },
        Ok(_) => FrontMatter::Corrupt(FrontMatterCorrupt::NotAMapping),
        Err(e) => FrontMatter::Corrupt(FrontMatterCorrupt::InvalidYaml(e.to_string())),
    }
}

fn scan_markers(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            line.trim()
                .strip_prefix(MARKER_PREFIX)?
                .strip_suffix(MARKER_SUFFIX)
                .map(|id| id.trim().to_string())
        })
        .filter(|id| !id.is_empty())
        .collect()
}

/// Every highlight hash recorded in a note, from its front matter and from
/// the per-section markers.
pub fn recover_stored_hashes(content: &str) -> HashSet<String> {
    NoteDocument::parse(content).stored_hashes().into_iter().collect()
}

/// Expand `{title}`, `{author}` and `{location}` in a single pass, so text
/// substituted in is never expanded again.
pub fn render_heading(template: &str, highlight: &Highlight) -> String {
    let placeholders = [
        ("{title}", highlight.title.as_str()),
        ("{author}", highlight.author.as_deref().unwrap_or("Unknown")),
        ("{location}", highlight.location.as_str()),
    ];

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match placeholders.iter().find(|(name, _)| tail.starts_with(*name)) {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn render_section(highlight: &Highlight, template: &str) -> String {
    let mut section = format!("## {}\n\n", render_heading(template, highlight));

    if !highlight.text.is_empty() {
        section.push_str(&format!("> {}\n\n", highlight.text));
    }
    if let Some(note) = &highlight.note {
        section.push_str(&format!("**Note:** {}\n\n", note));
    }
    section.push_str(&format!("{} {} {}\n", MARKER_PREFIX, highlight.hash, MARKER_SUFFIX));

    section
}

/// Outcome of diffing one book against its note. `content` is the full new
/// file text and is only set when there is something to add.
#[derive(Debug)]
pub struct MergePlan {
    pub new_highlights: Vec<Highlight>,
    pub sections: Vec<String>,
    pub duplicates: usize,
    pub existed: bool,
    pub front_matter_error: Option<FrontMatterCorrupt>,
    pub content: Option<String>,
}

impl MergePlan {
    pub fn new_hashes(&self) -> Vec<&str> {
        self.new_highlights.iter().map(|h| h.hash.as_str()).collect()
    }
}

/// Diff a book against its existing note (if any) and build the merged
/// file. Existing text is never rewritten apart from the managed front
/// matter keys of a well-formed block; new sections go after it in input
/// order.
pub fn plan_merge(
    group: &BookGroup,
    existing: Option<&str>,
    template: &str,
    now: NaiveDateTime,
) -> Result<MergePlan, RenderError> {
    let document = existing.map(NoteDocument::parse);
    let stored = document
        .as_ref()
        .map(NoteDocument::stored_hashes)
        .unwrap_or_default();

    let mut seen: HashSet<&str> = stored.iter().map(String::as_str).collect();
    let mut new_highlights = Vec::new();
    let mut duplicates = 0;
    for highlight in &group.highlights {
        if seen.insert(highlight.hash.as_str()) {
            new_highlights.push(highlight.clone());
        } else {
            duplicates += 1;
        }
    }

    let sections: Vec<String> = new_highlights
        .iter()
        .map(|h| render_section(h, template))
        .collect();

    let front_matter_error = match document.as_ref().map(|d| &d.front_matter) {
        Some(FrontMatter::Corrupt(e)) => Some(e.clone()),
        _ => None,
    };

    let content = if sections.is_empty() {
        None
    } else {
        let mut ids = stored.clone();
        ids.extend(new_highlights.iter().map(|h| h.hash.clone()));
        let updated = now.format("%Y-%m-%dT%H:%M:%S").to_string();

        let mut out = match &document {
            // A block that cannot be parsed is left exactly as found; the
            // section markers still identify what the note holds.
            Some(NoteDocument {
                front_matter: FrontMatter::Corrupt(_),
                ..
            }) => existing.unwrap_or_default().to_string(),
            Some(doc) => {
                let mut out = render_front_matter(&doc.front_matter, group, &updated, &ids)?;
                out.push_str(doc.body);
                out
            }
            None => {
                let mut out = render_front_matter(&FrontMatter::Missing, group, &updated, &ids)?;
                out.push_str(&format!("# {}\n", group.title));
                if let Some(author) = &group.author {
                    out.push_str(&format!("\n*{}*\n", author));
                }
                out
            }
        };

        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        for section in &sections {
            out.push('\n');
            out.push_str(section);
        }
        Some(out)
    };

    Ok(MergePlan {
        new_highlights,
        sections,
        duplicates,
        existed: existing.is_some(),
        front_matter_error,
        content,
    })
}

/// Front matter block for a rewrite. Lines of a parsed block are carried
/// over untouched except for the managed keys, which are re-emitted at the
/// end. `title` and `author` are only added when the block lacks them.
fn render_front_matter(
    front_matter: &FrontMatter<'_>,
    group: &BookGroup,
    updated: &str,
    ids: &[String],
) -> Result<String, RenderError> {
    let mut out = String::from("---\n");
    let mut managed = Mapping::new();

    let has_key = |key: &str| match front_matter {
        FrontMatter::Parsed { fields, .. } => fields.contains_key(key),
        _ => false,
    };

    if let FrontMatter::Parsed { raw, .. } = front_matter {
        let kept = strip_managed_keys(raw);
        out.push_str(&kept);
        if !kept.is_empty() && !kept.ends_with('\n') {
            out.push('\n');
        }
    }

    if !has_key("title") {
        managed.insert("title".into(), group.title.clone().into());
    }
    if !has_key("author") {
        let author = match &group.author {
            Some(author) => Value::String(author.clone()),
            None => Value::Null,
        };
        managed.insert("author".into(), author);
    }
    managed.insert("updated".into(), updated.into());
    managed.insert(
        "highlight_ids".into(),
        Value::Sequence(ids.iter().cloned().map(Value::String).collect()),
    );

    out.push_str(&serde_yaml::to_string(&managed)?);
    out.push_str("---\n");
    Ok(out)
}

fn strip_managed_keys(raw: &str) -> String {
    let mut kept = String::new();
    let mut skipping = false;

    for line in raw.split_inclusive('\n') {
        if let Some(key) = top_level_key(line) {
            skipping = MANAGED_KEYS.contains(&key);
        }
        if !skipping {
            kept.push_str(line);
        }
    }

    kept
}

fn top_level_key(line: &str) -> Option<&str> {
    let first = line.chars().next()?;
    if first.is_whitespace() || first == '-' || first == '#' {
        return None;
    }
    let (key, _) = line.split_once(':')?;
    Some(key.trim().trim_matches(|c| c == '"' || c == '\''))
}
