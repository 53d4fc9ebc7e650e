use chrono::NaiveDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Highlight,
    Note,
    Bookmark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntrySource {
    Clippings,
    Csv,
}

impl std::fmt::Display for EntrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntrySource::Clippings => write!(f, "clippings"),
            EntrySource::Csv => write!(f, "csv"),
        }
    }
}

/// A parsed record before normalization.
///
/// `header` is the title field as it appeared in the source. For clippings
/// this is the combined "Title (Author)" line; CSV rows carry the author in
/// its own column and set `author`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub header: String,
    pub author: Option<String>,
    pub location: String,
    pub date: Option<String>,
    pub text: String,
    pub note: Option<String>,
    pub kind: EntryKind,
    pub source: EntrySource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Highlight {
    pub title: String,
    pub author: Option<String>,
    pub location: String,
    pub text: String,
    pub note: Option<String>,
    pub added: Option<NaiveDateTime>,
    pub source: EntrySource,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BookGroup {
    pub title: String,
    pub author: Option<String>,
    pub highlights: Vec<Highlight>,
}

/// A block or row that could not be turned into a [`RawEntry`].
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRecord {
    pub source: EntrySource,
    /// 1-based block number for clippings, 1-based record number for CSV.
    pub position: usize,
    pub reason: String,
}

impl std::fmt::Display for MalformedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Malformed {} record #{}: {}",
            self.source, self.position, self.reason
        )
    }
}

impl std::error::Error for MalformedRecord {}
