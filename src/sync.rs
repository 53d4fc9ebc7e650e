use crate::clippings::ClippingsParser;
use crate::config::Config;
use crate::csv_export::parse_export;
use crate::group::{filter_since, group_by_book};
use crate::markdown::plan_merge;
use crate::models::{BookGroup, Highlight, MalformedRecord, RawEntry};
use crate::normalize::normalize;
use crate::store::{read_note, write_note_atomic, NoteLocator, StoreWriteError};
use chrono::{Local, NaiveDateTime};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Idle,
    Loading,
    Parsing,
    Normalizing,
    Grouping,
    Merging,
    Done,
    Failed,
}

#[derive(Debug)]
pub enum SyncError {
    InputUnreadable { path: PathBuf, reason: String },
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::InputUnreadable { path, reason } => {
                write!(f, "Cannot load {}: {}", path.display(), reason)
            }
        }
    }
}

impl std::error::Error for SyncError {}

/// Run-wide counters. `parsed` counts raw entries that came out of the
/// parsers; the others count what was lost on the way to the books.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncStats {
    pub parsed: usize,
    pub malformed: usize,
    pub rejected: usize,
    pub dropped: usize,
    pub filtered: usize,
}

#[derive(Debug)]
pub enum BookStatus {
    Created,
    Updated,
    Unchanged,
    WouldCreate,
    WouldUpdate,
    Listed,
    Failed(StoreWriteError),
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookStatus::Created => write!(f, "created"),
            BookStatus::Updated => write!(f, "updated"),
            BookStatus::Unchanged => write!(f, "unchanged"),
            BookStatus::WouldCreate => write!(f, "would create"),
            BookStatus::WouldUpdate => write!(f, "would update"),
            BookStatus::Listed => write!(f, "listed"),
            BookStatus::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

#[derive(Debug)]
pub struct BookOutcome {
    pub title: String,
    pub author: Option<String>,
    pub path: Option<PathBuf>,
    pub status: BookStatus,
    pub highlights: usize,
    pub new_hashes: Vec<String>,
    pub duplicates: usize,
    /// Rendered sections in dry-run, one line per highlight in list mode.
    pub previews: Vec<String>,
}

impl BookOutcome {
    fn new(group: &BookGroup, path: Option<PathBuf>, status: BookStatus) -> Self {
        BookOutcome {
            title: group.title.clone(),
            author: group.author.clone(),
            path,
            status,
            highlights: group.highlights.len(),
            new_hashes: Vec::new(),
            duplicates: 0,
            previews: Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, BookStatus::Failed(_))
    }
}

#[derive(Debug)]
pub struct SyncReport {
    pub stage: SyncStage,
    pub dry_run: bool,
    pub stats: SyncStats,
    pub books: Vec<BookOutcome>,
}

impl SyncReport {
    pub fn has_failures(&self) -> bool {
        self.books.iter().any(BookOutcome::is_failed)
    }

    pub fn total_new(&self) -> usize {
        self.books.iter().map(|b| b.new_hashes.len()).sum()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for book in &self.books {
            let author = book.author.as_deref().unwrap_or("Unknown");
            writeln!(
                f,
                "{} ({}): {}, {} highlight(s), {} new, {} duplicate",
                book.title,
                author,
                book.status,
                book.highlights,
                book.new_hashes.len(),
                book.duplicates
            )?;
            if let Some(path) = &book.path {
                writeln!(f, "  -> {}", path.display())?;
            }
            for preview in &book.previews {
                for line in preview.lines() {
                    writeln!(f, "  | {}", line)?;
                }
            }
        }

        let s = &self.stats;
        writeln!(
            f,
            "Parsed {} entries: {} malformed, {} rejected, {} dropped, {} filtered",
            s.parsed, s.malformed, s.rejected, s.dropped, s.filtered
        )?;
        let failed = self.books.iter().filter(|b| b.is_failed()).count();
        if self.dry_run {
            write!(
                f,
                "Dry run: {} new highlight(s) across {} book(s) would be written; no files were changed",
                self.total_new(),
                self.books.len()
            )
        } else {
            write!(
                f,
                "Sync complete: {} new highlight(s) across {} book(s), {} failed",
                self.total_new(),
                self.books.len(),
                failed
            )
        }
    }
}

pub fn run(config: &Config) -> Result<SyncReport, SyncError> {
    run_at(config, Local::now().naive_local())
}

/// Run the whole pipeline with a fixed clock for the `updated` stamp.
pub fn run_at(config: &Config, now: NaiveDateTime) -> Result<SyncReport, SyncError> {
    let mut pipeline = Pipeline {
        config,
        now,
        stage: SyncStage::Idle,
        stats: SyncStats::default(),
    };

    match pipeline.execute() {
        Ok(books) => {
            pipeline.enter(SyncStage::Done);
            Ok(SyncReport {
                stage: pipeline.stage,
                dry_run: config.dry_run,
                stats: pipeline.stats,
                books,
            })
        }
        Err(e) => {
            pipeline.enter(SyncStage::Failed);
            tracing::error!(error = %e, "sync aborted");
            Err(e)
        }
    }
}

struct Pipeline<'a> {
    config: &'a Config,
    now: NaiveDateTime,
    stage: SyncStage,
    stats: SyncStats,
}

impl Pipeline<'_> {
    fn enter(&mut self, stage: SyncStage) {
        tracing::info!(from = ?self.stage, to = ?stage, "sync stage");
        self.stage = stage;
    }

    fn execute(&mut self) -> Result<Vec<BookOutcome>, SyncError> {
        self.enter(SyncStage::Loading);
        let clippings = self.config.clippings_path.as_deref().map(load_input).transpose()?;
        let csv = self.config.kindle_export_csv.as_deref().map(load_input).transpose()?;

        self.enter(SyncStage::Parsing);
        let mut raw = Vec::new();
        if let Some(content) = &clippings {
            let parser = ClippingsParser::new(content);
            self.collect_entries(parser.entries(), &mut raw);
        }
        if let (Some(content), Some(path)) = (&csv, &self.config.kindle_export_csv) {
            let rows = parse_export(content).map_err(|e| SyncError::InputUnreadable {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            self.collect_entries(rows, &mut raw);
        }
        self.stats.parsed = raw.len();

        self.enter(SyncStage::Normalizing);
        let mut highlights = self.normalize_all(raw);
        if let Some(since) = self.config.since {
            let before = highlights.len();
            highlights = filter_since(highlights, since);
            self.stats.filtered = before - highlights.len();
        }

        self.enter(SyncStage::Grouping);
        let groups = group_by_book(highlights);
        tracing::info!(books = groups.len(), "grouped highlights");

        self.enter(SyncStage::Merging);
        if self.config.list_only {
            return Ok(groups.iter().map(list_book).collect());
        }

        let mut locator = NoteLocator::scan(&self.config.notes_dir());
        Ok(groups
            .iter()
            .map(|group| self.merge_book(group, &mut locator))
            .collect())
    }

    fn collect_entries(
        &mut self,
        items: impl IntoIterator<Item = Result<RawEntry, MalformedRecord>>,
        raw: &mut Vec<RawEntry>,
    ) {
        for item in items {
            match item {
                Ok(entry) => raw.push(entry),
                Err(_) => self.stats.malformed += 1,
            }
        }
    }

    fn normalize_all(&mut self, raw: Vec<RawEntry>) -> Vec<Highlight> {
        let mut highlights = Vec::with_capacity(raw.len());
        for entry in raw {
            match normalize(entry) {
                Ok(Some(highlight)) => highlights.push(highlight),
                Ok(None) => self.stats.dropped += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "rejecting entry");
                    self.stats.rejected += 1;
                }
            }
        }
        highlights
    }

    fn merge_book(&self, group: &BookGroup, locator: &mut NoteLocator) -> BookOutcome {
        let path = locator.locate(&group.title, group.author.as_deref());
        let failed = |e: StoreWriteError| {
            tracing::warn!(title = %group.title, error = %e, "book merge failed");
            BookOutcome::new(group, Some(path.clone()), BookStatus::Failed(e))
        };

        let existing = match read_note(&path) {
            Ok(existing) => existing,
            Err(e) => return failed(e),
        };

        let plan = match plan_merge(
            group,
            existing.as_deref(),
            &self.config.highlight_heading_template,
            self.now,
        ) {
            Ok(plan) => plan,
            Err(e) => {
                return failed(StoreWriteError {
                    path: path.clone(),
                    reason: e.to_string(),
                })
            }
        };

        if let Some(e) = &plan.front_matter_error {
            tracing::warn!(path = %path.display(), error = %e, "recovering highlight ids from section markers");
        }

        let status = match &plan.content {
            None => BookStatus::Unchanged,
            Some(_) if self.config.dry_run && plan.existed => BookStatus::WouldUpdate,
            Some(_) if self.config.dry_run => BookStatus::WouldCreate,
            Some(content) => match write_note_atomic(&path, content) {
                Ok(()) if plan.existed => BookStatus::Updated,
                Ok(()) => BookStatus::Created,
                Err(e) => return failed(e),
            },
        };

        tracing::info!(
            title = %group.title,
            new = plan.new_highlights.len(),
            duplicates = plan.duplicates,
            status = %status,
            "merged book"
        );

        let mut outcome = BookOutcome::new(group, Some(path), status);
        outcome.new_hashes = plan.new_hashes().into_iter().map(String::from).collect();
        outcome.duplicates = plan.duplicates;
        if self.config.dry_run {
            outcome.previews = plan.sections;
        }
        outcome
    }
}

fn list_book(group: &BookGroup) -> BookOutcome {
    let mut outcome = BookOutcome::new(group, None, BookStatus::Listed);
    outcome.previews = group
        .highlights
        .iter()
        .map(|h| {
            let body = if h.text.is_empty() {
                h.note.as_deref().unwrap_or_default()
            } else {
                h.text.as_str()
            };
            format!("[{}] {}", h.location, body)
        })
        .collect();
    outcome
}

fn load_input(path: &Path) -> Result<String, SyncError> {
    let unreadable = |reason: String| SyncError::InputUnreadable {
        path: path.to_path_buf(),
        reason,
    };
    let bytes = fs::read(path).map_err(|e| unreadable(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| unreadable(format!("not valid UTF-8: {}", e)))
}
