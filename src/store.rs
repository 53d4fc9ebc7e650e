use crate::markdown::NoteDocument;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const MAX_FILE_STEM_BYTES: usize = 200;

const ILLEGAL_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const SUFFIX_HEX_LEN: usize = 8;

type BookKey = (String, Option<String>);

#[derive(Debug)]
pub struct StoreWriteError {
    pub path: PathBuf,
    pub reason: String,
}

impl std::fmt::Display for StoreWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cannot update {}: {}", self.path.display(), self.reason)
    }
}

impl std::error::Error for StoreWriteError {}

impl StoreWriteError {
    fn new(path: &Path, reason: impl std::fmt::Display) -> Self {
        StoreWriteError {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

/// File name (without extension) for a book title: characters that are
/// illegal on common filesystems are dropped, whitespace is collapsed and
/// the result is cut to [`MAX_FILE_STEM_BYTES`] on a char boundary.
pub fn safe_file_stem(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !ILLEGAL_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c == ' ');

    if trimmed.is_empty() {
        return "Untitled".to_string();
    }
    truncate_on_char_boundary(trimmed, MAX_FILE_STEM_BYTES).to_string()
}

/// Like [`safe_file_stem`] but ends in a short hash of the full title, for
/// when the plain stem is already taken by another book.
pub fn disambiguated_file_stem(title: &str) -> String {
    let digest = hex::encode(Sha256::digest(title.as_bytes()));
    let stem = safe_file_stem(title);
    let prefix = truncate_on_char_boundary(&stem, MAX_FILE_STEM_BYTES - SUFFIX_HEX_LEN - 1);
    format!("{}-{}", prefix.trim_end(), &digest[..SUFFIX_HEX_LEN])
}

fn truncate_on_char_boundary(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Maps books to note paths inside the vault subdirectory.
///
/// Existing notes are found through their front matter, so a note the user
/// renamed is still updated in place. A sanitized name that already belongs
/// to another book, on disk or earlier in this run, gets a hash suffix.
#[derive(Debug)]
pub struct NoteLocator {
    dir: PathBuf,
    by_book: HashMap<BookKey, PathBuf>,
    owners: HashMap<PathBuf, BookKey>,
}

impl NoteLocator {
    pub fn scan(dir: &Path) -> Self {
        let mut locator = NoteLocator {
            dir: dir.to_path_buf(),
            by_book: HashMap::new(),
            owners: HashMap::new(),
        };

        let notes = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "md"));

        for entry in notes {
            let content = match fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(e) => {
                    tracing::debug!(path = %entry.path().display(), error = %e, "skipping unreadable note");
                    continue;
                }
            };
            let document = NoteDocument::parse(&content);
            let Some(title) = document.field_str("title") else {
                continue;
            };
            let key = (title.to_string(), document.field_str("author").map(String::from));
            if !locator.by_book.contains_key(&key) {
                locator.claim(key, entry.path().to_path_buf());
            }
        }

        tracing::debug!(dir = %dir.display(), notes = locator.by_book.len(), "indexed existing notes");
        locator
    }

    pub fn locate(&mut self, title: &str, author: Option<&str>) -> PathBuf {
        let key = (title.to_string(), author.map(String::from));
        if let Some(path) = self.by_book.get(&key) {
            return path.clone();
        }

        let plain = self.dir.join(format!("{}.md", safe_file_stem(title)));
        let path = match self.owners.get(&plain) {
            Some(owner) if *owner != key => {
                self.dir.join(format!("{}.md", disambiguated_file_stem(title)))
            }
            _ => plain,
        };

        self.claim(key, path.clone());
        path
    }

    fn claim(&mut self, key: BookKey, path: PathBuf) {
        self.owners.insert(path.clone(), key.clone());
        self.by_book.insert(key, path);
    }
}

/// Current note text, or `None` if the note does not exist yet.
pub fn read_note(path: &Path) -> Result<Option<String>, StoreWriteError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreWriteError::new(path, format!("failed to read existing note: {}", e))),
    }
}

/// Replace `path` with `content` by writing a sibling temp file and renaming
/// it over the target, so readers see either the old or the new note.
pub fn write_note_atomic(path: &Path, content: &str) -> Result<(), StoreWriteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreWriteError::new(parent, e))?;
    }

    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, content).map_err(|e| StoreWriteError::new(&tmp_path, e))?;

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreWriteError::new(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_file_stem_strips_illegal_chars() {
        assert_eq!(safe_file_stem("Book: A Study?"), "Book A Study");
        assert_eq!(safe_file_stem("a/b\\c*d\"e<f>g|h"), "abcdefgh");
        assert_eq!(safe_file_stem("  Spaced \t  Out  "), "Spaced Out");
    }

    #[test]
    fn test_safe_file_stem_empty_falls_back() {
        assert_eq!(safe_file_stem("???"), "Untitled");
        assert_eq!(safe_file_stem(".."), "Untitled");
    }

    #[test]
    fn test_safe_file_stem_truncates_on_char_boundary() {
        let title = "é".repeat(150);

        let stem = safe_file_stem(&title);

        assert!(stem.len() <= MAX_FILE_STEM_BYTES);
        assert_eq!(stem.len(), 200);
        assert!(title.starts_with(&stem));
    }

    #[test]
    fn test_disambiguated_stem_differs_for_shared_prefix() {
        let a = format!("{} volume one", "x".repeat(250));
        let b = format!("{} volume two", "x".repeat(250));

        assert_eq!(safe_file_stem(&a), safe_file_stem(&b));
        assert_ne!(disambiguated_file_stem(&a), disambiguated_file_stem(&b));
        assert!(disambiguated_file_stem(&a).len() <= MAX_FILE_STEM_BYTES);
    }

    #[test]
    fn test_locate_resolves_sanitization_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let mut locator = NoteLocator::scan(dir.path());

        let first = locator.locate("Book: A", None);
        let second = locator.locate("Book A", None);
        let first_again = locator.locate("Book: A", None);

        assert_eq!(first, dir.path().join("Book A.md"));
        assert_ne!(first, second);
        assert_eq!(first, first_again);
    }

    #[test]
    fn test_scan_finds_renamed_note_by_front_matter() {
        let dir = tempfile::tempdir().unwrap();
        let renamed = dir.path().join("my dune notes.md");
        fs::write(&renamed, "---\ntitle: Dune\nauthor: Frank Herbert\n---\n").unwrap();

        let mut locator = NoteLocator::scan(dir.path());

        assert_eq!(locator.locate("Dune", Some("Frank Herbert")), renamed);
        assert_eq!(locator.locate("Dune", None), dir.path().join("Dune.md"));
    }

    #[test]
    fn test_scan_collision_with_existing_note_of_other_book() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dune.md"), "---\ntitle: Dune\nauthor: Frank Herbert\n---\n").unwrap();

        let mut locator = NoteLocator::scan(dir.path());
        let path = locator.locate("Dune", Some("Someone Else"));

        assert_ne!(path, dir.path().join("Dune.md"));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("Dune-"));
    }

    #[test]
    fn test_scan_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();

        let mut locator = NoteLocator::scan(&dir.path().join("does-not-exist"));

        assert_eq!(
            locator.locate("Dune", None),
            dir.path().join("does-not-exist").join("Dune.md")
        );
    }

    #[test]
    fn test_read_note_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(read_note(&dir.path().join("nope.md")).unwrap(), None);
    }

    #[test]
    fn test_write_note_atomic_creates_dirs_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Kindle Highlights").join("Dune.md");

        write_note_atomic(&path, "first").unwrap();
        write_note_atomic(&path, "second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!path.with_extension("md.tmp").exists());
    }
}
