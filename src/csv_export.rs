use crate::models::{EntryKind, EntrySource, MalformedRecord, RawEntry};
use csv::{ReaderBuilder, StringRecord};

const TITLE_COLUMNS: &[&str] = &["title", "book title", "book"];
const AUTHOR_COLUMNS: &[&str] = &["author", "authors", "book author", "by"];
const LOCATION_COLUMNS: &[&str] = &["location", "annotation location", "loc", "position", "page"];
const TEXT_COLUMNS: &[&str] = &["highlight", "text", "annotation", "highlight text", "quote"];
const NOTE_COLUMNS: &[&str] = &["note", "notes", "annotation note", "comment"];
const DATE_COLUMNS: &[&str] = &["date", "date added", "added", "created", "created at", "highlighted at"];

#[derive(Debug, PartialEq)]
pub enum CsvError {
    MissingHeader,
}

impl std::fmt::Display for CsvError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CsvError::MissingHeader => {
                write!(f, "No header row naming both a title and a highlight column")
            }
        }
    }
}

impl std::error::Error for CsvError {}

#[derive(Debug)]
struct Columns {
    title: usize,
    author: Option<usize>,
    location: Option<usize>,
    text: usize,
    note: Option<usize>,
    date: Option<usize>,
}

impl Columns {
    fn from_header(record: &StringRecord) -> Option<Self> {
        let names: Vec<String> = record.iter().map(normalize_column_name).collect();
        let find = |synonyms: &[&str]| {
            synonyms
                .iter()
                .find_map(|s| names.iter().position(|name| name.as_str() == *s))
        };

        Some(Columns {
            title: find(TITLE_COLUMNS)?,
            author: find(AUTHOR_COLUMNS),
            location: find(LOCATION_COLUMNS),
            text: find(TEXT_COLUMNS)?,
            note: find(NOTE_COLUMNS),
            date: find(DATE_COLUMNS),
        })
    }
}

fn normalize_column_name(name: &str) -> String {
    name.trim_start_matches('\u{feff}')
        .replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Parse a Kindle export CSV into raw entries, one per data row.
///
/// Rows before the header are ignored; the header is the first record that
/// names both a title and a highlight-text column. Rows lacking a title or
/// text come back as `Err` so the caller can count them.
pub fn parse_export(content: &str) -> Result<Vec<Result<RawEntry, MalformedRecord>>, CsvError> {
    let content = content.trim_start_matches('\u{feff}');
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut columns: Option<Columns> = None;
    let mut entries = Vec::new();

    for (idx, record) in reader.records().enumerate() {
        let position = idx + 1;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                if columns.is_some() {
                    entries.push(Err(malformed(position, &e.to_string())));
                }
                continue;
            }
        };

        if columns.is_none() {
            columns = Columns::from_header(&record);
            continue;
        }
        if let Some(cols) = &columns {
            let entry = row_to_entry(cols, &record, position);
            if let Err(e) = &entry {
                tracing::warn!(position, reason = %e.reason, "skipping csv row");
            }
            entries.push(entry);
        }
    }

    if columns.is_none() {
        return Err(CsvError::MissingHeader);
    }

    Ok(entries)
}

fn row_to_entry(
    cols: &Columns,
    record: &StringRecord,
    position: usize,
) -> Result<RawEntry, MalformedRecord> {
    let field = |idx: Option<usize>| {
        idx.and_then(|i| record.get(i))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };

    let header = field(Some(cols.title)).ok_or_else(|| malformed(position, "missing title"))?;
    let text =
        field(Some(cols.text)).ok_or_else(|| malformed(position, "missing highlight text"))?;

    Ok(RawEntry {
        header,
        author: field(cols.author),
        location: field(cols.location).unwrap_or_default(),
        date: field(cols.date),
        text,
        note: field(cols.note),
        kind: EntryKind::Highlight,
        source: EntrySource::Csv,
    })
}

fn malformed(position: usize, reason: &str) -> MalformedRecord {
    MalformedRecord {
        source: EntrySource::Csv,
        position,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CSV: &str = "\u{feff}Book Title, Authors ,Location,Highlight,Note
Dune,Frank Herbert,410-411,\"Fear is the mind-killer.\",
\"Gödel, Escher, Bach\",Douglas Hofstadter,12,\"A \"\"strange loop\"\", again\",see ch. 20
,Nobody,5,orphan row,
Dune,Frank Herbert,500,,
";

    #[test]
    fn test_parse_sample() {
        let entries = parse_export(SAMPLE_CSV).unwrap();

        assert_eq!(entries.len(), 4);

        let dune = entries[0].as_ref().unwrap();
        assert_eq!(dune.header, "Dune");
        assert_eq!(dune.author, Some("Frank Herbert".to_string()));
        assert_eq!(dune.location, "410-411");
        assert_eq!(dune.text, "Fear is the mind-killer.");
        assert_eq!(dune.note, None);
        assert_eq!(dune.kind, EntryKind::Highlight);
        assert_eq!(dune.source, EntrySource::Csv);

        let geb = entries[1].as_ref().unwrap();
        assert_eq!(geb.header, "Gödel, Escher, Bach");
        assert_eq!(geb.text, "A \"strange loop\", again");
        assert_eq!(geb.note, Some("see ch. 20".to_string()));
    }

    #[test]
    fn test_rows_missing_required_fields_are_errors() {
        let entries = parse_export(SAMPLE_CSV).unwrap();

        assert!(matches!(&entries[2], Err(e) if e.reason == "missing title" && e.position == 4));
        assert!(matches!(&entries[3], Err(e) if e.reason == "missing highlight text"));
    }

    #[test]
    fn test_missing_note_column_yields_none() {
        let csv = "title,author,location,text\nDune,Frank Herbert,1,Passage\n";

        let entries = parse_export(csv).unwrap();

        let entry = entries[0].as_ref().unwrap();
        assert_eq!(entry.note, None);
        assert_eq!(entry.date, None);
    }

    #[test]
    fn test_header_after_preamble_rows() {
        let csv = "Exported highlights\n\nbook_title,AUTHOR,annotation_location,annotation,Date Added\nDune,Frank Herbert,7,Passage,2024-03-01\n";

        let entries = parse_export(csv).unwrap();

        assert_eq!(entries.len(), 1);
        let entry = entries[0].as_ref().unwrap();
        assert_eq!(entry.location, "7");
        assert_eq!(entry.date, Some("2024-03-01".to_string()));
    }

    #[test]
    fn test_short_row_treats_missing_cells_as_absent() {
        let csv = "title,author,location,highlight,note\nDune,Frank Herbert,9,Passage\n";

        let entries = parse_export(csv).unwrap();

        assert_eq!(entries[0].as_ref().unwrap().note, None);
    }

    #[test]
    fn test_missing_header_is_error() {
        let result = parse_export("a,b,c\n1,2,3\n");

        assert_eq!(result, Err(CsvError::MissingHeader));
    }
}
