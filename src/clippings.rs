use crate::models::{EntryKind, EntrySource, MalformedRecord, RawEntry};
use std::str::Lines;

pub const SEPARATOR: &str = "==========";

type Item = Result<RawEntry, MalformedRecord>;

/// Parser over the text of a `My Clippings.txt` export.
///
/// The input is copied once with its byte-order mark stripped and line
/// endings unified; [`ClippingsParser::entries`] can then be called any
/// number of times, each call walking the blocks from the start.
#[derive(Debug, Clone)]
pub struct ClippingsParser {
    content: String,
}

impl ClippingsParser {
    pub fn new(raw: &str) -> Self {
        let content = raw
            .trim_start_matches('\u{feff}')
            .replace("\r\n", "\n")
            .replace('\r', "\n");
        ClippingsParser { content }
    }

    pub fn entries(&self) -> ClippingsEntries<'_> {
        ClippingsEntries {
            blocks: Blocks {
                lines: self.content.lines(),
                position: 0,
            },
            pending: None,
            queued: None,
        }
    }
}

/// Entries in file order.
///
/// Notes are folded into the highlight directly before them when the two
/// are for the same book and the note's location lies inside the
/// highlight's range or right after it. When either location has no usable
/// number the note is attached to that preceding highlight anyway. This is
/// a best-effort pairing: Kindle does not record which highlight a note
/// belongs to, and a note that fails the check is emitted on its own.
#[derive(Debug, Clone)]
pub struct ClippingsEntries<'a> {
    blocks: Blocks<'a>,
    pending: Option<RawEntry>,
    queued: Option<Item>,
}

impl ClippingsEntries<'_> {
    fn release(&mut self, item: Item) -> Option<Item> {
        match self.pending.take() {
            Some(highlight) => {
                self.queued = Some(item);
                Some(Ok(highlight))
            }
            None => Some(item),
        }
    }
}

impl Iterator for ClippingsEntries<'_> {
    type Item = Item;

    fn next(&mut self) -> Option<Item> {
        loop {
            if let Some(item) = self.queued.take() {
                return Some(item);
            }

            let Some((position, lines)) = self.blocks.next() else {
                return self.pending.take().map(Ok);
            };

            let entry = match parse_block(position, &lines) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(position = e.position, reason = %e.reason, "skipping clippings block");
                    return self.release(Err(e));
                }
            };

            match entry.kind {
                EntryKind::Highlight => {
                    if let Some(previous) = self.pending.replace(entry) {
                        return Some(Ok(previous));
                    }
                }
                EntryKind::Note => {
                    let attach = self
                        .pending
                        .as_ref()
                        .is_some_and(|highlight| note_belongs_to(highlight, &entry));
                    if !attach {
                        return self.release(Ok(entry));
                    }
                    if let Some(highlight) = self.pending.as_mut() {
                        tracing::debug!(
                            location = %entry.location,
                            highlight_location = %highlight.location,
                            "attaching note to preceding highlight"
                        );
                        highlight.note = Some(match highlight.note.take() {
                            Some(existing) => format!("{}\n\n{}", existing, entry.text),
                            None => entry.text,
                        });
                    }
                }
                EntryKind::Bookmark => return self.release(Ok(entry)),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Blocks<'a> {
    lines: Lines<'a>,
    position: usize,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = (usize, Vec<&'a str>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut block = Vec::new();
            let mut saw_line = false;

            for line in self.lines.by_ref() {
                saw_line = true;
                if line.trim() == SEPARATOR {
                    break;
                }
                block.push(line);
            }

            if !saw_line {
                return None;
            }
            if block.iter().all(|l| l.trim().is_empty()) {
                continue;
            }

            self.position += 1;
            return Some((self.position, block));
        }
    }
}

struct Metadata {
    kind: Option<EntryKind>,
    location: String,
    date: Option<String>,
}

fn parse_block(position: usize, lines: &[&str]) -> Result<RawEntry, MalformedRecord> {
    let malformed = |reason: &str| MalformedRecord {
        source: EntrySource::Clippings,
        position,
        reason: reason.to_string(),
    };

    let mut lines = lines.iter().skip_while(|l| l.trim().is_empty());

    let header = lines
        .next()
        .map(|l| l.trim_start_matches('\u{feff}').trim())
        .unwrap_or_default();
    if header.is_empty() {
        return Err(malformed("missing title line"));
    }

    let meta_line = match lines.next().map(|l| l.trim()) {
        Some(line) if line.starts_with('-') => line,
        _ => return Err(malformed("missing metadata line")),
    };
    let meta = parse_metadata_line(meta_line);

    let text = lines.copied().collect::<Vec<_>>().join("\n").trim().to_string();

    let kind = match meta.kind {
        Some(kind) => kind,
        None if text.is_empty() => EntryKind::Bookmark,
        None => EntryKind::Highlight,
    };

    Ok(RawEntry {
        header: header.to_string(),
        author: None,
        location: meta.location,
        date: meta.date,
        text,
        note: None,
        kind,
        source: EntrySource::Clippings,
    })
}

fn parse_metadata_line(line: &str) -> Metadata {
    let segments: Vec<&str> = line.trim_start_matches('-').split('|').map(str::trim).collect();
    let first = segments.first().map(|s| s.to_lowercase()).unwrap_or_default();

    let kind = if first.contains("highlight") || first.contains("clip") {
        Some(EntryKind::Highlight)
    } else if first.contains("note") {
        Some(EntryKind::Note)
    } else if first.contains("bookmark") {
        Some(EntryKind::Bookmark)
    } else {
        None
    };

    let location = find_labelled(&segments, &["location", "loc."])
        .or_else(|| find_labelled(&segments, &["page"]))
        .unwrap_or_default();

    let date = find_labelled(&segments, &["added on"]).filter(|d| !d.is_empty());

    Metadata {
        kind,
        location,
        date,
    }
}

/// Value following the first of `labels` found in any segment, e.g.
/// `"120-122"` for `"Your Highlight on Location 120-122"`.
fn find_labelled(segments: &[&str], labels: &[&str]) -> Option<String> {
    for segment in segments {
        let lower = segment.to_lowercase();
        for label in labels {
            if let Some(idx) = lower.find(label) {
                // Lowercasing can shift byte offsets for non-ASCII text.
                let start = idx + label.len();
                if lower.len() != segment.len() || !segment.is_char_boundary(start) {
                    continue;
                }
                return Some(segment[start..].trim().to_string());
            }
        }
    }
    None
}

fn note_belongs_to(highlight: &RawEntry, note: &RawEntry) -> bool {
    if highlight.header != note.header {
        return false;
    }
    match (location_range(&highlight.location), location_range(&note.location)) {
        (Some((start, end)), Some((at, _))) => at >= start && at <= end.saturating_add(1),
        _ => true,
    }
}

/// Numeric range of a location label. Kindle abbreviates range ends that
/// share a prefix with the start ("1203-05" means 1203 to 1205).
pub fn location_range(location: &str) -> Option<(u64, u64)> {
    let mut parts = location.splitn(2, '-').map(str::trim);
    let start_str = parts.next()?;
    let start: u64 = start_str.parse().ok()?;

    let end = match parts.next() {
        None | Some("") => start,
        Some(end_str) => {
            if !end_str.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let expanded = if end_str.len() < start_str.len() {
                format!("{}{}", &start_str[..start_str.len() - end_str.len()], end_str)
            } else {
                end_str.to_string()
            };
            expanded.parse().ok()?
        }
    };

    Some((start, end.max(start)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\u{feff}The Pragmatic Programmer (Hunt, Andrew)\r
- Your Highlight on page 12 | Location 170-172 | Added on Sunday, January 5, 2020 10:10:10 PM\r
\r
Care about your craft.\r
==========\r
The Pragmatic Programmer (Hunt, Andrew)\r
- Your Note on page 12 | Location 172 | Added on Sunday, January 5, 2020 10:11:00 PM\r
\r
Why else bother?\r
==========\r
Dune (Frank Herbert)\r
- Your Bookmark on Location 300 | Added on Monday, January 6, 2020 9:00:00 AM\r
\r
\r
==========\r
Dune (Frank Herbert)\r
- Your Highlight on Location 410-411 | Added on Monday, January 6, 2020 9:05:00 AM\r
\r
Fear is the mind-killer.\r
==========\r
";

    fn parse_all(content: &str) -> Vec<Item> {
        ClippingsParser::new(content).entries().collect()
    }

    #[test]
    fn test_parse_sample_in_file_order() {
        let entries: Vec<RawEntry> = parse_all(SAMPLE).into_iter().map(Result::unwrap).collect();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].header, "The Pragmatic Programmer (Hunt, Andrew)");
        assert_eq!(entries[0].kind, EntryKind::Highlight);
        assert_eq!(entries[0].location, "170-172");
        assert_eq!(entries[0].text, "Care about your craft.");
        assert_eq!(entries[0].note, Some("Why else bother?".to_string()));
        assert_eq!(
            entries[0].date.as_deref(),
            Some("Sunday, January 5, 2020 10:10:10 PM")
        );

        assert_eq!(entries[1].kind, EntryKind::Bookmark);
        assert_eq!(entries[1].text, "");

        assert_eq!(entries[2].header, "Dune (Frank Herbert)");
        assert_eq!(entries[2].location, "410-411");
    }

    #[test]
    fn test_entries_is_restartable() {
        let parser = ClippingsParser::new(SAMPLE);

        let first: Vec<Item> = parser.entries().collect();
        let second: Vec<Item> = parser.entries().collect();

        assert_eq!(first, second);
    }

    #[test]
    fn test_note_far_from_highlight_stays_separate() {
        let content = "Book (Author)
- Your Highlight on Location 10-11 | Added on Monday, January 6, 2020 9:05:00 AM

First passage.
==========
Book (Author)
- Your Note on Location 95 | Added on Monday, January 6, 2020 9:06:00 AM

Unrelated thought.
==========
";
        let entries: Vec<RawEntry> = parse_all(content).into_iter().map(Result::unwrap).collect();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].note, None);
        assert_eq!(entries[1].kind, EntryKind::Note);
        assert_eq!(entries[1].text, "Unrelated thought.");
    }

    #[test]
    fn test_note_without_numeric_location_attaches_to_previous() {
        let content = "Book (Author)
- Your Highlight on page iv | Added on Monday, January 6, 2020 9:05:00 AM

Preface passage.
==========
Book (Author)
- Your Note on page iv | Added on Monday, January 6, 2020 9:06:00 AM

Nice.
==========
";
        let entries: Vec<RawEntry> = parse_all(content).into_iter().map(Result::unwrap).collect();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].location, "iv");
        assert_eq!(entries[0].note, Some("Nice.".to_string()));
    }

    #[test]
    fn test_note_for_other_book_is_not_attached() {
        let content = "Book A
- Your Highlight on Location 10 | Added on Monday, January 6, 2020 9:05:00 AM

Passage.
==========
Book B
- Your Note on Location 10 | Added on Monday, January 6, 2020 9:06:00 AM

Note.
==========
";
        let entries: Vec<RawEntry> = parse_all(content).into_iter().map(Result::unwrap).collect();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].note, None);
        assert_eq!(entries[1].header, "Book B");
    }

    #[test]
    fn test_malformed_block_is_skipped_and_parsing_continues() {
        let content = "Lonely title line
==========
Book (Author)
- Your Highlight on Location 5 | Added on Monday, January 6, 2020 9:05:00 AM

Still parsed.
==========
";
        let items = parse_all(content);

        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Err(e) if e.position == 1));
        assert_eq!(items[1].as_ref().unwrap().text, "Still parsed.");
    }

    #[test]
    fn test_malformed_block_after_highlight_keeps_order() {
        let content = "Book (Author)
- Your Highlight on Location 5

Passage.
==========
Broken
no dash here
==========
";
        let items = parse_all(content);

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[test]
    fn test_unknown_marker_falls_back_on_text() {
        let content = "Book
- Ihre Markierung bei Position 5

Text here.
==========
Book
- Ihr Lesezeichen

==========
";
        let entries: Vec<RawEntry> = parse_all(content).into_iter().map(Result::unwrap).collect();

        assert_eq!(entries[0].kind, EntryKind::Highlight);
        assert_eq!(entries[0].location, "");
        assert_eq!(entries[1].kind, EntryKind::Bookmark);
    }

    #[test]
    fn test_missing_trailing_separator() {
        let content = "Book\n- Your Highlight on Location 7\n\nLast one.";
        let entries: Vec<RawEntry> = parse_all(content).into_iter().map(Result::unwrap).collect();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "Last one.");
    }

    #[test]
    fn test_location_range() {
        assert_eq!(location_range("120-122"), Some((120, 122)));
        assert_eq!(location_range("1203-05"), Some((1203, 1205)));
        assert_eq!(location_range("42"), Some((42, 42)));
        assert_eq!(location_range("iv"), None);
        assert_eq!(location_range(""), None);
    }

    #[test]
    fn test_note_at_largest_location_attaches() {
        let content = "Book (Author)
- Your Highlight on Location 18446744073709551615 | Added on Monday, January 6, 2020 9:05:00 AM

Last passage.
==========
Book (Author)
- Your Note on Location 18446744073709551615 | Added on Monday, January 6, 2020 9:06:00 AM

At the very end.
==========
";
        let entries: Vec<RawEntry> = parse_all(content).into_iter().map(Result::unwrap).collect();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].note.as_deref(), Some("At the very end."));
    }
}
