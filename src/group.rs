use crate::models::{BookGroup, Highlight};
use chrono::NaiveDate;
use std::collections::HashMap;

/// Bucket highlights by exact `(title, author)`.
///
/// Books come out in order of first appearance and each book keeps its
/// highlights in input order. Keys are case-sensitive, so "Dune (Frank
/// Herbert)" and "Dune (frank herbert)" are two different books.
pub fn group_by_book(highlights: impl IntoIterator<Item = Highlight>) -> Vec<BookGroup> {
    let mut groups: Vec<BookGroup> = Vec::new();
    let mut index: HashMap<(String, Option<String>), usize> = HashMap::new();

    for highlight in highlights {
        let key = (highlight.title.clone(), highlight.author.clone());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(BookGroup {
                title: highlight.title.clone(),
                author: highlight.author.clone(),
                highlights: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].highlights.push(highlight);
    }

    groups
}

/// Keep highlights added on or after `since`. Undated highlights are kept.
pub fn filter_since(highlights: Vec<Highlight>, since: NaiveDate) -> Vec<Highlight> {
    highlights
        .into_iter()
        .filter(|h| h.added.map_or(true, |added| added.date() >= since))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntrySource;
    use chrono::NaiveDateTime;

    fn make_highlight(title: &str, author: Option<&str>, location: &str) -> Highlight {
        Highlight {
            title: title.to_string(),
            author: author.map(String::from),
            location: location.to_string(),
            text: format!("text at {}", location),
            note: None,
            added: None,
            source: EntrySource::Clippings,
            hash: format!("{}-{}", title, location),
        }
    }

    fn dated(mut h: Highlight, date: &str) -> Highlight {
        h.added = Some(
            NaiveDateTime::parse_from_str(&format!("{} 12:00:00", date), "%Y-%m-%d %H:%M:%S")
                .unwrap(),
        );
        h
    }

    #[test]
    fn test_group_preserves_first_appearance_order() {
        let groups = group_by_book(vec![
            make_highlight("Dune", Some("Frank Herbert"), "10-11"),
            make_highlight("Emma", Some("Jane Austen"), "5"),
            make_highlight("Dune", Some("Frank Herbert"), "20-21"),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].title, "Dune");
        assert_eq!(groups[0].highlights.len(), 2);
        assert_eq!(groups[0].highlights[0].location, "10-11");
        assert_eq!(groups[0].highlights[1].location, "20-21");
        assert_eq!(groups[1].title, "Emma");
    }

    #[test]
    fn test_group_author_case_is_significant() {
        let groups = group_by_book(vec![
            make_highlight("Dune", Some("Frank Herbert"), "1"),
            make_highlight("Dune", Some("frank herbert"), "2"),
            make_highlight("Dune", None, "3"),
        ]);

        assert_eq!(groups.len(), 3);
    }

    #[test]
    fn test_group_empty_input() {
        assert!(group_by_book(Vec::new()).is_empty());
    }

    #[test]
    fn test_filter_since() {
        let highlights = vec![
            dated(make_highlight("Dune", None, "1"), "2024-01-01"),
            dated(make_highlight("Dune", None, "2"), "2024-02-01"),
            make_highlight("Dune", None, "3"),
        ];

        let since = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let kept = filter_since(highlights, since);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].location, "2");
        assert_eq!(kept[1].location, "3");
    }
}
