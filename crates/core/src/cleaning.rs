use crate::error::RagError;
use crate::extractor::PageText;
use regex::Regex;
use std::collections::HashMap;

const MAX_CLEAN_PASSES: usize = 8;
const MIN_PAGES_FOR_RUNNING_LINES: usize = 3;

/// Strips structural noise from extracted page text.
///
/// Removal is lossy: a body line that happens to start with "Chapter 3" goes too.
/// The cleaner runs its rules to a fixpoint, so cleaning clean text changes nothing.
#[derive(Debug, Clone)]
pub struct TextCleaner {
    removals: Vec<Regex>,
    inline_space: Regex,
    blank_runs: Regex,
}

impl TextCleaner {
    pub fn new() -> Result<Self, RagError> {
        let removals = [
            r"(?im)^[ \t]*(?:chapter|section)[ \t]*\d+\b.*$",
            r"(?i)\bpage[ \t]*\d+\b",
            r"\b\d+[ \t]*/[ \t]*\d+\b",
            r"(?m)^[ \t]*\d{1,4}[ \t]*$",
            r"(?i)(?:©|\(c\)|\bcopyright\b)[^\n]*?\d{4}",
            r"(?im)^.*\bisbn\b.*$",
            r"\S+@\S+",
            r"(?i)\b(?:https?://|www\.)\S+",
        ]
        .iter()
        .map(|pattern| Regex::new(pattern))
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            removals,
            inline_space: Regex::new(r"[ \t\u{a0}\r]+")?,
            blank_runs: Regex::new(r"\n{3,}")?,
        })
    }

    pub fn clean(&self, text: &str) -> String {
        let mut current = self.collapse_whitespace(text);
        for _ in 0..MAX_CLEAN_PASSES {
            let next = self.clean_once(&current);
            if next == current {
                break;
            }
            current = next;
        }
        current
    }

    fn clean_once(&self, text: &str) -> String {
        let mut stripped = text.to_string();
        for pattern in &self.removals {
            stripped = pattern.replace_all(&stripped, "").into_owned();
        }
        self.collapse_whitespace(&stripped)
    }

    fn collapse_whitespace(&self, text: &str) -> String {
        let spaced = self.inline_space.replace_all(text, " ");
        let lines = spaced.lines().map(str::trim).collect::<Vec<_>>().join("\n");
        self.blank_runs
            .replace_all(&lines, "\n\n")
            .trim()
            .to_string()
    }
}

/// Removes running headers and footers: lines that open or close most pages of a document.
/// Digits are masked when comparing so "Title 12" and "Title 13" count as the same line.
pub fn strip_running_lines(pages: &mut [PageText]) {
    if pages.len() < MIN_PAGES_FOR_RUNNING_LINES {
        return;
    }

    let mut edge_counts: HashMap<String, usize> = HashMap::new();
    for page in pages.iter() {
        let (first, last) = edge_lines(&page.text);
        let mut keys = Vec::new();
        if let Some(first) = first {
            keys.push(line_key(first));
        }
        if let Some(last) = last {
            keys.push(line_key(last));
        }
        keys.sort_unstable();
        keys.dedup();
        for key in keys {
            *edge_counts.entry(key).or_default() += 1;
        }
    }

    let threshold = (pages.len() / 2).max(MIN_PAGES_FOR_RUNNING_LINES);
    let running = edge_counts
        .into_iter()
        .filter(|(key, count)| !key.is_empty() && *count >= threshold)
        .map(|(key, _)| key)
        .collect::<Vec<_>>();

    if running.is_empty() {
        return;
    }

    for page in pages.iter_mut() {
        let lines = page.text.lines().collect::<Vec<_>>();
        let non_empty = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(index, _)| index)
            .collect::<Vec<_>>();
        let (Some(&first), Some(&last)) = (non_empty.first(), non_empty.last()) else {
            continue;
        };

        let kept = lines
            .iter()
            .enumerate()
            .filter(|(index, line)| {
                let at_edge = *index == first || *index == last;
                !(at_edge && running.contains(&line_key(line)))
            })
            .map(|(_, line)| *line)
            .collect::<Vec<_>>();
        page.text = kept.join("\n");
    }
}

fn edge_lines(text: &str) -> (Option<&str>, Option<&str>) {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let first = lines.next();
    let last = lines.last();
    (first, last)
}

fn line_key(line: &str) -> String {
    let mut key = String::with_capacity(line.len());
    let mut previous_digit = false;
    for ch in line.trim().chars() {
        if ch.is_ascii_digit() {
            if !previous_digit {
                key.push('#');
            }
            previous_digit = true;
        } else {
            key.extend(ch.to_lowercase());
            previous_digit = false;
        }
    }
    key.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cleaner() -> TextCleaner {
        TextCleaner::new().expect("cleaner patterns compile")
    }

    #[test]
    fn removes_structural_noise() {
        let raw = "Chapter 3 Storage Engines\nA B-tree keeps   keys sorted.\nPage 12\n\
                   Contact author@example.com or visit https://example.com/book.\n\
                   ISBN 978-3-16-148410-0\n© Acme Press 2021\n5 / 111";
        let cleaned = cleaner().clean(raw);

        assert!(cleaned.contains("A B-tree keeps keys sorted."));
        assert!(!cleaned.contains("Chapter"));
        assert!(!cleaned.contains("Page 12"));
        assert!(!cleaned.contains('@'));
        assert!(!cleaned.contains("https"));
        assert!(!cleaned.contains("ISBN"));
        assert!(!cleaned.contains('©'));
        assert!(!cleaned.contains("111"));
    }

    #[test]
    fn bare_page_number_lines_are_dropped() {
        let cleaned = cleaner().clean("First paragraph.\n\n17\n\nSecond paragraph.");
        assert_eq!(cleaned, "First paragraph.\n\nSecond paragraph.");
    }

    #[test]
    fn whitespace_is_collapsed_but_paragraphs_survive() {
        let cleaned = cleaner().clean("  One \t two\u{a0} three \n\n\n\n four  ");
        assert_eq!(cleaned, "One two three\n\nfour");
    }

    #[test]
    fn cleaning_is_idempotent() {
        let cleaner = cleaner();
        let samples = [
            "Page 3 12\nBody text that stays.",
            "Section 4\n\n\nIndexes speed up reads. page 9 / 10",
            "Already clean text.\n\nWith two paragraphs.",
        ];
        for sample in samples {
            let once = cleaner.clean(sample);
            assert_eq!(cleaner.clean(&once), once, "sample: {sample:?}");
        }
    }

    #[test]
    fn running_headers_and_footers_are_stripped() {
        let mut pages = (1..=4)
            .map(|number| PageText {
                number,
                text: format!(
                    "Designing Data Systems\nBody of page {number} is unique.\nAcme Press - {number}"
                ),
            })
            .collect::<Vec<_>>();

        strip_running_lines(&mut pages);

        for page in &pages {
            assert!(!page.text.contains("Designing Data Systems"));
            assert!(!page.text.contains("Acme Press"));
            assert!(page.text.contains("is unique."));
        }
    }

    #[test]
    fn short_documents_keep_their_edges() {
        let mut pages = vec![
            PageText {
                number: 1,
                text: "Title\nBody".to_string(),
            },
            PageText {
                number: 2,
                text: "Title\nMore".to_string(),
            },
        ];
        strip_running_lines(&mut pages);
        assert!(pages[0].text.starts_with("Title"));
    }
}
