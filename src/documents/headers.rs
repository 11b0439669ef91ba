//! Section Header Detection
//!
//! The chunker asks a [`HeaderPredicate`] whether a line opens a new section.
//! The default heuristic recognises short uppercase lines, numbered headings
//! and markdown headings; callers can swap it without touching assembly.

use std::collections::HashMap;

/// Decides whether a single line is a section header.
pub trait HeaderPredicate: Send + Sync {
    fn is_probable_header(&self, line: &str) -> bool;

    /// Section label recorded for a header line.
    fn label(&self, line: &str) -> String {
        line.trim()
            .trim_start_matches('#')
            .trim()
            .trim_end_matches(':')
            .trim()
            .to_string()
    }
}

impl<F> HeaderPredicate for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_probable_header(&self, line: &str) -> bool {
        self(line)
    }
}

/// Default string heuristics for prospectus-style documents.
#[derive(Debug, Clone)]
pub struct HeuristicHeaders {
    pub max_words: usize,
    pub max_chars: usize,
}

impl Default for HeuristicHeaders {
    fn default() -> Self {
        Self {
            max_words: 12,
            max_chars: 120,
        }
    }
}

impl HeaderPredicate for HeuristicHeaders {
    fn is_probable_header(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || line.len() > self.max_chars {
            return false;
        }

        if line.starts_with('#') {
            return !line.trim_start_matches('#').trim().is_empty();
        }

        let words = line.split_whitespace().count();
        if words > self.max_words {
            return false;
        }

        is_uppercase_heading(line) || is_numbered_heading(line)
    }
}

/// "RISK FACTORS", "OBJECTS OF THE ISSUE"
fn is_uppercase_heading(line: &str) -> bool {
    let visible = line.chars().filter(|c| !c.is_whitespace()).count();
    let letters: Vec<char> = line.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 3 || letters.len() * 10 < visible * 6 {
        return false;
    }
    if line.ends_with('.') || line.ends_with(',') || line.ends_with(';') {
        return false;
    }
    letters.iter().all(|c| !c.is_lowercase())
}

/// "1. Introduction", "4.2 Use of Proceeds", "IV) Capital Structure", "Section 3 Definitions"
fn is_numbered_heading(line: &str) -> bool {
    let mut parts = line.splitn(2, char::is_whitespace);
    let (marker, rest) = match (parts.next(), parts.next()) {
        (Some(m), Some(r)) => (m, r.trim()),
        _ => return false,
    };

    let rest = if matches!(
        marker.to_ascii_lowercase().as_str(),
        "section" | "chapter" | "part" | "article" | "item"
    ) {
        let mut inner = rest.splitn(2, char::is_whitespace);
        match (inner.next(), inner.next()) {
            (Some(num), Some(r)) if is_number_marker(num) => r.trim(),
            _ => return false,
        }
    } else if is_number_marker(marker) {
        rest
    } else {
        return false;
    };

    let starts_upper = rest.chars().next().map_or(false, |c| c.is_uppercase());
    let terminal = rest.ends_with('.') || rest.ends_with(',') || rest.ends_with(';');
    starts_upper && !terminal
}

fn is_number_marker(token: &str) -> bool {
    let core = token.trim_end_matches(|c| c == '.' || c == ')' || c == ':');
    if core.is_empty() {
        return false;
    }
    let dotted_digits = core
        .split('.')
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    let roman = core.len() <= 5
        && core.chars().all(|c| matches!(c, 'I' | 'V' | 'X' | 'L' | 'C'))
        && core.len() < token.len();
    let lettered = core.len() == 1
        && core.chars().all(|c| c.is_ascii_uppercase())
        && core.len() < token.len();
    dotted_digits || roman || lettered
}

/// Caller-supplied section titles. A line equal to a hint (ignoring case,
/// spacing and a trailing colon) is treated as a header labelled with the hint.
#[derive(Debug, Clone, Default)]
pub struct SectionHints {
    labels: HashMap<String, String>,
}

impl SectionHints {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels = labels
            .into_iter()
            .map(Into::into)
            .filter(|label| !label.trim().is_empty())
            .map(|label| (normalize_hint(&label), label.trim().to_string()))
            .collect();
        Self { labels }
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn match_line(&self, line: &str) -> Option<&str> {
        if self.labels.is_empty() {
            return None;
        }
        self.labels.get(&normalize_hint(line)).map(String::as_str)
    }
}

fn normalize_hint(text: &str) -> String {
    text.trim()
        .trim_start_matches('#')
        .trim_end_matches(|c| c == ':' || c == '.')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
