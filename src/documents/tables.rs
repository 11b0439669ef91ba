//! Table Region Detection
//!
//! Extracted text keeps tables as aligned rows: pipe-delimited, tab-separated
//! or padded with runs of spaces. A paragraph whose lines mostly look like
//! rows is a table region and is never split.

/// Minimum number of lines before a block is considered a table.
const MIN_TABLE_LINES: usize = 2;

/// Returns true if a single line looks like a table row or rule.
pub fn looks_like_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }

    if trimmed.matches('|').count() >= 2 {
        return true;
    }

    if trimmed.contains("---") && trimmed.chars().all(|c| matches!(c, '-' | '+' | '=' | '|' | ':' | ' ')) {
        return true;
    }

    if trimmed.split('\t').filter(|cell| !cell.trim().is_empty()).count() >= 2 {
        return true;
    }

    wide_gaps(trimmed) >= 2
}

/// Count runs of two or more spaces between visible characters.
fn wide_gaps(line: &str) -> usize {
    let mut gaps = 0;
    let mut run = 0;
    for c in line.chars() {
        if c == ' ' {
            run += 1;
        } else {
            if run >= 2 {
                gaps += 1;
            }
            run = 0;
        }
    }
    gaps
}

/// Returns true if at least 80% of the block's lines look like rows.
pub fn is_table_block(lines: &[&str]) -> bool {
    if lines.len() < MIN_TABLE_LINES {
        return false;
    }
    let rows = lines.iter().filter(|line| looks_like_table_row(line)).count();
    rows * 5 >= lines.len() * 4
}
