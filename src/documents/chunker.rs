//! Document Chunking
//!
//! Splits document text into bounded, overlapping chunks for embedding and
//! retrieval. Sizes are counted in whitespace-delimited tokens; every chunk
//! records the token range and byte range it covers in the source text.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::headers::{HeaderPredicate, HeuristicHeaders, SectionHints};
use super::tables::is_table_block;

#[derive(Error, Debug)]
pub enum ChunkerError {
    #[error("Document {0} produced no chunks")]
    EmptyDocument(String),
    #[error("Invalid chunker options: {0}")]
    InvalidOptions(String),
}

impl Serialize for ChunkerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// How downstream consumers should treat a chunk's text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Prose, bounded by `max_chunk_size`
    Text,
    /// A whole table region, never split, may exceed `max_chunk_size`
    Table,
}

/// A chunk of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Corpus-unique identifier, derived from document id and index
    pub id: String,
    pub document_id: String,
    /// Chunk index within document
    pub index: u32,
    pub content: String,
    pub token_count: u32,
    /// Byte range in the source text
    pub start_pos: usize,
    pub end_pos: usize,
    /// Token range in the document's token stream. Empty for tables
    /// supplied separately from the document text.
    pub start_token: usize,
    pub end_token: usize,
    /// Most recent section heading, if any
    pub section: Option<String>,
    /// Whether the leading tokens are shared with the previous chunk
    pub overlaps_previous: bool,
    pub kind: ChunkKind,
}

impl Chunk {
    pub fn is_table(&self) -> bool {
        self.kind == ChunkKind::Table
    }
}

/// Build the identifier for a document's chunk
pub fn chunk_id(document_id: &str, index: u32) -> String {
    format!("{}#{:05}", document_id, index)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkerOptions {
    pub max_chunk_size: usize,
    pub min_chunk_size: usize,
    pub overlap_fraction: f64,
}

impl Default for ChunkerOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: 512,
            min_chunk_size: 64,
            overlap_fraction: 0.15,
        }
    }
}

impl ChunkerOptions {
    /// Tokens carried over from the end of one chunk into the next
    pub fn overlap_tokens(&self) -> usize {
        (self.max_chunk_size as f64 * self.overlap_fraction + 1e-9).floor() as usize
    }

    fn validate(&self) -> Result<(), ChunkerError> {
        if self.max_chunk_size == 0 {
            return Err(ChunkerError::InvalidOptions("max_chunk_size must be positive".into()));
        }
        if self.min_chunk_size == 0 || self.min_chunk_size >= self.max_chunk_size {
            return Err(ChunkerError::InvalidOptions(format!(
                "min_chunk_size must be in [1, {})",
                self.max_chunk_size
            )));
        }
        if !(0.0..0.5).contains(&self.overlap_fraction) {
            return Err(ChunkerError::InvalidOptions("overlap_fraction must be in [0.0, 0.5)".into()));
        }
        Ok(())
    }
}

/// Splits document text into chunks.
#[derive(Clone)]
pub struct Chunker {
    options: ChunkerOptions,
    headers: Arc<dyn HeaderPredicate>,
}

impl Chunker {
    pub fn new(options: ChunkerOptions) -> Result<Self, ChunkerError> {
        options.validate()?;
        Ok(Self {
            options,
            headers: Arc::new(HeuristicHeaders::default()),
        })
    }

    /// Replace the section header heuristic
    pub fn with_header_predicate<P>(mut self, predicate: P) -> Self
    where
        P: HeaderPredicate + 'static,
    {
        self.headers = Arc::new(predicate);
        self
    }

    pub fn options(&self) -> &ChunkerOptions {
        &self.options
    }

    /// Chunk a document. Empty or blank input yields no chunks.
    pub fn chunk(&self, document_id: &str, text: &str, hints: Option<&SectionHints>) -> Vec<Chunk> {
        let scan = self.scan(text, hints);
        if scan.tokens.is_empty() {
            return Vec::new();
        }

        let mut assembly = Assembly::new(&self.options);
        for block in &scan.blocks {
            match block {
                Block::Header(label) => assembly.push_header(label),
                Block::Paragraph { first, last } => assembly.push_paragraph(*first, *last),
                Block::Table { first, last, .. } => assembly.push_table(*first, *last),
            }
        }
        let spans = assembly.finish();

        let chunks: Vec<Chunk> = spans
            .into_iter()
            .enumerate()
            .map(|(i, span)| scan.render(document_id, i as u32, span))
            .collect();

        debug!(
            doc_id = %document_id,
            tokens = scan.tokens.len(),
            chunks = chunks.len(),
            "Chunked document"
        );
        chunks
    }

    /// Build a table chunk from a table handed over separately from the
    /// document text. Returns `None` for a blank table.
    pub fn table_chunk(
        &self,
        document_id: &str,
        index: u32,
        table_text: &str,
        section: Option<&str>,
    ) -> Option<Chunk> {
        let content = table_text
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        if content.is_empty() {
            return None;
        }

        Some(Chunk {
            id: chunk_id(document_id, index),
            document_id: document_id.to_string(),
            index,
            token_count: content.split_whitespace().count() as u32,
            content,
            start_pos: 0,
            end_pos: table_text.len(),
            start_token: 0,
            end_token: 0,
            section: section.map(|s| s.to_string()),
            overlaps_previous: false,
            kind: ChunkKind::Table,
        })
    }

    fn header_label(&self, line: &str, hints: Option<&SectionHints>) -> Option<String> {
        if let Some(label) = hints.and_then(|h| h.match_line(line)) {
            return Some(label.to_string());
        }
        if self.headers.is_probable_header(line) {
            let label = self.headers.label(line);
            if !label.is_empty() {
                return Some(label);
            }
        }
        None
    }

    /// Normalize line endings, split paragraphs on blank lines, and tokenize.
    fn scan<'t>(&self, text: &'t str, hints: Option<&SectionHints>) -> Scan<'t> {
        let mut scan = Scan {
            text,
            tokens: Vec::new(),
            blocks: Vec::new(),
        };

        let mut paragraph: Vec<(usize, &str)> = Vec::new();
        let mut offset = 0usize;
        for raw in text.split('\n') {
            let line_start = offset;
            offset += raw.len() + 1;
            let line = raw.trim_end_matches('\r');
            if line.trim().is_empty() {
                self.scan_paragraph(&mut scan, &paragraph, hints);
                paragraph.clear();
            } else {
                paragraph.push((line_start, line));
            }
        }
        self.scan_paragraph(&mut scan, &paragraph, hints);

        scan
    }

    fn scan_paragraph<'t>(
        &self,
        scan: &mut Scan<'t>,
        lines: &[(usize, &'t str)],
        hints: Option<&SectionHints>,
    ) {
        if lines.is_empty() {
            return;
        }

        let texts: Vec<&str> = lines.iter().map(|(_, line)| *line).collect();
        if is_table_block(&texts) {
            let first = scan.tokens.len();
            let paragraph = scan.blocks.len();
            for (start, line) in lines {
                scan.push_words(*start, line, paragraph);
            }
            let last = scan.tokens.len();
            if last > first {
                scan.blocks.push(Block::Table { first, last });
            }
            return;
        }

        // Header lines set the section label and stay in the text as their
        // own paragraph, so a misdetected line loses nothing.
        let mut body = lines;
        while let Some((start, line)) = body.first() {
            let Some(label) = self.header_label(line, hints) else {
                break;
            };
            scan.blocks.push(Block::Header(label));
            scan.push_paragraph(&[(*start, *line)]);
            body = &body[1..];
        }
        scan.push_paragraph(body);
    }
}

/// A whitespace-delimited token: byte range plus the block it belongs to
#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
    block: usize,
}

#[derive(Debug)]
enum Block {
    Header(String),
    Paragraph { first: usize, last: usize },
    Table { first: usize, last: usize },
}

struct Scan<'t> {
    text: &'t str,
    tokens: Vec<Token>,
    blocks: Vec<Block>,
}

impl<'t> Scan<'t> {
    fn push_paragraph(&mut self, lines: &[(usize, &str)]) {
        let first = self.tokens.len();
        let paragraph = self.blocks.len();
        for (start, line) in lines {
            self.push_words(*start, line, paragraph);
        }
        let last = self.tokens.len();
        if last > first {
            self.blocks.push(Block::Paragraph { first, last });
        }
    }

    fn push_words(&mut self, line_start: usize, line: &str, block: usize) {
        let mut word_start: Option<usize> = None;
        for (i, c) in line.char_indices() {
            if c.is_whitespace() {
                if let Some(start) = word_start.take() {
                    self.tokens.push(Token {
                        start: line_start + start,
                        end: line_start + i,
                        block,
                    });
                }
            } else if word_start.is_none() {
                word_start = Some(i);
            }
        }
        if let Some(start) = word_start {
            self.tokens.push(Token {
                start: line_start + start,
                end: line_start + line.len(),
                block,
            });
        }
    }

    fn render(&self, document_id: &str, index: u32, span: Span) -> Chunk {
        let tokens = &self.tokens[span.start..span.end];
        let start_pos = tokens.first().map_or(0, |t| t.start);
        let end_pos = tokens.last().map_or(0, |t| t.end);

        let content = match span.kind {
            ChunkKind::Table => self.text[start_pos..end_pos]
                .lines()
                .map(|line| line.trim_end_matches('\r').trim_end())
                .filter(|line| !line.trim().is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            ChunkKind::Text => {
                let mut content = String::new();
                let mut previous: Option<&Token> = None;
                for token in tokens {
                    if let Some(prev) = previous {
                        content.push_str(if prev.block == token.block { " " } else { "\n\n" });
                    }
                    content.push_str(&self.text[token.start..token.end]);
                    previous = Some(token);
                }
                content
            }
        };

        Chunk {
            id: chunk_id(document_id, index),
            document_id: document_id.to_string(),
            index,
            content,
            token_count: (span.end - span.start) as u32,
            start_pos,
            end_pos,
            start_token: span.start,
            end_token: span.end,
            section: span.section,
            overlaps_previous: span.overlaps_previous,
            kind: span.kind,
        }
    }
}

/// A finished chunk as a token range
#[derive(Debug, Clone)]
struct Span {
    start: usize,
    end: usize,
    section: Option<String>,
    overlaps_previous: bool,
    kind: ChunkKind,
}

/// The chunk currently being filled. Tokens in `start..fresh_from` are the
/// overlap carried from the previous chunk.
#[derive(Debug)]
struct OpenChunk {
    start: usize,
    end: usize,
    fresh_from: usize,
    section: Option<String>,
}

impl OpenChunk {
    fn size(&self) -> usize {
        self.end - self.start
    }

    fn new_tokens(&self) -> usize {
        self.end - self.fresh_from
    }
}

/// Greedy paragraph packing with overlap, header boundaries and table isolation.
struct Assembly {
    max: usize,
    min: usize,
    overlap: usize,
    spans: Vec<Span>,
    current: Option<OpenChunk>,
    /// Last closed text chunk, eligible as the overlap source
    last_text: Option<(usize, usize)>,
    section: Option<String>,
}

impl Assembly {
    fn new(options: &ChunkerOptions) -> Self {
        Self {
            max: options.max_chunk_size,
            min: options.min_chunk_size,
            overlap: options.overlap_tokens(),
            spans: Vec::new(),
            current: None,
            last_text: None,
            section: None,
        }
    }

    fn open_at(&mut self, pos: usize) -> OpenChunk {
        let start = match self.last_text {
            Some((prev_start, prev_end)) if prev_end == pos && self.overlap > 0 => {
                pos - self.overlap.min(prev_end - prev_start)
            }
            _ => pos,
        };
        OpenChunk {
            start,
            end: pos,
            fresh_from: pos,
            section: self.section.clone(),
        }
    }

    fn close(&mut self) {
        if let Some(open) = self.current.take() {
            if open.new_tokens() == 0 {
                return;
            }
            self.last_text = Some((open.start, open.end));
            self.spans.push(Span {
                start: open.start,
                end: open.end,
                overlaps_previous: open.start < open.fresh_from,
                section: open.section,
                kind: ChunkKind::Text,
            });
        }
    }

    fn push_header(&mut self, label: &str) {
        let ready = self
            .current
            .as_ref()
            .map_or(false, |open| open.new_tokens() > 0 && open.size() >= self.min);
        if ready {
            self.close();
        }
        self.section = Some(label.to_string());
    }

    /// A text chunk still short of `min` when a table arrives folds into its
    /// text predecessor if the result fits `max`; otherwise its own tokens
    /// lead the table chunk as a caption.
    fn push_table(&mut self, first: usize, last: usize) {
        let mut start = first;
        if let Some(open) = self.current.take() {
            if open.new_tokens() > 0 && open.size() < self.min {
                let max = self.max;
                let folded = match self.spans.last_mut() {
                    Some(prev)
                        if prev.kind == ChunkKind::Text
                            && prev.end >= open.start
                            && open.end - prev.start <= max =>
                    {
                        prev.end = open.end;
                        true
                    }
                    _ => false,
                };
                if !folded {
                    start = open.fresh_from;
                }
            } else {
                self.current = Some(open);
                self.close();
            }
        }
        self.spans.push(Span {
            start,
            end: last,
            section: self.section.clone(),
            overlaps_previous: false,
            kind: ChunkKind::Table,
        });
        self.last_text = None;
    }

    fn push_paragraph(&mut self, first: usize, last: usize) {
        let mut pos = first;
        while pos < last {
            let mut open = match self.current.take() {
                Some(open) => open,
                None => self.open_at(pos),
            };

            let room = self.max - open.size();
            let remaining = last - pos;
            if remaining <= room {
                open.end = last;
                pos = last;
                self.current = Some(open);
                continue;
            }

            // The paragraph does not fit. Start a new chunk at the paragraph
            // boundary when this one is big enough and the paragraph fits a
            // fresh chunk; otherwise fill this chunk and split the paragraph.
            let fits_fresh = remaining + self.overlap <= self.max;
            if !(open.new_tokens() > 0 && open.size() >= self.min && fits_fresh) {
                open.end += room;
                pos += room;
            }
            self.current = Some(open);
            self.close();
        }
    }

    fn finish(mut self) -> Vec<Span> {
        self.close();
        self.merge_short_tail();
        self.spans
    }

    /// Fold a short final text chunk into its text predecessor.
    fn merge_short_tail(&mut self) {
        if self.spans.len() < 2 {
            return;
        }
        let last = &self.spans[self.spans.len() - 1];
        let prev = &self.spans[self.spans.len() - 2];
        let mergeable = last.kind == ChunkKind::Text
            && prev.kind == ChunkKind::Text
            && last.end - last.start < self.min
            && prev.end >= last.start;
        if mergeable {
            if let Some(tail) = self.spans.pop() {
                if let Some(prev) = self.spans.last_mut() {
                    prev.end = tail.end;
                }
            }
        }
    }
}
