//! Paragraph → sentence → hard-cut text chunker.
//!
//! Splits a note's content into [`Chunk`]s of at most `chunk_size` chars
//! (plus overlap). Splitting prefers paragraph boundaries (blank lines);
//! a paragraph that is still too long is split into sentences, and a
//! sentence that is still too long is cut at exactly `chunk_size` chars.
//!
//! # Algorithm
//!
//! 1. Find paragraph spans: runs of non-blank lines separated by blank lines.
//! 2. Break each oversized paragraph into sentence spans, and each oversized
//!    sentence into fixed-width pieces. The result is a list of *units*.
//! 3. Pack units greedily: a unit joins the current segment while the span
//!    from the segment start to the unit end stays within `chunk_size`.
//! 4. Every segment after the first is prefixed with up to `overlap` chars
//!    taken from the previous segment, snapped forward to a word start.
//!
//! Offsets are tracked against the original content, so each chunk's
//! [`ChunkPosition`] can be used for citations and overlap deduplication.
//!
//! Chunk ids are UUID v5 over `(note_id, index, sha256(text))`: the same
//! content always produces the same ids, and editing one region of a note
//! only changes the ids of the chunks whose text changed.
//!
//! # Example
//!
//! ```rust
//! use notectx_core::chunk::{chunk_text, ChunkParams};
//!
//! let params = ChunkParams { chunk_size: 1200, overlap: 100 };
//! let chunks = chunk_text("note-1", "Hello world.\n\nSecond paragraph.", &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].position.index, 0);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, ChunkPosition, Note};

/// Namespace for chunk id derivation. Changing it changes every chunk id.
const CHUNK_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6e6f_7465_6374_7800_9c1d_4b2a_51e0_7d33);

/// Default chunk size in chars.
pub const DEFAULT_CHUNK_SIZE: usize = 1200;
/// Default overlap width in chars.
pub const DEFAULT_OVERLAP: usize = 100;

/// Chunking parameters. Both values count chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl ChunkParams {
    /// Reject parameter combinations the chunker cannot honour.
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be > 0".to_string());
        }
        if self.overlap >= self.chunk_size {
            return Err(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            ));
        }
        Ok(())
    }
}

/// Byte span into the original text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

/// Maps byte offsets to char offsets and back.
struct CharIndex {
    starts: Vec<usize>,
    len: usize,
}

impl CharIndex {
    fn new(text: &str) -> Self {
        Self {
            starts: text.char_indices().map(|(i, _)| i).collect(),
            len: text.len(),
        }
    }

    fn char_of(&self, byte: usize) -> usize {
        self.starts.partition_point(|&b| b < byte)
    }

    fn byte_of(&self, ch: usize) -> usize {
        self.starts.get(ch).copied().unwrap_or(self.len)
    }

    fn char_len(&self, span: Span) -> usize {
        self.char_of(span.end) - self.char_of(span.start)
    }
}

/// Chunk a validated note.
pub fn chunk_note(note: &Note, params: &ChunkParams) -> Vec<Chunk> {
    chunk_text(&note.id, &note.content, params)
}

/// Split `text` into chunks for note `note_id`.
///
/// # Guarantees
///
/// - At least one chunk is returned, even for blank text.
/// - Indices are contiguous: `0, 1, …, N-1`.
/// - Text shorter than `chunk_size` yields exactly one chunk.
/// - Output depends only on the arguments.
pub fn chunk_text(note_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    let chunk_size = params.chunk_size.max(1);
    let index = CharIndex::new(text);

    let mut units = Vec::new();
    for para in paragraph_spans(text) {
        if index.char_len(para) <= chunk_size {
            units.push(para);
            continue;
        }
        for sentence in sentence_spans(text, para) {
            if index.char_len(sentence) <= chunk_size {
                units.push(sentence);
            } else {
                units.extend(hard_cut(&index, sentence, chunk_size));
            }
        }
    }

    if units.is_empty() {
        let trimmed = text.trim();
        let start = text.len() - text.trim_start().len();
        let span = Span {
            start,
            end: start + trimmed.len(),
        };
        return vec![make_chunk(note_id, 0, text, &index, span)];
    }

    let segments = pack(&index, &units, chunk_size);

    let mut chunks = Vec::with_capacity(segments.len());
    for (i, seg) in segments.iter().enumerate() {
        let start = if i == 0 || params.overlap == 0 {
            seg.start
        } else {
            overlap_start(text, &index, segments[i - 1], *seg, params.overlap)
        };
        let span = Span {
            start,
            end: seg.end,
        };
        chunks.push(make_chunk(note_id, i, text, &index, span));
    }
    chunks
}

/// Hash identifying a note's indexable state.
///
/// Covers title, content, tags, and the chunking parameters, so that a
/// change to any of them causes the note to be re-chunked and re-embedded.
pub fn note_content_hash(note: &Note, params: &ChunkParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(note.title.as_bytes());
    hasher.update([0u8]);
    hasher.update(note.content.as_bytes());
    hasher.update([0u8]);
    for tag in &note.tags {
        hasher.update(tag.as_bytes());
        hasher.update([0x1f]);
    }
    hasher.update([0u8]);
    hasher.update((params.chunk_size as u64).to_le_bytes());
    hasher.update((params.overlap as u64).to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id.
pub fn chunk_id(note_id: &str, index: usize, text_hash: &str) -> String {
    let name = format!("{}\u{0}{}\u{0}{}", note_id, index, text_hash);
    Uuid::new_v5(&CHUNK_ID_NAMESPACE, name.as_bytes()).to_string()
}

/// Runs of non-blank lines, trimmed of surrounding whitespace.
fn paragraph_spans(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut current: Option<Span> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        if line.trim().is_empty() {
            if let Some(span) = current.take() {
                spans.push(span);
            }
            continue;
        }

        let lead = line.len() - line.trim_start().len();
        let end = line_start + line.trim_end().len();
        match current.as_mut() {
            Some(span) => span.end = end,
            None => {
                current = Some(Span {
                    start: line_start + lead,
                    end,
                })
            }
        }
    }

    if let Some(span) = current {
        spans.push(span);
    }
    spans
}

/// Sentence spans inside `para`.
///
/// A sentence ends after `.`, `!`, or `?` (plus any closing quotes or
/// brackets) when the next char is whitespace.
fn sentence_spans(text: &str, para: Span) -> Vec<Span> {
    let body = &text[para.start..para.end];
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut chars = body.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if matches!(next, '"' | '\'' | ')' | ']' | '”' | '’' | '»') {
                end = j + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let at_break = match chars.peek() {
            Some(&(_, next)) => next.is_whitespace(),
            None => false,
        };
        if !at_break {
            continue;
        }
        push_trimmed(&mut spans, body, para.start, start, end);
        while let Some(&(j, next)) = chars.peek() {
            if next.is_whitespace() {
                chars.next();
                start = j + next.len_utf8();
            } else {
                break;
            }
        }
    }
    push_trimmed(&mut spans, body, para.start, start, body.len());
    spans
}

fn push_trimmed(spans: &mut Vec<Span>, body: &str, base: usize, start: usize, end: usize) {
    if start >= end {
        return;
    }
    let piece = &body[start..end];
    let trimmed = piece.trim();
    if trimmed.is_empty() {
        return;
    }
    let lead = piece.len() - piece.trim_start().len();
    spans.push(Span {
        start: base + start + lead,
        end: base + start + lead + trimmed.len(),
    });
}

/// Cut `span` into pieces of exactly `width` chars (the last may be shorter).
fn hard_cut(index: &CharIndex, span: Span, width: usize) -> Vec<Span> {
    let first = index.char_of(span.start);
    let last = index.char_of(span.end);
    let mut pieces = Vec::new();
    let mut ch = first;
    while ch < last {
        let next = (ch + width).min(last);
        pieces.push(Span {
            start: index.byte_of(ch),
            end: index.byte_of(next),
        });
        ch = next;
    }
    pieces
}

/// Greedily merge consecutive units while the merged span fits.
fn pack(index: &CharIndex, units: &[Span], chunk_size: usize) -> Vec<Span> {
    let mut segments = Vec::new();
    let mut current: Option<Span> = None;

    for unit in units {
        current = match current {
            None => Some(*unit),
            Some(seg) => {
                let merged = Span {
                    start: seg.start,
                    end: unit.end,
                };
                if index.char_len(merged) <= chunk_size {
                    Some(merged)
                } else {
                    segments.push(seg);
                    Some(*unit)
                }
            }
        };
    }
    if let Some(seg) = current {
        segments.push(seg);
    }
    segments
}

/// Start of the overlap prefix for `seg`, taken from the tail of `prev`.
fn overlap_start(text: &str, index: &CharIndex, prev: Span, seg: Span, overlap: usize) -> usize {
    let seg_char = index.char_of(seg.start);
    let floor = index.char_of(prev.start);
    let want = seg_char.saturating_sub(overlap).max(floor);
    let mut start = index.byte_of(want);
    if start >= seg.start {
        return seg.start;
    }

    // Avoid starting mid-word: skip to the next word start when possible.
    let at_word_start = start == prev.start
        || text[..start]
            .chars()
            .next_back()
            .map(|c| c.is_whitespace())
            .unwrap_or(true);
    if !at_word_start {
        if let Some(ws) = text[start..seg.start].find(char::is_whitespace) {
            start += ws;
        }
    }
    let window = &text[start..seg.start];
    let skipped = window.len() - window.trim_start().len();
    start += skipped;
    start.min(seg.start)
}

fn make_chunk(note_id: &str, idx: usize, text: &str, index: &CharIndex, span: Span) -> Chunk {
    let body = &text[span.start..span.end];
    let hash = hash_text(body);
    Chunk {
        id: chunk_id(note_id, idx, &hash),
        note_id: note_id.to_string(),
        position: ChunkPosition {
            index: idx,
            char_start: index.char_of(span.start),
            char_end: index.char_of(span.end),
        },
        text: body.to_string(),
        hash,
    }
}
