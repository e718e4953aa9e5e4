//! Text chunking — split source text into overlapping passages.
//!
//! Splitting uses a recursive separator hierarchy (paragraph → line →
//! sentence → word → raw characters): text is atomized at the coarsest
//! separator that yields pieces within the size budget, then pieces are
//! greedily merged into chunks of at most `chunk_size` bytes, carrying
//! `chunk_overlap` bytes of trailing context into the next chunk. Chunks are
//! contiguous spans of the original text, so byte offsets (and therefore
//! page numbers) stay exact.

use serde::{Deserialize, Serialize};

/// Separator hierarchy, coarsest first. Pieces still oversized after the
/// last separator are cut at character boundaries.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Form feed marks a page break in PDF-extracted text.
const PAGE_BREAK: char = '\x0c';

#[derive(Clone, Copy, Debug)]
pub struct ChunkOptions {
    /// Target maximum chunk size in bytes.
    pub chunk_size: usize,
    /// Bytes of trailing context repeated at the start of the next chunk.
    pub chunk_overlap: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self { chunk_size: 1200, chunk_overlap: 150 }
    }
}

/// A chunk of source text with its display metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// 1-based page number of the chunk's first byte.
    pub page: usize,
    /// Position of this chunk within its source.
    pub ordinal: usize,
}

/// Contiguous byte range of the source text.
#[derive(Clone, Copy)]
struct Piece {
    start: usize,
    end: usize,
}

impl Piece {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Split `text` into overlapping chunks with page numbers and ordinals.
pub fn chunk_text(text: &str, opts: &ChunkOptions) -> Vec<Chunk> {
    let max = opts.chunk_size.max(1);
    let mut pieces = Vec::new();
    atomize(text, 0, 0, max, &mut pieces);

    let spans = merge(&pieces, max, opts.chunk_overlap);

    let mut chunks = Vec::with_capacity(spans.len());
    for span in spans {
        let body = &text[span.start..span.end];
        if body.trim().is_empty() {
            continue;
        }
        chunks.push(Chunk {
            text: body.to_string(),
            page: page_of(text, span.start),
            ordinal: chunks.len(),
        });
    }
    chunks
}

/// 1-based page number for a byte offset: one plus the page breaks before it.
fn page_of(text: &str, offset: usize) -> usize {
    1 + text[..offset].matches(PAGE_BREAK).count()
}

/// Recursively split `text[..]` (at absolute offset `base`) into pieces of at
/// most `max` bytes, preferring the coarsest separator that fits.
fn atomize(text: &str, base: usize, level: usize, max: usize, out: &mut Vec<Piece>) {
    if text.len() <= max {
        if !text.is_empty() {
            out.push(Piece { start: base, end: base + text.len() });
        }
        return;
    }

    if level >= SEPARATORS.len() {
        // Last resort: cut at character boundaries, never exceeding `max`.
        let mut start = 0;
        for (idx, c) in text.char_indices() {
            if idx - start + c.len_utf8() > max && idx > start {
                out.push(Piece { start: base + start, end: base + idx });
                start = idx;
            }
        }
        if start < text.len() {
            out.push(Piece { start: base + start, end: base + text.len() });
        }
        return;
    }

    let mut offset = 0;
    for part in text.split_inclusive(SEPARATORS[level]) {
        if part.len() <= max {
            out.push(Piece { start: base + offset, end: base + offset + part.len() });
        } else {
            atomize(part, base + offset, level + 1, max, out);
        }
        offset += part.len();
    }
}

/// Greedily merge consecutive pieces into spans of at most `max` bytes,
/// seeding each new span with trailing pieces totalling at most `overlap`
/// bytes from the previous one.
fn merge(pieces: &[Piece], max: usize, overlap: usize) -> Vec<Piece> {
    let mut spans: Vec<Piece> = Vec::new();
    let mut window: Vec<Piece> = Vec::new();
    let mut window_len = 0_usize;

    for &piece in pieces {
        if window_len + piece.len() > max && !window.is_empty() {
            spans.push(Piece { start: window[0].start, end: window[window.len() - 1].end });

            // Retain the overlap tail as the seed of the next span.
            let mut tail: Vec<Piece> = Vec::new();
            let mut tail_len = 0;
            for &p in window.iter().rev() {
                if tail_len + p.len() > overlap {
                    break;
                }
                tail_len += p.len();
                tail.push(p);
            }
            tail.reverse();
            window = tail;
            window_len = tail_len;
        }
        window.push(piece);
        window_len += piece.len();
    }

    if !window.is_empty() {
        let span = Piece { start: window[0].start, end: window[window.len() - 1].end };
        // The remainder may be pure overlap already covered by the last span.
        if spans.last().map_or(true, |prev| span.end > prev.end) {
            spans.push(span);
        }
    }
    spans
}
