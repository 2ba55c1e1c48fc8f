//! Splits documents into bounded, overlapping text fragments.
use crate::models::Document;

/// Turns a document into ordered fragments. Must be deterministic.
pub trait Chunker: Send + Sync {
    fn split(&self, document: &Document) -> Vec<String>;
}

/// Paragraph-first splitter measured in `char`s.
///
/// Paragraphs are packed up to `chunk_size`; oversized paragraphs are cut at
/// sentence boundaries. Each fragment after the first is prefixed with up to
/// `overlap` trailing characters of its predecessor.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    pub chunk_size: usize,
    pub overlap: usize,
    pub min_chunk_length: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, overlap: usize, min_chunk_length: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap: overlap.min(chunk_size.saturating_sub(1)),
            min_chunk_length,
        }
    }

    pub fn split_text(&self, content: &str) -> Vec<String> {
        let pieces: Vec<String> = split_into_chunks(content, self.chunk_size)
            .into_iter()
            .filter(|c| c.chars().count() >= self.min_chunk_length)
            .collect();

        if self.overlap == 0 || pieces.len() < 2 {
            return pieces;
        }

        let mut out = Vec::with_capacity(pieces.len());
        for (i, piece) in pieces.iter().enumerate() {
            if i == 0 {
                out.push(piece.clone());
                continue;
            }
            let tail = overlap_tail(&pieces[i - 1], self.overlap);
            if tail.is_empty() {
                out.push(piece.clone());
            } else {
                out.push(format!("{tail} {piece}"));
            }
        }
        out
    }
}

impl Chunker for TextSplitter {
    fn split(&self, document: &Document) -> Vec<String> {
        self.split_text(&document.text)
    }
}

/// Last `max_chars` characters of `text`, starting on a word boundary when one exists.
fn overlap_tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim();
    }
    let start = text
        .char_indices()
        .nth(count - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(ws) if ws + 1 < tail.len() => tail[ws..].trim(),
        _ => tail.trim(),
    }
}

/// Packs blank-line separated paragraphs into chunks of at most
/// `chunk_size` characters. Paragraphs that are too long on their own are
/// cut by [`split_large_paragraph`].
pub fn split_into_chunks(content: &str, chunk_size: usize) -> Vec<String> {
    let content = content.trim();
    if content.is_empty() {
        return Vec::new();
    }
    if content.chars().count() <= chunk_size {
        return vec![content.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for para in content.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let para_len = para.chars().count();

        if para_len > chunk_size {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            chunks.extend(split_large_paragraph(para, chunk_size));
            continue;
        }

        if current_len > 0 && current_len + 2 + para_len > chunk_size {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(para);
        current_len += para_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n' | '。' | '！' | '？')
}

/// Cuts `para` into pieces of at most `chunk_size` characters.
///
/// Each cut lands just after the last sentence end in the second half of
/// the window, or at exactly `chunk_size` characters when there is none.
fn split_large_paragraph(para: &str, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut pieces = Vec::new();
    let mut rest = para.trim();

    while !rest.is_empty() {
        // One extra boundary tells whether the rest fits and where a full window ends
        let window: Vec<(usize, char)> = rest.char_indices().take(chunk_size + 1).collect();
        if window.len() <= chunk_size {
            pieces.push(rest.to_string());
            break;
        }

        let cut = (chunk_size / 2..chunk_size)
            .rev()
            .find(|&i| is_sentence_end(window[i].1))
            .map_or(chunk_size, |i| i + 1);
        let (piece, tail) = rest.split_at(window[cut].0);

        let piece = piece.trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        rest = tail.trim_start();
    }

    pieces
}
