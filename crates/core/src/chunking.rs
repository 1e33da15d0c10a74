use crate::error::RagError;
use crate::extractor::PageText;
use crate::models::RagOptions;
use std::collections::VecDeque;

/// Split boundaries in priority order: paragraph, line, sentence, clause, word, character.
pub const SEPARATORS: [&str; 10] = ["\n\n", "\n", ". ", "! ", "? ", "; ", ": ", ", ", " ", ""];

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl From<&RagOptions> for ChunkingConfig {
    fn from(value: &RagOptions) -> Self {
        Self {
            chunk_size: value.chunk_size,
            overlap: value.chunk_overlap,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), RagError> {
        if self.chunk_size == 0 || self.overlap >= self.chunk_size {
            return Err(RagError::InvalidArgument(format!(
                "invalid chunking config: size={} overlap={}",
                self.chunk_size, self.overlap
            )));
        }
        Ok(())
    }
}

/// A chunk before deduplication, tagged with its page and position in the document.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChunk {
    pub page: u32,
    pub sequence: u64,
    pub text: String,
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Splits one cleaned text into chunks of at most `chunk_size` characters.
///
/// The largest boundary present in the text is tried first; pieces still longer than the
/// target are split again at the next boundary down. Adjacent chunks share up to `overlap`
/// characters of whole pieces.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<String> {
    split_recursive(text, &SEPARATORS, config)
}

fn split_recursive(text: &str, separators: &[&str], config: ChunkingConfig) -> Vec<String> {
    let position = separators
        .iter()
        .position(|separator| separator.is_empty() || text.contains(separator))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let lower = separators.get(position + 1..).unwrap_or(&[]);

    let pieces: Vec<&str> = if separator.is_empty() {
        text.char_indices()
            .map(|(start, ch)| &text[start..start + ch.len_utf8()])
            .collect()
    } else {
        text.split_inclusive(separator).collect()
    };

    let mut chunks = Vec::new();
    let mut fitting = Vec::new();
    for piece in pieces {
        if char_len(piece) <= config.chunk_size {
            fitting.push(piece);
            continue;
        }

        if !fitting.is_empty() {
            chunks.extend(merge_pieces(&fitting, config));
            fitting.clear();
        }

        if lower.is_empty() {
            let trimmed = piece.trim();
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
        } else {
            chunks.extend(split_recursive(piece, lower, config));
        }
    }

    if !fitting.is_empty() {
        chunks.extend(merge_pieces(&fitting, config));
    }

    chunks
}

fn merge_pieces(pieces: &[&str], config: ChunkingConfig) -> Vec<String> {
    let mut merged = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let length = char_len(piece);
        if total + length > config.chunk_size && !window.is_empty() {
            push_joined(&mut merged, &window);

            while total > config.overlap || (total + length > config.chunk_size && total > 0) {
                match window.pop_front() {
                    Some(dropped) => total -= char_len(dropped),
                    None => break,
                }
            }
        }

        window.push_back(piece);
        total += length;
    }

    push_joined(&mut merged, &window);
    merged
}

fn push_joined(target: &mut Vec<String>, window: &VecDeque<&str>) {
    let joined = window.iter().copied().collect::<String>();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        target.push(trimmed.to_string());
    }
}

/// Chunks every page separately so each chunk keeps its originating page number.
pub fn chunk_pages(pages: &[PageText], config: ChunkingConfig) -> Vec<RawChunk> {
    let mut sequence = 0u64;
    let mut chunks = Vec::new();

    for page in pages {
        for text in split_text(&page.text, config) {
            chunks.push(RawChunk {
                page: page.number,
                sequence,
                text,
            });
            sequence = sequence.saturating_add(1);
        }
    }

    chunks
}
