//! Segmentation of extracted text into ordered chunks.
//!
//! Chunks are contiguous slices of the source text. Offsets are character
//! (not byte) positions, strictly increasing and non-overlapping. Boundaries
//! prefer page and paragraph breaks, then line breaks, then sentence ends,
//! then any whitespace; a run with no whitespace is cut hard at the target
//! size.

use uuid::Uuid;

use docket_core::{chunk_id, defaults, Chunk};

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkerConfig {
    /// Preferred chunk length in characters.
    pub target_size: usize,
    /// Breaks closer than this to the chunk start are ignored, and a trailing
    /// remainder shorter than this is folded into the last chunk.
    pub min_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_size: defaults::CHUNK_SIZE,
            min_size: defaults::CHUNK_MIN_SIZE,
        }
    }
}

impl ChunkerConfig {
    pub fn new(target_size: usize, min_size: usize) -> Self {
        let target_size = target_size.max(1);
        Self {
            target_size,
            min_size: min_size.min(target_size / 2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextChunker {
    config: ChunkerConfig,
}

/// Break quality after position `i`; higher is better.
fn break_rank(chars: &[char], i: usize) -> Option<u8> {
    let c = chars[i];
    let prev = i.checked_sub(1).map(|p| chars[p]);
    if c == defaults::PAGE_BREAK || (c == '\n' && prev == Some('\n')) {
        Some(3)
    } else if c == '\n' {
        Some(2)
    } else if c.is_whitespace() && matches!(prev, Some('.' | '?' | '!' | ';')) {
        Some(1)
    } else if c.is_whitespace() {
        Some(0)
    } else {
        None
    }
}

impl TextChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Character ranges of each chunk, before whitespace-only chunks are dropped.
    fn ranges(&self, chars: &[char]) -> Vec<(usize, usize)> {
        let n = chars.len();
        let target = self.config.target_size.max(1);
        let min = self.config.min_size;
        let mut ranges = Vec::new();
        let mut start = 0;

        while start < n {
            if n - start <= target + min {
                ranges.push((start, n));
                break;
            }
            let hi = start + target;
            let lo = (start + min).min(hi);
            let mut best: Option<(u8, usize)> = None;
            for i in (lo..hi).rev() {
                if let Some(rank) = break_rank(chars, i) {
                    if best.map_or(true, |(r, _)| rank > r) {
                        best = Some((rank, i));
                        if rank == 3 {
                            break;
                        }
                    }
                }
            }
            let end = best.map_or(hi, |(_, i)| i + 1);
            ranges.push((start, end));
            start = end;
        }
        ranges
    }

    /// Split `text` into chunks with ids stable for a given document and text.
    pub fn chunk(&self, document_id: Uuid, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        self.ranges(&chars)
            .into_iter()
            .filter_map(|(start, end)| {
                let slice: String = chars[start..end].iter().collect();
                (!slice.trim().is_empty()).then_some((start, end, slice))
            })
            .enumerate()
            .map(|(index, (start, end, text))| Chunk {
                id: chunk_id(document_id, index),
                document_id,
                chunk_index: index,
                start_offset: start,
                end_offset: end,
                text,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(target: usize, min: usize) -> TextChunker {
        TextChunker::new(ChunkerConfig::new(target, min))
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let doc = Uuid::new_v4();
        let chunks = chunker(1000, 100).chunk(doc, "A short complaint.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 18);
        assert_eq!(chunks[0].id, chunk_id(doc, 0));
    }

    #[test]
    fn test_offsets_are_monotonic_and_cover_text() {
        let text = "The plaintiff alleges breach. ".repeat(200);
        let chunks = chunker(300, 50).chunk(Uuid::new_v4(), &text);
        assert!(chunks.len() > 1);

        let mut expected_start = 0;
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert_eq!(c.start_offset, expected_start);
            assert!(c.end_offset > c.start_offset);
            assert!(c.end_offset - c.start_offset <= 350);
            expected_start = c.end_offset;
        }
        assert_eq!(expected_start, text.chars().count());
        let rebuilt: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn test_prefers_page_breaks() {
        let page = "x".repeat(60);
        let text = format!("{page} {page}\u{000C}{page} {page}");
        let chunks = chunker(150, 10).chunk(Uuid::new_v4(), &text);
        assert!(chunks[0].text.ends_with('\u{000C}'));
    }

    #[test]
    fn test_sentence_end_beats_plain_space() {
        let text = format!("{}. {} {}", "a".repeat(40), "b".repeat(30), "c".repeat(60));
        let chunks = chunker(100, 10).chunk(Uuid::new_v4(), &text);
        assert!(chunks[0].text.ends_with(". "));
    }

    #[test]
    fn test_hard_cut_without_whitespace() {
        let text = "z".repeat(250);
        let chunks = chunker(100, 10).chunk(Uuid::new_v4(), &text);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].end_offset, 100);
    }

    #[test]
    fn test_char_offsets_with_multibyte_text() {
        let text = "Señor Muñoz demanda. ".repeat(30);
        let chunks = chunker(100, 10).chunk(Uuid::new_v4(), &text);
        for c in &chunks {
            let slice: String = text
                .chars()
                .skip(c.start_offset)
                .take(c.end_offset - c.start_offset)
                .collect();
            assert_eq!(slice, c.text);
        }
    }

    #[test]
    fn test_deterministic() {
        let doc = Uuid::new_v4();
        let text = "Count one. Count two.\n\nCount three. ".repeat(50);
        let a = chunker(200, 20).chunk(doc, &text);
        let b = chunker(200, 20).chunk(doc, &text);
        assert_eq!(a, b);
    }
}
