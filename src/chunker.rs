//! Reply chunking for the mesh's small frame size.
//!
//! Long replies are split into byte-bounded chunks, preferring sentence
//! endings, then whitespace, then a hard character-boundary cut. Multi-chunk
//! replies carry a `[i/N] ` progress tag inside the byte budget; stripping
//! the tags and concatenating the chunks reproduces the input exactly.

use std::sync::OnceLock;

use regex::Regex;

/// One bounded fragment of a reply, ready for downlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position within the reply.
    pub index: usize,
    /// Total number of chunks in the reply.
    pub total: usize,
    /// Transmitted text, progress tag included. Byte length ≤ the limit.
    pub text: String,
}

fn sentence_end() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]\s+").expect("static regex"))
}

/// Split `text` into chunks of at most `max_bytes` bytes each.
///
/// A reply that fits in one chunk is passed through untouched (no tag).
pub fn chunk_text(text: &str, max_bytes: usize) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() <= max_bytes {
        return vec![Chunk {
            index: 0,
            total: 1,
            text: text.to_string(),
        }];
    }

    // Tags shrink the per-chunk text budget; their width depends on the
    // final chunk count, so widen the reservation until it fits.
    let mut reserve = 8; // "[xx/xx] "
    loop {
        let budget = max_bytes.saturating_sub(reserve).max(1);
        let segments = split_at_boundaries(text, budget);
        let digits = segments.len().to_string().len();
        if 2 * digits + 4 <= reserve {
            let total = segments.len();
            return segments
                .into_iter()
                .enumerate()
                .map(|(index, seg)| Chunk {
                    index,
                    total,
                    text: format!("[{}/{}] {}", index + 1, total, seg),
                })
                .collect();
        }
        reserve += 2;
    }
}

/// Partition `text` into segments of at most `budget` bytes, breaking at the
/// last sentence end inside the window, else the last whitespace, else hard
/// at the window edge. The segments concatenate back to `text` exactly.
fn split_at_boundaries(text: &str, budget: usize) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut rest = text;

    while rest.len() > budget {
        let mut window_end = floor_char_boundary(rest, budget);
        if window_end == 0 {
            // Budget smaller than the first character; take it anyway.
            window_end = rest
                .char_indices()
                .nth(1)
                .map_or(rest.len(), |(i, _)| i);
        }
        let window = &rest[..window_end];

        let cut = sentence_end()
            .find_iter(window)
            .last()
            .map(|m| m.end())
            .or_else(|| {
                window
                    .char_indices()
                    .rev()
                    .find(|(_, c)| c.is_whitespace())
                    .map(|(i, c)| i + c.len_utf8())
            })
            .filter(|&c| c > 0)
            .unwrap_or(window_end);

        segments.push(&rest[..cut]);
        rest = &rest[cut..];
    }

    if !rest.is_empty() {
        segments.push(rest);
    }
    segments
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Chunk text with the progress tag stripped.
    fn payload(chunk: &Chunk) -> &str {
        if chunk.total == 1 {
            return &chunk.text;
        }
        let tag = format!("[{}/{}] ", chunk.index + 1, chunk.total);
        &chunk.text[tag.len()..]
    }

    fn reassemble(chunks: &[Chunk]) -> String {
        chunks.iter().map(payload).collect()
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", 180).is_empty());
    }

    #[test]
    fn short_reply_passes_through_untagged() {
        let chunks = chunk_text("Hi there!", 180);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].total, 1);
        assert_eq!(chunks[0].text, "Hi there!");
    }

    #[test]
    fn breaks_at_sentence_boundary() {
        let text = "This is sentence one. This is sentence two.";
        let chunks = chunk_text(text, 30);
        assert_eq!(chunks.len(), 2);
        assert_eq!(payload(&chunks[0]), "This is sentence one. ");
        assert_eq!(payload(&chunks[1]), "This is sentence two.");
    }

    #[test]
    fn tight_limit_breaks_at_word_boundaries() {
        let text = "This is sentence one. This is sentence two.";
        let chunks = chunk_text(text, 20);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 20, "oversized chunk: {:?}", chunk.text);
        }
        // No mid-word breaks: every non-final fragment ends on whitespace.
        for chunk in &chunks[..chunks.len() - 1] {
            assert!(
                payload(chunk).ends_with(char::is_whitespace),
                "mid-word break: {:?}",
                payload(chunk)
            );
        }
        assert_eq!(reassemble(&chunks), text);
    }

    #[test]
    fn concatenation_reproduces_input_exactly() {
        let text = "A longer reply. It has several sentences! Does it survive chunking? \
                    Yes, every byte of it, whitespace included.  Even doubled spaces.";
        for limit in [24, 40, 80, 180] {
            let chunks = chunk_text(text, limit);
            assert_eq!(reassemble(&chunks), text, "limit {limit}");
        }
    }

    #[test]
    fn indices_are_contiguous_and_totals_consistent() {
        let text = "word ".repeat(100);
        let chunks = chunk_text(&text, 40);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.total, chunks.len());
        }
    }

    #[test]
    fn tags_count_against_the_byte_limit() {
        let text = "word ".repeat(100);
        for limit in [20, 60, 180] {
            for chunk in chunk_text(&text, limit) {
                assert!(chunk.text.len() <= limit);
            }
        }
    }

    #[test]
    fn unbroken_text_hard_breaks() {
        let text = "a".repeat(500);
        let chunks = chunk_text(&text, 100);
        assert!(chunks.len() > 1);
        assert_eq!(reassemble(&chunks), text);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 100);
        }
    }

    #[test]
    fn multibyte_text_never_splits_a_character() {
        let text = "🦀".repeat(12); // 4 bytes per crab
        let chunks = chunk_text(&text, 14);
        assert_eq!(reassemble(&chunks), text);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 14);
            assert!(payload(chunk).chars().all(|c| c == '🦀'));
        }
    }

    #[test]
    fn progress_tags_are_one_based_over_total() {
        let text = "one two three four five six seven eight nine ten";
        let chunks = chunk_text(&text, 20);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.text.starts_with(&format!("[{}/{}] ", i + 1, total)));
        }
    }
}
