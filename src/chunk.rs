//! Text chunking for embedding.
//!
//! Long posts are cut into [`Chunk`]s so every provider request stays under
//! its input limit. Text is first broken into paragraph pieces, oversized
//! paragraphs are cut at the last whitespace that fits, then pieces are
//! packed greedily up to the size limit.
//!
//! Chunk vectors are averaged back into one vector per item by
//! [`crate::embedding::mean_vector`].

/// Rough conversion from the configured token budget to bytes.
const BYTES_PER_TOKEN: usize = 4;

const PARAGRAPH_BREAK: &str = "\n\n";

/// One embeddable slice of an item's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Content hash of the post or media item the chunk belongs to.
    pub item: String,
    pub index: usize,
    pub text: String,
}

/// Split `text` into chunks of at most `max_tokens` (approximately).
///
/// Indices are contiguous from 0. Empty text still yields one empty chunk;
/// the embedding stage filters such items out before chunking.
pub fn chunk_text(item: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let limit = max_tokens.max(1) * BYTES_PER_TOKEN;

    let pieces = text
        .split(PARAGRAPH_BREAK)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .flat_map(|p| split_oversized(p, limit));

    let mut packed: Vec<String> = Vec::new();
    for piece in pieces {
        match packed.last_mut() {
            Some(last) if last.len() + PARAGRAPH_BREAK.len() + piece.len() <= limit => {
                last.push_str(PARAGRAPH_BREAK);
                last.push_str(piece);
            }
            _ => packed.push(piece.to_string()),
        }
    }

    if packed.is_empty() {
        packed.push(String::new());
    }

    packed
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            item: item.to_string(),
            index,
            text,
        })
        .collect()
}

/// Cut a paragraph into slices no longer than `limit` bytes, preferring to
/// end each slice after a newline or space.
fn split_oversized(paragraph: &str, limit: usize) -> Vec<&str> {
    let mut slices = Vec::new();
    let mut rest = paragraph;

    while rest.len() > limit {
        let window = &rest[..char_floor(rest, limit)];
        let cut = window
            .rfind(|c: char| c == '\n' || c == ' ')
            .map(|pos| pos + 1)
            .unwrap_or(window.len());
        let slice = rest[..cut].trim();
        if !slice.is_empty() {
            slices.push(slice);
        }
        rest = &rest[cut..];
    }

    let tail = rest.trim();
    if !tail.is_empty() {
        slices.push(tail);
    }
    slices
}

/// Largest char boundary `<= max`, never 0 for non-empty `s`.
fn char_floor(s: &str, max: usize) -> usize {
    let mut idx = max.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    if idx == 0 {
        // First char alone is wider than the limit
        s.chars().next().map_or(s.len(), char::len_utf8)
    } else {
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("h1", "A short note.", 700);
        assert_eq!(
            chunks,
            vec![Chunk {
                item: "h1".into(),
                index: 0,
                text: "A short note.".into(),
            }]
        );
    }

    #[test]
    fn blank_text_yields_one_empty_chunk() {
        let chunks = chunk_text("h1", "  \n\n  ", 700);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.is_empty());
    }

    #[test]
    fn paragraphs_pack_until_full() {
        // limit = 3 tokens * 4 = 12 bytes
        let chunks = chunk_text("h1", "aaaa\n\nbbbb\n\ncccc", 3);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["aaaa\n\nbbbb", "cccc"]);
        assert_eq!(chunks[1].index, 1);
    }

    #[test]
    fn long_paragraph_breaks_at_spaces() {
        let text = "lorem ipsum ".repeat(40);
        let chunks = chunk_text("h1", &text, 5);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 20);
            assert!(!chunk.text.starts_with(' '));
        }
        let words: usize = chunks.iter().map(|c| c.text.split_whitespace().count()).sum();
        assert_eq!(words, 80);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "é".repeat(64);
        let chunks = chunk_text("h1", &text, 2);
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
        assert!(chunks.iter().all(|c| c.text.len() <= 8));
    }
}
