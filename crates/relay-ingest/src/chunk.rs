/// Recursive character splitter: tries to break on paragraph, then line,
/// then word boundaries before falling back to a hard cut, matching the
/// spec's black-box chunking contract (size 300 tokens-equivalent, overlap
/// 50). Token counts aren't tracked precisely here; ~4 characters per token
/// is the usual rule of thumb, so 300 tokens -> ~1200 characters and 50
/// tokens -> ~200 characters of overlap.
const CHUNK_SIZE_CHARS: usize = 1200;
const CHUNK_OVERLAP_CHARS: usize = 200;
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
pub struct TextChunk {
    pub text: String,
    pub index: usize,
}

pub fn chunk_text(text: &str) -> Vec<TextChunk> {
    if text.is_empty() {
        return Vec::new();
    }
    let pieces = split_recursive(text, 0);
    let merged = merge_with_overlap(pieces);
    merged
        .into_iter()
        .enumerate()
        .filter(|(_, t)| !t.trim().is_empty())
        .map(|(index, text)| TextChunk { text, index })
        .collect()
}

fn split_recursive(text: &str, separator_idx: usize) -> Vec<String> {
    if text.chars().count() <= CHUNK_SIZE_CHARS {
        return vec![text.to_string()];
    }

    let Some(separator) = SEPARATORS.get(separator_idx) else {
        return hard_split(text);
    };

    if separator.is_empty() {
        return hard_split(text);
    }

    let parts: Vec<&str> = text.split(separator.as_str()).collect();
    if parts.len() == 1 {
        return split_recursive(text, separator_idx + 1);
    }

    let mut out = Vec::new();
    for part in parts {
        if part.chars().count() > CHUNK_SIZE_CHARS {
            out.extend(split_recursive(part, separator_idx + 1));
        } else if !part.is_empty() {
            out.push(part.to_string());
        }
    }
    out
}

fn hard_split(text: &str) -> Vec<String> {
    text.chars()
        .collect::<Vec<_>>()
        .chunks(CHUNK_SIZE_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

/// Greedily packs the recursively-split pieces back into `CHUNK_SIZE_CHARS`
/// windows, carrying `CHUNK_OVERLAP_CHARS` of trailing context forward into
/// the next chunk.
fn merge_with_overlap(pieces: Vec<String>) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if !current.is_empty() && current.chars().count() + piece.chars().count() > CHUNK_SIZE_CHARS {
            chunks.push(current.clone());
            let overlap: String = current
                .chars()
                .rev()
                .take(CHUNK_OVERLAP_CHARS)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            current = overlap;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&piece);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = chunk_text("a short email body");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
    }

    #[test]
    fn empty_text_has_no_chunks() {
        assert!(chunk_text("").is_empty());
    }

    #[test]
    fn long_text_splits_into_multiple_overlapping_chunks() {
        let paragraph = "word ".repeat(50);
        let long_text = std::iter::repeat(paragraph).take(20).collect::<Vec<_>>().join("\n\n");
        let chunks = chunk_text(&long_text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= CHUNK_SIZE_CHARS + CHUNK_OVERLAP_CHARS);
        }
    }
}
