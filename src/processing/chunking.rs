//! Deterministic fixed-window chunking with overlap.
//!
//! Windows are measured in characters (Unicode scalar values). Each window starts
//! `max_size - overlap` characters after the previous one, so consecutive chunks share exactly
//! `overlap` characters and together cover the whole text without gaps. The last window may be
//! shorter. Chunk identifiers hash the document reference, both parameters, and the ordinal, so
//! re-running the same document with the same parameters reproduces the same keys.

use super::types::{Chunk, ChunkingError};
use sha2::{Digest, Sha256};

/// Reject parameters that cannot make progress.
pub fn validate_params(max_size: usize, overlap: usize) -> Result<(), ChunkingError> {
    if max_size == 0 {
        return Err(ChunkingError::ZeroSize);
    }
    if overlap >= max_size {
        return Err(ChunkingError::OverlapTooLarge { overlap, max_size });
    }
    Ok(())
}

/// Stable chunk identifier.
pub fn chunk_id(document_id: &str, max_size: usize, overlap: usize, ordinal: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0]);
    hasher.update(max_size.to_le_bytes());
    hasher.update(overlap.to_le_bytes());
    hasher.update(ordinal.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Split `text` into ordered, overlapping chunks.
///
/// Empty text yields no chunks.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, ChunkingError> {
    validate_params(max_size, overlap)?;

    // Byte offset of every char boundary, plus the end of the string.
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(offset, _)| offset)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = boundaries.len() - 1;
    if total == 0 {
        return Ok(Vec::new());
    }

    let step = max_size - overlap;
    let mut chunks = Vec::with_capacity(total.div_ceil(step));
    let mut start = 0;
    loop {
        let end = (start + max_size).min(total);
        let ordinal = chunks.len();
        chunks.push(Chunk {
            id: chunk_id(document_id, max_size, overlap, ordinal),
            document_id: document_id.to_string(),
            ordinal,
            start,
            end,
            overlap: if ordinal == 0 { 0 } else { overlap },
            text: text[boundaries[start]..boundaries[end]].to_string(),
        });
        if end == total {
            break;
        }
        start += step;
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_chunk_document_has_expected_offsets() {
        let text = "a".repeat(240);
        let chunks = chunk_text("doc", &text, 100, 20).unwrap();
        let spans: Vec<_> = chunks.iter().map(|chunk| (chunk.start, chunk.end)).collect();
        assert_eq!(spans, vec![(0, 100), (80, 180), (160, 240)]);
        assert_eq!(chunks[0].overlap, 0);
        assert_eq!(chunks[1].overlap, 20);
        assert_eq!(
            chunks.iter().map(|chunk| chunk.ordinal).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn covers_text_without_gaps_for_many_parameters() {
        let text: String = (0..537).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        for max_size in [1, 2, 7, 50, 100, 600] {
            for overlap in [0, 1, 3, 49] {
                if overlap >= max_size {
                    continue;
                }
                let chunks = chunk_text("doc", &text, max_size, overlap).unwrap();
                assert_eq!(chunks.first().unwrap().start, 0);
                assert_eq!(chunks.last().unwrap().end, 537);
                for pair in chunks.windows(2) {
                    assert_eq!(pair[0].end - pair[1].start, overlap);
                    assert_eq!(pair[0].end - pair[0].start, max_size);
                }
                for chunk in &chunks {
                    assert_eq!(chunk.text, text[chunk.start..chunk.end]);
                }
            }
        }
    }

    #[test]
    fn offsets_count_characters_not_bytes() {
        let text = "héllo wörld";
        let chunks = chunk_text("doc", text, 5, 1).unwrap();
        assert_eq!(chunks[0].text, "héllo");
        assert_eq!(chunks[1].text, "o wör");
        assert_eq!(chunks.last().unwrap().end, text.chars().count());
    }

    #[test]
    fn identical_input_yields_identical_ids() {
        let first = chunk_text("doc", "some text to split", 5, 2).unwrap();
        let second = chunk_text("doc", "some text to split", 5, 2).unwrap();
        assert_eq!(first, second);

        let other = chunk_text("doc", "some text to split", 6, 2).unwrap();
        assert_ne!(first[0].id, other[0].id);
    }

    #[test]
    fn empty_text_is_not_an_error() {
        assert!(chunk_text("doc", "", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert_eq!(chunk_text("doc", "x", 0, 0), Err(ChunkingError::ZeroSize));
        assert_eq!(
            chunk_text("doc", "x", 10, 10),
            Err(ChunkingError::OverlapTooLarge {
                overlap: 10,
                max_size: 10
            })
        );
    }
}
