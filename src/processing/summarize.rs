//! Document summarization stage.
//!
//! Abstractive summaries come from the provider router. When routing fails the stage falls back
//! to an extractive summary (leading sentences within the word budget) so that indexing still
//! succeeds.

use super::types::{Chunk, DocumentSummary, SummaryStrategy};
use crate::providers::{GenerationRequest, ProviderRequest, ProviderResponse, ProviderRouter};

/// Build the abstractive summarization prompt from ordered chunks.
pub(crate) fn build_abstractive_prompt(
    document_id: &str,
    chunks: &[Chunk],
    max_words: usize,
) -> String {
    let mut prompt = format!(
        "System: You summarize documents into one concise, factual paragraph. Avoid speculation. \
         Return at most {max_words} words.\n\nSummarize the document '{document_id}':\n\n"
    );
    for text in distinct_texts(chunks) {
        prompt.push_str(text.trim());
        prompt.push('\n');
    }
    prompt
}

/// Leading sentences of the document, stopping before `max_words` would be exceeded.
pub(crate) fn build_extractive_summary(chunks: &[Chunk], max_words: usize) -> String {
    let text: String = distinct_texts(chunks).collect();
    let mut summary = Vec::new();
    let mut used_words = 0usize;

    for sentence in sentences(&text) {
        let words = sentence.split_whitespace().count();
        if words == 0 {
            continue;
        }
        if !summary.is_empty() && used_words + words > max_words {
            break;
        }
        if summary.is_empty() && words > max_words {
            let clipped: Vec<&str> = sentence.split_whitespace().take(max_words).collect();
            summary.push(format!("{}…", clipped.join(" ")));
            break;
        }
        used_words += words;
        summary.push(sentence.to_string());
    }

    if summary.is_empty() {
        return "No content available to summarize.".into();
    }
    summary.join(" ")
}

/// Chunk texts with the overlapping prefix of every chunk after the first removed.
fn distinct_texts(chunks: &[Chunk]) -> impl Iterator<Item = &str> {
    chunks.iter().map(|chunk| {
        let skip = chunk
            .text
            .char_indices()
            .nth(chunk.overlap)
            .map_or(chunk.text.len(), |(offset, _)| offset);
        &chunk.text[skip..]
    })
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
}

/// Summarize a document, preferring the router and falling back to extraction.
pub(crate) async fn summarize_document(
    router: Option<&ProviderRouter>,
    document_id: &str,
    chunks: &[Chunk],
    max_words: usize,
) -> DocumentSummary {
    if let Some(router) = router {
        let mut request =
            GenerationRequest::new(build_abstractive_prompt(document_id, chunks, max_words));
        request.max_tokens = Some(u32::try_from(max_words * 2).unwrap_or(u32::MAX));
        match router.route(ProviderRequest::Generate(request)).await {
            Ok(routed) => match routed.response {
                ProviderResponse::Text(text) if !text.trim().is_empty() => {
                    return DocumentSummary {
                        document_id: document_id.to_string(),
                        text,
                        strategy: SummaryStrategy::Abstractive,
                        provider: routed.decision.served_by,
                    };
                }
                _ => {
                    tracing::warn!(document_id, "Empty abstractive summary; using extractive")
                }
            },
            Err(error) => {
                tracing::warn!(
                    document_id,
                    error = %error,
                    "Abstractive summarization failed; falling back to extractive"
                );
            }
        }
    }

    DocumentSummary {
        document_id: document_id.to_string(),
        text: build_extractive_summary(chunks, max_words),
        strategy: SummaryStrategy::Extractive,
        provider: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::chunking::chunk_text;

    #[test]
    fn extractive_summary_respects_word_budget() {
        let text = "Rust has ownership. Borrowing is checked. Lifetimes are inferred mostly.";
        let chunks = chunk_text("doc", text, 30, 5).unwrap();
        let summary = build_extractive_summary(&chunks, 6);
        assert_eq!(summary, "Rust has ownership. Borrowing is checked.");
    }

    #[test]
    fn overlap_is_not_repeated() {
        let text = "One two three. Four five six.";
        let chunks = chunk_text("doc", text, 10, 4).unwrap();
        let rebuilt: String = distinct_texts(&chunks).collect();
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn long_first_sentence_is_clipped() {
        let chunks = chunk_text("doc", "a b c d e f g h", 100, 0).unwrap();
        assert_eq!(build_extractive_summary(&chunks, 3), "a b c…");
    }

    #[test]
    fn prompt_names_document_and_budget() {
        let chunks = chunk_text("doc-7", "Body text.", 100, 0).unwrap();
        let prompt = build_abstractive_prompt("doc-7", &chunks, 40);
        assert!(prompt.contains("doc-7"));
        assert!(prompt.contains("at most 40 words"));
        assert!(prompt.contains("Body text."));
    }

    #[tokio::test]
    async fn without_router_summary_is_extractive() {
        let chunks = chunk_text("doc", "Only sentence.", 100, 0).unwrap();
        let summary = summarize_document(None, "doc", &chunks, 10).await;
        assert_eq!(summary.strategy, SummaryStrategy::Extractive);
        assert_eq!(summary.text, "Only sentence.");
        assert!(summary.provider.is_none());
    }
}
