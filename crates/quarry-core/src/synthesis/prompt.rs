use std::fmt::Write as _;

use quarry_llm::Message;
use quarry_memory::{MetadataValue, count_tokens};

use crate::retriever::RetrievedChunk;

pub const SYSTEM_PROMPT: &str = "You answer questions using only the numbered context passages \
provided by the user. Cite the passages that support each statement with their markers in square \
brackets, for example [1] or [2, 3]. Do not cite passages that are not listed. If the context does \
not contain the answer, say that you do not know.";

/// A chunk that made it into the prompt, with the marker it is cited by.
#[derive(Debug, Clone)]
pub struct PlacedChunk {
    pub marker: usize,
    pub item: RetrievedChunk,
}

#[derive(Debug)]
pub struct AssembledPrompt {
    pub messages: Vec<Message>,
    pub placed: Vec<PlacedChunk>,
    pub dropped: usize,
    pub tokens: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptTooLarge {
    pub required: usize,
    pub budget: usize,
}

fn format_seconds(total: f64) -> String {
    let total = total.max(0.0).floor();
    // Whole seconds in a transcript comfortably fit in u64.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let total = total as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

fn render_block(marker: usize, item: &RetrievedChunk) -> String {
    let p = &item.provenance;
    let mut header = format!("[{marker}] ");
    match &p.title {
        Some(title) => {
            let _ = write!(header, "{title} ({})", p.source_uri);
        }
        None => header.push_str(&p.source_uri),
    }
    if let Some(start) = p.metadata.start_seconds {
        let _ = write!(header, " at {}", format_seconds(start));
        if let Some(end) = p.metadata.end_seconds {
            let _ = write!(header, "-{}", format_seconds(end));
        }
    }
    if let Some(MetadataValue::Text(topic)) = p.metadata.extra.get("topic") {
        let _ = write!(header, " [topic: {topic}]");
    }
    format!("{header}\n{}", item.chunk.text)
}

fn render_user(blocks: &[String], query: &str) -> String {
    let mut out = String::from("Context:\n\n");
    for block in blocks {
        out.push_str(block);
        out.push_str("\n\n");
    }
    let _ = write!(out, "Question: {query}");
    out
}

/// Build the grounded prompt for `query` within `budget` tokens.
///
/// `items` must be in rank order. Whole chunks are dropped, lowest score first, until
/// the prompt fits; survivors keep their rank order and are numbered from 1.
///
/// # Errors
///
/// Returns [`PromptTooLarge`] when the instructions and the query alone exceed the
/// budget.
pub fn assemble(
    query: &str,
    items: Vec<RetrievedChunk>,
    budget: usize,
) -> Result<AssembledPrompt, PromptTooLarge> {
    let base = count_tokens(SYSTEM_PROMPT) + count_tokens(&render_user(&[], query));
    if base > budget {
        return Err(PromptTooLarge {
            required: base,
            budget,
        });
    }

    // The marker is a single token, so cost does not depend on the final numbering.
    let costs: Vec<usize> = items
        .iter()
        .map(|item| count_tokens(&render_block(1, item)))
        .collect();
    let mut keep = vec![true; items.len()];
    let mut total = base + costs.iter().sum::<usize>();

    let mut by_score: Vec<usize> = (0..items.len()).collect();
    // Lowest score first; among equals the later-ranked chunk goes first.
    by_score.sort_by(|&a, &b| items[a].score.total_cmp(&items[b].score).then(b.cmp(&a)));
    let mut dropped = 0;
    for idx in by_score {
        if total <= budget {
            break;
        }
        keep[idx] = false;
        total -= costs[idx];
        dropped += 1;
    }

    let placed: Vec<PlacedChunk> = items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, k)| k.then_some(item))
        .enumerate()
        .map(|(i, item)| PlacedChunk {
            marker: i + 1,
            item,
        })
        .collect();
    let blocks: Vec<String> = placed
        .iter()
        .map(|p| render_block(p.marker, &p.item))
        .collect();

    if dropped > 0 {
        tracing::debug!(dropped, kept = placed.len(), budget, "context trimmed to fit prompt budget");
    }

    Ok(AssembledPrompt {
        messages: vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(render_user(&blocks, query)),
        ],
        placed,
        dropped,
        tokens: total,
    })
}

#[cfg(test)]
mod tests {
    use quarry_memory::{Chunk, ChunkId, DocumentId, DocumentMetadata};

    use super::*;
    use crate::retriever::Provenance;

    fn item(doc: &str, position: usize, text: &str, score: f32) -> RetrievedChunk {
        let document_id = DocumentId::new(doc);
        RetrievedChunk {
            chunk: Chunk {
                id: ChunkId::derive(&document_id, position, text),
                document_id: document_id.clone(),
                text: text.into(),
                position,
                token_count: count_tokens(text),
                start_token: 0,
                overlap_tokens: 0,
                start_byte: 0,
                end_byte: text.len(),
            },
            score,
            provenance: Provenance {
                document_id,
                source_uri: format!("test://{doc}"),
                title: Some(doc.to_uppercase()),
                metadata: DocumentMetadata::default(),
            },
        }
    }

    fn base_tokens(query: &str) -> usize {
        count_tokens(SYSTEM_PROMPT) + count_tokens(&render_user(&[], query))
    }

    #[test]
    fn markers_follow_rank_order() {
        let prompt = assemble(
            "what?",
            vec![item("a", 0, "first passage", 0.9), item("b", 0, "second passage", 0.5)],
            10_000,
        )
        .unwrap();
        assert_eq!(prompt.dropped, 0);
        assert_eq!(prompt.placed[0].marker, 1);
        assert_eq!(prompt.placed[1].item.chunk.text, "second passage");
        let user = &prompt.messages[1].content;
        assert!(user.contains("[1] A (test://a)\nfirst passage"));
        assert!(user.contains("[2] B (test://b)\nsecond passage"));
        assert!(user.ends_with("Question: what?"));
        assert_eq!(prompt.messages[0].content, SYSTEM_PROMPT);
    }

    #[test]
    fn lowest_scored_dropped_first() {
        // Each block costs 4 tokens: marker, title, uri, and one word of text.
        let scores = [0.9, 0.2, 0.8, 0.1, 0.7];
        let items: Vec<_> = scores
            .iter()
            .enumerate()
            .map(|(i, s)| item(&format!("d{i}"), 0, "word", *s))
            .collect();
        let block = count_tokens(&render_block(1, &items[0]));
        let budget = base_tokens("q") + 3 * block;

        let prompt = assemble("q", items, budget).unwrap();
        assert_eq!(prompt.dropped, 2);
        let kept: Vec<_> = prompt
            .placed
            .iter()
            .map(|p| p.item.provenance.document_id.as_str().to_owned())
            .collect();
        assert_eq!(kept, vec!["d0", "d2", "d4"]);
        assert_eq!(prompt.placed[2].marker, 3);
        assert!(prompt.tokens <= budget);
    }

    #[test]
    fn query_alone_over_budget() {
        let query = "word ".repeat(50);
        let err = assemble(&query, vec![item("a", 0, "x", 1.0)], 20).unwrap_err();
        assert_eq!(err.budget, 20);
        assert!(err.required > 20);
    }

    #[test]
    fn everything_dropped_still_builds_prompt() {
        let budget = base_tokens("q");
        let prompt = assemble("q", vec![item("a", 0, "x", 1.0)], budget).unwrap();
        assert!(prompt.placed.is_empty());
        assert_eq!(prompt.dropped, 1);
    }

    #[test]
    fn timestamps_rendered() {
        let mut it = item("t", 0, "hello", 1.0);
        it.provenance.metadata.start_seconds = Some(65.4);
        it.provenance.metadata.end_seconds = Some(3725.0);
        assert!(render_block(3, &it).starts_with("[3] T (test://t) at 1:05-1:02:05\n"));
    }

    #[test]
    fn topic_grouping_named_in_header() {
        let mut it = item("t", 0, "open the billing page", 1.0);
        it.provenance.metadata.start_seconds = Some(5.0);
        it.provenance.metadata.end_seconds = Some(11.0);
        it.provenance
            .metadata
            .extra
            .insert("topic".into(), MetadataValue::from("billing"));
        assert!(
            render_block(1, &it).starts_with("[1] T (test://t) at 0:05-0:11 [topic: billing]\n")
        );
    }
}
