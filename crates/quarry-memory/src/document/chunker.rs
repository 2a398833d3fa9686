use serde::{Deserialize, Serialize};

use crate::types::{Chunk, ChunkId, Document, DocumentId};

#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("invalid chunker config: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap_tokens: 50,
        }
    }
}

impl ChunkerConfig {
    /// # Errors
    ///
    /// Returns `ChunkerError::InvalidConfig` if `max_tokens` is zero or the overlap
    /// is not strictly smaller than `max_tokens`.
    pub fn validate(&self) -> Result<(), ChunkerError> {
        if self.max_tokens == 0 {
            return Err(ChunkerError::InvalidConfig(
                "max_tokens must be greater than zero".into(),
            ));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(ChunkerError::InvalidConfig(format!(
                "overlap_tokens ({}) must be smaller than max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// Number of whitespace-delimited tokens, the unit every budget in Quarry counts in.
#[must_use]
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[derive(Debug, Clone, Copy)]
struct Token {
    start: usize,
    end: usize,
    sentence_end: bool,
    paragraph_end: bool,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut current: Option<usize> = None;
    let mut newlines_since_token = 0usize;

    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(start) = current.take() {
                tokens.push(make_token(text, start, idx));
                newlines_since_token = 0;
            }
            if ch == '\n' {
                newlines_since_token += 1;
                if newlines_since_token >= 2
                    && let Some(last) = tokens.last_mut()
                {
                    last.paragraph_end = true;
                }
            }
        } else if current.is_none() {
            current = Some(idx);
        }
    }
    if let Some(start) = current {
        tokens.push(make_token(text, start, text.len()));
    }
    tokens
}

fn make_token(text: &str, start: usize, end: usize) -> Token {
    let word = text[start..end].trim_end_matches(['"', '\'', ')', ']', '}', '\u{201d}', '\u{2019}']);
    Token {
        start,
        end,
        sentence_end: word.ends_with(['.', '?', '!']),
        paragraph_end: false,
    }
}

/// Splits document text into overlapping, token-bounded chunks.
///
/// Each chunk ends at the latest paragraph break inside its window, else the latest
/// sentence end, else exactly at `max_tokens`. A break is only taken when it leaves
/// more than `overlap_tokens` tokens in the chunk, so every chunk advances.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// # Errors
    ///
    /// Returns `ChunkerError::InvalidConfig` when the config fails validation.
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkerError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> ChunkerConfig {
        self.config
    }

    #[must_use]
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        self.chunk_text(&document.id, &document.raw_text)
    }

    #[must_use]
    pub fn chunk_text(&self, document_id: &DocumentId, text: &str) -> Vec<Chunk> {
        let tokens = tokenize(text);
        let n = tokens.len();
        let mut chunks = Vec::new();
        if n == 0 {
            return chunks;
        }

        let overlap = self.config.overlap_tokens;
        let mut start = 0;
        loop {
            let limit = (start + self.config.max_tokens).min(n);
            let end = if limit == n {
                n
            } else {
                Self::pick_end(&tokens, start + overlap + 1, limit)
            };

            let start_byte = tokens[start].start;
            let end_byte = tokens[end - 1].end;
            let body = &text[start_byte..end_byte];
            let position = chunks.len();
            chunks.push(Chunk {
                id: ChunkId::derive(document_id, position, body),
                document_id: document_id.clone(),
                text: body.to_owned(),
                position,
                token_count: end - start,
                start_token: start,
                overlap_tokens: if position == 0 { 0 } else { overlap },
                start_byte,
                end_byte,
            });

            if end == n {
                break;
            }
            start = end - overlap;
        }
        chunks
    }

    /// Exclusive end index in `min_end..=limit`, preferring paragraph then sentence breaks.
    fn pick_end(tokens: &[Token], min_end: usize, limit: usize) -> usize {
        let window = min_end..=limit;
        if let Some(end) = window.clone().rev().find(|&e| tokens[e - 1].paragraph_end) {
            return end;
        }
        if let Some(end) = window.rev().find(|&e| tokens[e - 1].sentence_end) {
            return end;
        }
        limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max_tokens: usize, overlap_tokens: usize) -> Chunker {
        Chunker::new(ChunkerConfig {
            max_tokens,
            overlap_tokens,
        })
        .unwrap()
    }

    fn texts(chunks: &[Chunk]) -> Vec<&str> {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn sentence_boundaries_preferred() {
        let chunks = chunker(2, 0).chunk_text(&"d".into(), "A. B. C.");
        assert_eq!(texts(&chunks), vec!["A. B.", "C."]);
    }

    #[test]
    fn empty_and_whitespace_yield_nothing() {
        assert!(chunker(4, 1).chunk_text(&"d".into(), "").is_empty());
        assert!(chunker(4, 1).chunk_text(&"d".into(), " \n\t ").is_empty());
    }

    #[test]
    fn short_text_is_single_chunk() {
        let chunks = chunker(10, 2).chunk_text(&"d".into(), "one two three");
        assert_eq!(texts(&chunks), vec!["one two three"]);
        assert_eq!(chunks[0].token_count, 3);
        assert_eq!(chunks[0].overlap_tokens, 0);
    }

    #[test]
    fn hard_split_with_overlap() {
        let chunks = chunker(4, 1).chunk_text(&"d".into(), "a b c d e f g h i j");
        assert_eq!(texts(&chunks), vec!["a b c d", "d e f g", "g h i j"]);
        assert!(chunks[1..].iter().all(|c| c.overlap_tokens == 1));
    }

    #[test]
    fn paragraph_break_beats_sentence_end() {
        let text = "First one. Second\n\nthird fourth. fifth sixth";
        let chunks = chunker(5, 0).chunk_text(&"d".into(), text);
        assert_eq!(chunks[0].text, "First one. Second");
        assert_eq!(chunks[1].text, "third fourth. fifth sixth");
    }

    #[test]
    fn sentence_end_with_closing_quote() {
        let chunks = chunker(3, 0).chunk_text(&"d".into(), "He said \"stop.\" Then left quickly");
        assert_eq!(chunks[0].text, "He said \"stop.\"");
    }

    #[test]
    fn break_too_early_for_overlap_is_skipped() {
        // "a." is a sentence end but taking it would leave no progress past the overlap.
        let chunks = chunker(3, 1).chunk_text(&"d".into(), "a. b c d e");
        assert_eq!(texts(&chunks)[0], "a. b c");
    }

    #[test]
    fn chunk_text_is_exact_slice_of_source() {
        let text = "alpha  beta\tgamma\n\ndelta epsilon";
        let chunks = chunker(2, 0).chunk_text(&"d".into(), text);
        for c in &chunks {
            assert_eq!(&text[c.start_byte..c.end_byte], c.text);
        }
    }

    #[test]
    fn ids_are_stable_across_runs() {
        let a = chunker(3, 1).chunk_text(&"d".into(), "one two three four five six");
        let b = chunker(3, 1).chunk_text(&"d".into(), "one two three four five six");
        assert_eq!(
            a.iter().map(|c| c.id).collect::<Vec<_>>(),
            b.iter().map(|c| c.id).collect::<Vec<_>>()
        );
    }

    #[test]
    fn invalid_configs_rejected() {
        assert!(Chunker::new(ChunkerConfig { max_tokens: 0, overlap_tokens: 0 }).is_err());
        assert!(Chunker::new(ChunkerConfig { max_tokens: 5, overlap_tokens: 5 }).is_err());
        assert!(Chunker::new(ChunkerConfig { max_tokens: 5, overlap_tokens: 0 }).is_ok());
    }

    #[test]
    fn count_tokens_counts_whitespace_words() {
        assert_eq!(count_tokens("  a b\n\nc  "), 3);
        assert_eq!(count_tokens(""), 0);
    }

    mod proptest_chunker {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(500))]

            #[test]
            fn never_panics(
                content in "\\PC{0,2000}",
                max_tokens in 1usize..64,
                overlap_seed in 0usize..64,
            ) {
                let overlap_tokens = overlap_seed % max_tokens;
                let c = chunker(max_tokens, overlap_tokens);
                let _ = c.chunk_text(&"d".into(), &content);
            }

            #[test]
            fn dropping_overlap_reconstructs_tokens(
                content in "([a-z]{1,6}[.?!]? ?\n?){0,300}",
                max_tokens in 1usize..40,
                overlap_seed in 0usize..40,
            ) {
                let overlap_tokens = overlap_seed % max_tokens;
                let chunks = chunker(max_tokens, overlap_tokens).chunk_text(&"d".into(), &content);

                let original: Vec<&str> = content.split_whitespace().collect();
                let rebuilt: Vec<&str> = chunks
                    .iter()
                    .flat_map(|c| c.text.split_whitespace().skip(c.overlap_tokens))
                    .collect();
                prop_assert_eq!(rebuilt, original);
            }

            #[test]
            fn chunks_respect_token_limit_and_overlap(
                content in "([a-z]{1,6}[.]? ){0,300}",
                max_tokens in 2usize..40,
                overlap_seed in 0usize..40,
            ) {
                let overlap_tokens = overlap_seed % max_tokens;
                let chunks = chunker(max_tokens, overlap_tokens).chunk_text(&"d".into(), &content);
                for (i, c) in chunks.iter().enumerate() {
                    prop_assert_eq!(c.position, i);
                    prop_assert!(c.token_count <= max_tokens);
                    prop_assert!(c.token_count > c.overlap_tokens);
                    if i > 0 {
                        let prev: Vec<&str> = chunks[i - 1].text.split_whitespace().collect();
                        let head: Vec<&str> = c.text.split_whitespace().take(overlap_tokens).collect();
                        prop_assert_eq!(&prev[prev.len() - overlap_tokens..], head.as_slice());
                    }
                }
            }
        }
    }
}
