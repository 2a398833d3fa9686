use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use quarry_memory::ChunkId;
use regex::Regex;

use super::prompt::PlacedChunk;

static MARKER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*(\d+(?:\s*,\s*\d+)*)\s*\]").expect("citation marker regex is valid")
});

/// Every distinct marker number cited in `answer`, in order of first appearance.
/// Both `[3]` and `[1, 4]` forms are recognised.
#[must_use]
pub fn extract_markers(answer: &str) -> Vec<usize> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for caps in MARKER_REGEX.captures_iter(answer) {
        for part in caps[1].split(',') {
            if let Ok(n) = part.trim().parse::<usize>()
                && seen.insert(n)
            {
                out.push(n);
            }
        }
    }
    out
}

#[derive(Debug, Default, PartialEq)]
pub struct CitationCheck {
    pub citations: BTreeMap<usize, ChunkId>,
    pub unresolved: Vec<usize>,
}

impl CitationCheck {
    #[must_use]
    pub fn warning(&self) -> Option<String> {
        if self.unresolved.is_empty() {
            return None;
        }
        let markers: Vec<String> = self.unresolved.iter().map(|n| format!("[{n}]")).collect();
        Some(format!(
            "answer cites markers with no matching context: {}",
            markers.join(", ")
        ))
    }
}

/// Map markers found in `answer` onto the chunks placed in the prompt.
#[must_use]
pub fn check(answer: &str, placed: &[PlacedChunk]) -> CitationCheck {
    let by_marker: BTreeMap<usize, ChunkId> =
        placed.iter().map(|p| (p.marker, p.item.chunk.id)).collect();
    let mut result = CitationCheck::default();
    for marker in extract_markers(answer) {
        match by_marker.get(&marker) {
            Some(id) => {
                result.citations.insert(marker, *id);
            }
            None => result.unresolved.push(marker),
        }
    }
    result
}
