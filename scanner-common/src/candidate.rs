use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::window::MessageId;

/// Which strategy produced a `Candidate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Direct,
    FragmentCombination,
    CrossMessage,
    AiReconstructed,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Direct => "direct",
            Provenance::FragmentCombination => "fragment-combination",
            Provenance::CrossMessage => "cross-message",
            Provenance::AiReconstructed => "ai-reconstructed",
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A string hypothesized to be an address, not yet verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub value: String,
    pub provenance: Provenance,
    /// Messages the value was taken from, oldest first.
    pub source_messages: Vec<MessageId>,
    /// False only for values found verbatim in a single message.
    pub is_synthetic: bool,
}

impl Candidate {
    pub fn new(value: String, provenance: Provenance, source_messages: Vec<MessageId>) -> Self {
        Self {
            value,
            is_synthetic: provenance != Provenance::Direct,
            provenance,
            source_messages,
        }
    }
}

/// Drop candidates whose value was already seen, keeping the first occurrence.
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();

    candidates
        .into_iter()
        .filter(|candidate| seen.insert(candidate.value.clone()))
        .collect()
}
