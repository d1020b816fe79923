//! Pure text to candidate extraction.
//!
//! Nothing in here performs I/O or keeps state between calls: the same text
//! always yields the same candidates and fragments, in the same order.
use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::address::{alphabet_runs, is_alphabet_char, is_valid_address, ALPHABET_CLASS};
use crate::candidate::{Candidate, Provenance};
use crate::window::MessageId;

pub const DEFAULT_SUFFIX_MARKERS: &[&str] = &["pump", "bonk"];

/// Shortest standalone alphabet run that counts as a fragment.
pub const MIN_FRAGMENT_LEN: usize = 10;
/// Shortest run used when combining fragments of two sequential messages.
pub const MIN_PAIR_FRAGMENT_LEN: usize = 5;

static CA_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\bCA\s*:\s*({}*)", ALPHABET_CLASS))
        .expect("contract address marker pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// The run directly following a `CA:` marker.
    Marker,
    /// A standalone alphabet run too short or too long to stand on its own.
    Run,
    /// One of the known suffix tokens.
    Suffix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub value: String,
    pub kind: FragmentKind,
}

/// Everything the extractor found in a single text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Full matches, in order of appearance.
    pub direct: Vec<String>,
    pub fragments: Vec<Fragment>,
}

impl Extraction {
    pub fn candidates(&self, source: &MessageId) -> Vec<Candidate> {
        self.direct
            .iter()
            .map(|value| Candidate::new(value.clone(), Provenance::Direct, vec![source.clone()]))
            .collect()
    }

    pub fn suffixes(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments
            .iter()
            .filter(|fragment| fragment.kind == FragmentKind::Suffix)
    }

    pub fn non_suffixes(&self) -> impl Iterator<Item = &Fragment> {
        self.fragments
            .iter()
            .filter(|fragment| fragment.kind != FragmentKind::Suffix)
    }
}

/// How a fragment and a suffix token are glued together.
///
/// When the tail of the fragment already repeats the head of the suffix, only the
/// remainder of the suffix is appended. `max_overlap` bounds how many characters
/// may be considered overlapping; zero disables trimming entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuffixJoin {
    pub max_overlap: usize,
}

impl SuffixJoin {
    pub fn join(&self, fragment: &str, suffix: &str) -> String {
        let limit = self
            .max_overlap
            .min(suffix.len().saturating_sub(1))
            .min(fragment.len());

        for overlap in (1..=limit).rev() {
            if suffix.is_char_boundary(overlap) && fragment.ends_with(&suffix[..overlap]) {
                return format!("{}{}", fragment, &suffix[overlap..]);
            }
        }

        format!("{}{}", fragment, suffix)
    }
}

impl Default for SuffixJoin {
    fn default() -> Self {
        Self { max_overlap: 3 }
    }
}

#[derive(Debug, Clone)]
pub struct PatternExtractor {
    markers: Vec<String>,
    suffix_pattern: Option<Regex>,
    join: SuffixJoin,
}

impl PatternExtractor {
    /// Build an extractor for the given suffix markers.
    /// Markers that contain characters outside the address alphabet are ignored.
    pub fn new<S: AsRef<str>>(markers: &[S], join: SuffixJoin) -> Self {
        let mut seen = HashSet::new();
        let markers: Vec<String> = markers
            .iter()
            .map(|marker| marker.as_ref().trim().to_owned())
            .filter(|marker| !marker.is_empty() && marker.chars().all(is_alphabet_char))
            .filter(|marker| seen.insert(marker.to_lowercase()))
            .collect();

        let suffix_pattern = if markers.is_empty() {
            None
        } else {
            let alternatives: Vec<String> = markers.iter().map(|m| regex::escape(m)).collect();
            Regex::new(&format!(r"(?i)\b({})\b", alternatives.join("|"))).ok()
        };

        Self {
            markers,
            suffix_pattern,
            join,
        }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    pub fn suffix_join(&self) -> SuffixJoin {
        self.join
    }

    pub fn extract(&self, text: &str) -> Extraction {
        let mut extraction = Extraction::default();
        let mut seen_direct = HashSet::new();
        let mut seen_fragments = HashSet::new();

        for run in alphabet_runs(text) {
            if is_valid_address(run) && seen_direct.insert(run) {
                extraction.direct.push(run.to_owned());
            }
        }

        let mut push = |value: &str, kind: FragmentKind| {
            if !value.is_empty() && seen_fragments.insert(value.to_owned()) {
                extraction.fragments.push(Fragment {
                    value: value.to_owned(),
                    kind,
                });
            }
        };

        for captures in CA_MARKER.captures_iter(text) {
            if let Some(run) = captures.get(1) {
                push(run.as_str(), FragmentKind::Marker);
            }
        }

        for run in alphabet_runs(text) {
            if (MIN_FRAGMENT_LEN..=crate::address::MAX_ADDRESS_LEN).contains(&run.len())
                && !self.is_marker(run)
            {
                push(run, FragmentKind::Run);
            }
        }

        if let Some(pattern) = &self.suffix_pattern {
            for found in pattern.find_iter(text) {
                push(&found.as_str().to_lowercase(), FragmentKind::Suffix);
            }
        }

        extraction
    }

    /// Alphabet runs of at least `min_len` characters, used to recombine addresses
    /// split across two messages.
    pub fn pair_fragments<'t>(&self, text: &'t str, min_len: usize) -> Vec<&'t str> {
        let mut seen = HashSet::new();

        alphabet_runs(text)
            .filter(|run| run.len() >= min_len)
            .filter(|run| seen.insert(*run))
            .collect()
    }

    /// Whether the text looks like it carries part of an address: a suffix marker,
    /// a `CA:` marker, or a run long enough to matter but too short to be complete.
    pub fn has_reconstruction_signal(&self, text: &str) -> bool {
        let has_suffix = self
            .suffix_pattern
            .as_ref()
            .map(|pattern| pattern.is_match(text))
            .unwrap_or(false);

        has_suffix
            || CA_MARKER.is_match(text)
            || alphabet_runs(text).any(|run| {
                (MIN_FRAGMENT_LEN..crate::address::MIN_ADDRESS_LEN).contains(&run.len())
            })
    }

    fn is_marker(&self, run: &str) -> bool {
        self.markers
            .iter()
            .any(|marker| marker.eq_ignore_ascii_case(run))
    }
}

impl Default for PatternExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_SUFFIX_MARKERS, SuffixJoin::default())
    }
}
