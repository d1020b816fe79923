//! The token address alphabet and the predicates built on it.
//!
//! Addresses are base58-like strings that leave out the visually ambiguous
//! characters `0`, `O`, `I` and `l`.
use serde::{Deserialize, Serialize};

pub const MIN_ADDRESS_LEN: usize = 32;
pub const MAX_ADDRESS_LEN: usize = 44;

/// The regex character class matching a single alphabet character.
pub const ALPHABET_CLASS: &str = "[1-9A-HJ-NP-Za-km-z]";

pub fn is_alphabet_char(c: char) -> bool {
    matches!(c, '1'..='9' | 'A'..='H' | 'J'..='N' | 'P'..='Z' | 'a'..='k' | 'm'..='z')
}

/// True when `s` has a valid address length and only contains alphabet characters.
pub fn is_valid_address(s: &str) -> bool {
    // Every alphabet character is ASCII, so the byte length is the character count.
    (MIN_ADDRESS_LEN..=MAX_ADDRESS_LEN).contains(&s.len()) && s.chars().all(is_alphabet_char)
}

/// Iterate over the maximal alphabet runs of `text`, in order of appearance.
pub fn alphabet_runs(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !is_alphabet_char(c))
        .filter(|run| !run.is_empty())
}

/// Reduce a raw candidate to its canonical address.
///
/// Framing such as markup, markers or punctuation is stripped by splitting on
/// non-alphabet characters. The candidate is only canonical if exactly one of
/// the resulting runs has a valid address length.
pub fn canonicalize(raw: &str) -> Option<String> {
    let mut found = alphabet_runs(raw).filter(|run| is_valid_address(run));
    let address = found.next()?;

    match found.next() {
        Some(_) => None,
        None => Some(address.to_owned()),
    }
}

/// A canonical token address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Option<Self> {
        canonicalize(raw).map(Address)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
