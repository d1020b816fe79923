//! Rebuilding addresses that were split, suffixed or spread over several messages.
use std::collections::HashSet;
use std::sync::Arc;
use std::time;

use scanner_common::address::{is_alphabet_char, is_valid_address};
use scanner_common::candidate::{dedup_candidates, Candidate, Provenance};
use scanner_common::extract::{Extraction, PatternExtractor, MIN_PAIR_FRAGMENT_LEN};
use scanner_common::retry::RetryPolicy;
use scanner_common::window::{Message, MessageId, SequentialPair};
use tracing::{debug, warn};

use crate::error::ReconstructionError;
use crate::llm::{ReconstructionProvider, ReconstructionRequest};

pub const DEFAULT_PREVIOUS_MAX_LEN: usize = 20;
pub const DEFAULT_CURRENT_MAX_LEN: usize = 44;

const SYSTEM_PROMPT: &str = "You extract Solana token contract addresses from chat messages. \
Addresses are base58 strings of 32 to 44 characters and never contain 0, O, I or l. \
Posters often hide them: split over several messages, broken up by spaces or punctuation, \
or followed by a separate suffix word such as pump. Reassemble every address you can find \
and answer with one address per line and nothing else. Answer with an empty message when \
there is none.";

const ESCALATION_PROMPT: &str = "Earlier answers did not contain a confirmed address. \
These fragments were seen in the conversation, try combining them in every order:";

#[derive(Debug, Clone)]
pub struct ReconstructionSettings {
    /// Direct combination only fires when the previous message is shorter than this.
    pub previous_max_len: usize,
    /// Direct combination only fires when the current message is shorter than this.
    pub current_max_len: usize,
    pub max_attempts: u32,
    pub timeout: time::Duration,
    pub model: String,
    pub retry_policy: RetryPolicy,
}

impl Default for ReconstructionSettings {
    fn default() -> Self {
        Self {
            previous_max_len: DEFAULT_PREVIOUS_MAX_LEN,
            current_max_len: DEFAULT_CURRENT_MAX_LEN,
            max_attempts: 3,
            timeout: time::Duration::from_secs(15),
            model: "gpt-4o-mini".to_owned(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// What the AI fallback needs to know about the message that triggered it.
#[derive(Debug, Clone)]
pub struct AiTrigger {
    pub message_id: MessageId,
    /// Window text at the time the message arrived, oldest first.
    pub window_text: String,
    /// Fragment values seen in the triggering message, used to escalate the prompt.
    pub fragments: Vec<String>,
    pub source_messages: Vec<MessageId>,
}

/// The prompt of one AI attempt sequence. Every triggering message starts from a
/// fresh state, so escalation never leaks into unrelated messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptState {
    window_text: String,
    hints: Vec<String>,
}

impl PromptState {
    pub fn new(window_text: String) -> Self {
        Self {
            window_text,
            hints: Vec::new(),
        }
    }

    /// Add fragments not already part of the prompt. Returns whether anything changed.
    pub fn escalate<S: AsRef<str>>(&mut self, fragments: &[S]) -> bool {
        let before = self.hints.len();

        for fragment in fragments {
            let fragment = fragment.as_ref();
            if !self.hints.iter().any(|hint| hint == fragment) {
                self.hints.push(fragment.to_owned());
            }
        }

        self.hints.len() > before
    }

    pub fn hints(&self) -> &[String] {
        &self.hints
    }

    pub fn request(&self, model: &str) -> ReconstructionRequest {
        let user_text = if self.hints.is_empty() {
            self.window_text.clone()
        } else {
            format!(
                "{}\n\n{}\n{}",
                self.window_text,
                ESCALATION_PROMPT,
                self.hints.join("\n")
            )
        };

        ReconstructionRequest {
            system_prompt: SYSTEM_PROMPT.to_owned(),
            user_text,
            model: model.to_owned(),
        }
    }
}

/// Keep the valid addresses found in a line oriented provider answer, ignoring
/// numbering, quotes and any other framing around them.
pub fn parse_response_lines<S: AsRef<str>>(lines: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();

    lines
        .iter()
        .flat_map(|line| line.as_ref().split_whitespace())
        .map(|token| token.trim_matches(|c: char| !is_alphabet_char(c)))
        .filter(|token| is_valid_address(token))
        .filter(|token| seen.insert(token.to_string()))
        .map(String::from)
        .collect()
}

pub struct ReconstructionEngine {
    extractor: PatternExtractor,
    settings: ReconstructionSettings,
    provider: Option<Arc<dyn ReconstructionProvider>>,
}

impl ReconstructionEngine {
    pub fn new(
        extractor: PatternExtractor,
        settings: ReconstructionSettings,
        provider: Option<Arc<dyn ReconstructionProvider>>,
    ) -> Self {
        Self {
            extractor,
            settings,
            provider,
        }
    }

    pub fn extractor(&self) -> &PatternExtractor {
        &self.extractor
    }

    pub fn settings(&self) -> &ReconstructionSettings {
        &self.settings
    }

    /// A short previous message followed by the rest of the address.
    pub fn direct_combination(&self, current: &Message, previous: &Message) -> Option<Candidate> {
        let head = previous.text.trim();
        let tail = current.text.trim();

        if head.is_empty()
            || head.chars().count() >= self.settings.previous_max_len
            || tail.chars().count() >= self.settings.current_max_len
        {
            return None;
        }

        let combined = format!("{}{}", head, tail);
        if !is_valid_address(&combined) {
            return None;
        }

        debug!(value = %combined, "combined previous and current message");
        Some(Candidate::new(
            combined,
            Provenance::CrossMessage,
            vec![previous.id.clone(), current.id.clone()],
        ))
    }

    /// Every fragment of a message glued to every suffix token of it.
    pub fn fragment_suffix_combinations(
        &self,
        message: &Message,
        extraction: &Extraction,
    ) -> Vec<Candidate> {
        let join = self.extractor.suffix_join();
        let mut candidates = Vec::new();

        for fragment in extraction.non_suffixes() {
            for suffix in extraction.suffixes() {
                let value = join.join(&fragment.value, &suffix.value);
                if is_valid_address(&value) {
                    candidates.push(Candidate::new(
                        value,
                        Provenance::FragmentCombination,
                        vec![message.id.clone()],
                    ));
                }
            }
        }

        dedup_candidates(candidates)
    }

    /// Runs of the two most recent buffered messages, concatenated in
    /// both orders.
    pub fn sequential_pair(&self, pair: &SequentialPair) -> Vec<Candidate> {
        let newest = self
            .extractor
            .pair_fragments(&pair.newest.text, MIN_PAIR_FRAGMENT_LEN);
        let previous = self
            .extractor
            .pair_fragments(&pair.previous.text, MIN_PAIR_FRAGMENT_LEN);
        let sources = vec![pair.previous.id.clone(), pair.newest.id.clone()];

        let mut candidates = Vec::new();
        for a in &previous {
            for b in &newest {
                for value in [format!("{}{}", a, b), format!("{}{}", b, a)] {
                    if is_valid_address(&value) {
                        candidates.push(Candidate::new(
                            value,
                            Provenance::CrossMessage,
                            sources.clone(),
                        ));
                    }
                }
            }
        }

        dedup_candidates(candidates)
    }

    /// Whether the AI fallback may run for a message with this text.
    pub fn wants_ai(&self, text: &str) -> bool {
        self.provider.is_some()
            && self.settings.max_attempts > 0
            && self.extractor.has_reconstruction_signal(text)
    }

    /// Start an attempt sequence for one triggering message.
    pub fn session(&self, trigger: AiTrigger) -> ReconstructionSession<'_> {
        ReconstructionSession {
            engine: self,
            prompt: PromptState::new(trigger.window_text.clone()),
            trigger,
            attempt: 0,
        }
    }
}

/// The retry loop of the AI fallback for a single triggering message.
pub struct ReconstructionSession<'a> {
    engine: &'a ReconstructionEngine,
    trigger: AiTrigger,
    prompt: PromptState,
    attempt: u32,
}

impl<'a> ReconstructionSession<'a> {
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn prompt(&self) -> &PromptState {
        &self.prompt
    }

    /// Run the next attempt and return the candidates it produced, possibly none.
    /// Returns `None` once every attempt was used, or when no provider is configured.
    ///
    /// Calling this again means the previous attempt produced nothing verified: the
    /// prompt is escalated and the retry policy's backoff is observed first.
    pub async fn next_attempt(&mut self) -> Option<Vec<Candidate>> {
        let provider = self.engine.provider.as_ref()?;
        let settings = &self.engine.settings;

        if self.attempt >= settings.max_attempts {
            return None;
        }

        if self.attempt > 0 {
            _ = self.prompt.escalate(&self.trigger.fragments);
            tokio::time::sleep(settings.retry_policy.time_until_next_retry(self.attempt - 1))
                .await;
        }
        self.attempt += 1;

        let attempt = self.attempt.to_string();
        let labels = [("attempt", attempt)];
        metrics::counter!("scanner_reconstruction_attempts_total", &labels).increment(1);

        let request = self.prompt.request(&settings.model);
        let outcome = match tokio::time::timeout(settings.timeout, provider.complete(request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(ReconstructionError::Timeout(settings.timeout)),
        };

        match outcome {
            Ok(response) => {
                let candidates: Vec<Candidate> = parse_response_lines(&response.lines)
                    .into_iter()
                    .map(|value| {
                        Candidate::new(
                            value,
                            Provenance::AiReconstructed,
                            self.trigger.source_messages.clone(),
                        )
                    })
                    .collect();

                debug!(
                    message = %self.trigger.message_id,
                    attempt = self.attempt,
                    "reconstruction returned {} candidates",
                    candidates.len()
                );
                Some(candidates)
            }
            Err(error) => {
                warn!(
                    message = %self.trigger.message_id,
                    attempt = self.attempt,
                    "reconstruction attempt failed: {}",
                    error
                );
                Some(Vec::new())
            }
        }
    }
}
