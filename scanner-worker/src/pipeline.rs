//! Per-message orchestration: extraction, reconstruction, verification and dispatch.
//!
//! Ingestion is synchronous and strictly ordered: the message enters the window and
//! candidates are extracted before `ingest` returns. Everything after that runs in
//! `process`, which callers spawn so that slow providers never hold up the stream.
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time;

use futures::future::join_all;
use scanner_common::candidate::{dedup_candidates, Candidate, Provenance};
use scanner_common::registry::{Entry, Registry, VerificationResult};
use scanner_common::store::{load_auto_forward, record_history, Client, HistoryRecord};
use scanner_common::window::{
    MessageId, WindowStore, DEFAULT_BUFFER_SIZE, DEFAULT_BUFFER_WINDOW, DEFAULT_WINDOW_SIZE,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::forward::Forwarder;
use crate::reconstruct::{AiTrigger, ReconstructionEngine};
use crate::source::{DeliveryFilter, IncomingMessage};
use crate::verify::VerificationCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Ingested,
    Extracting,
    Verifying,
    Registering,
    Dispatching,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stage = match self {
            Stage::Ingested => "ingested",
            Stage::Extracting => "extracting",
            Stage::Verifying => "verifying",
            Stage::Registering => "registering",
            Stage::Dispatching => "dispatching",
            Stage::Done => "done",
        };
        f.write_str(stage)
    }
}

fn enter(message: &MessageId, stage: Stage) {
    debug!(message = %message, stage = %stage, "entering stage");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    NotVerified,
    AutoForwardDisabled,
    /// Another trigger already forwarded this address.
    AlreadyDispatched,
    Forwarded,
    Failed,
}

impl Dispatch {
    fn as_str(&self) -> &'static str {
        match self {
            Dispatch::NotVerified => "not_verified",
            Dispatch::AutoForwardDisabled => "auto_forward_disabled",
            Dispatch::AlreadyDispatched => "already_dispatched",
            Dispatch::Forwarded => "forwarded",
            Dispatch::Failed => "failed",
        }
    }
}

/// What happened to a single candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// The value does not reduce to a single address.
    Invalid { value: String },
    /// Admitted by another trigger whose verification did not settle in time.
    Pending { address: String },
    Checked {
        address: String,
        provenance: Provenance,
        verification: VerificationResult,
        /// False when the verification was reused from an earlier trigger.
        fresh: bool,
        dispatch: Dispatch,
    },
}

impl CandidateOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(
            self,
            CandidateOutcome::Checked { verification, .. } if verification.verified
        )
    }
}

/// The work left to do for one message once it has been ingested.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub message_id: MessageId,
    pub candidates: Vec<Candidate>,
    /// Set when the message may fall back to AI reconstruction.
    pub ai: Option<AiTrigger>,
}

#[derive(Debug, Clone)]
pub struct TriggerReport {
    pub message_id: MessageId,
    pub outcomes: Vec<CandidateOutcome>,
    pub ai_attempts: u32,
}

impl TriggerReport {
    pub fn forwarded(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter_map(|outcome| match outcome {
                CandidateOutcome::Checked {
                    address,
                    dispatch: Dispatch::Forwarded,
                    ..
                } => Some(address.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub window_size: usize,
    pub buffer_size: usize,
    pub buffer_window: time::Duration,
    /// Auto-forward policy used when the store holds no flag.
    pub auto_forward: bool,
    pub history_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_window: DEFAULT_BUFFER_WINDOW,
            auto_forward: true,
            history_limit: 50,
        }
    }
}

pub struct Pipeline {
    windows: Mutex<WindowStore>,
    deliveries: Mutex<DeliveryFilter>,
    engine: ReconstructionEngine,
    coordinator: VerificationCoordinator,
    registry: Arc<Registry>,
    store: Arc<dyn Client + Send + Sync>,
    forwarder: Arc<dyn Forwarder>,
    /// Serializes read-modify-write cycles on the history key.
    history: tokio::sync::Mutex<()>,
    auto_forward: bool,
    history_limit: usize,
}

impl Pipeline {
    pub fn new(
        engine: ReconstructionEngine,
        coordinator: VerificationCoordinator,
        store: Arc<dyn Client + Send + Sync>,
        forwarder: Arc<dyn Forwarder>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            windows: Mutex::new(WindowStore::new(
                settings.window_size,
                settings.buffer_size,
                settings.buffer_window,
            )),
            deliveries: Mutex::new(DeliveryFilter::default()),
            engine,
            coordinator,
            registry: Arc::new(Registry::new()),
            store,
            forwarder,
            history: tokio::sync::Mutex::new(()),
            auto_forward: settings.auto_forward,
            history_limit: settings.history_limit,
        }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Insert a message into the window and collect its candidates.
    /// Returns `None` for redelivered messages.
    pub fn ingest(&self, incoming: IncomingMessage) -> Option<Trigger> {
        let id = incoming.message_id();

        let first_delivery = self
            .deliveries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .first_delivery(&id);
        if !first_delivery {
            debug!(message = %id, "dropping redelivered message");
            metrics::counter!("scanner_duplicate_messages_total").increment(1);
            return None;
        }

        let message = incoming.into_message(id);
        metrics::counter!("scanner_messages_total").increment(1);
        enter(&message.id, Stage::Ingested);

        let wants_ai = self.engine.wants_ai(&message.text);
        let (pair, previous, context) = {
            let mut windows = self
                .windows
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let pair = windows.on_message(message.clone());
            let previous = windows.recent_pair().ok().map(|(_, previous)| previous);
            let context = wants_ai.then(|| {
                let sources: Vec<MessageId> = windows
                    .window()
                    .iter()
                    .rev()
                    .map(|message| message.id.clone())
                    .collect();
                (windows.full_window_text(), sources)
            });

            (pair, previous, context)
        };

        enter(&message.id, Stage::Extracting);
        let extraction = self.engine.extractor().extract(&message.text);
        let mut candidates = extraction.candidates(&message.id);

        // A direct combination skips the sequential pair and the AI fallback.
        let combined = previous
            .as_deref()
            .and_then(|previous| self.engine.direct_combination(&message, previous));
        let combined_found = combined.is_some();
        candidates.extend(combined);
        candidates.extend(
            self.engine
                .fragment_suffix_combinations(&message, &extraction),
        );
        if !combined_found {
            if let Some(pair) = &pair {
                candidates.extend(self.engine.sequential_pair(pair));
            }
        }

        let ai = match context {
            Some((window_text, source_messages)) if !combined_found => Some(AiTrigger {
                message_id: message.id.clone(),
                window_text,
                fragments: extraction
                    .fragments
                    .iter()
                    .map(|fragment| fragment.value.clone())
                    .collect(),
                source_messages,
            }),
            _ => None,
        };

        Some(Trigger {
            message_id: message.id,
            candidates: dedup_candidates(candidates),
            ai,
        })
    }

    /// Verify, register and dispatch the candidates of a trigger, falling back to AI
    /// reconstruction when none of them verified.
    #[instrument(skip_all, fields(message = %trigger.message_id))]
    pub async fn process(self: Arc<Self>, trigger: Trigger) -> TriggerReport {
        let Trigger {
            message_id,
            candidates,
            ai,
        } = trigger;

        enter(&message_id, Stage::Verifying);
        let mut outcomes = self.check_all(&message_id, candidates).await;
        let mut ai_attempts = 0;

        if !outcomes.iter().any(CandidateOutcome::is_verified) {
            if let Some(ai) = ai {
                let mut session = self.engine.session(ai);

                while let Some(candidates) = session.next_attempt().await {
                    let checked = self.check_all(&message_id, candidates).await;
                    let verified = checked.iter().any(CandidateOutcome::is_verified);
                    outcomes.extend(checked);

                    if verified {
                        break;
                    }
                }

                ai_attempts = session.attempts();
            }
        }

        enter(&message_id, Stage::Done);
        TriggerReport {
            message_id,
            outcomes,
            ai_attempts,
        }
    }

    /// Ingest a message and spawn its processing.
    pub fn handle(self: &Arc<Self>, incoming: IncomingMessage) -> Option<JoinHandle<TriggerReport>> {
        let trigger = self.ingest(incoming)?;

        Some(tokio::spawn(self.clone().process(trigger)))
    }

    async fn check_all(
        &self,
        message_id: &MessageId,
        candidates: Vec<Candidate>,
    ) -> Vec<CandidateOutcome> {
        join_all(
            candidates
                .into_iter()
                .map(|candidate| self.check(message_id, candidate)),
        )
        .await
    }

    async fn check(&self, message_id: &MessageId, candidate: Candidate) -> CandidateOutcome {
        let labels = [("provenance", candidate.provenance.as_str())];
        metrics::counter!("scanner_candidates_total", &labels).increment(1);

        // Only the trigger that creates the entry verifies it.
        let (entry, fresh) = match self.registry.admit(&candidate) {
            Ok(admitted) => admitted,
            Err(_) => {
                return CandidateOutcome::Invalid {
                    value: candidate.value,
                }
            }
        };
        let address = entry.address().to_string();

        let verification = if fresh {
            let result = self.coordinator.verify(&address).await;

            enter(message_id, Stage::Registering);
            if let Err(e) = self.registry.record_verification(&address, result.clone()) {
                warn!(address = %address, "failed to record verification: {}", e);
            }
            result
        } else {
            // The admitting trigger is bounded by the slowest provider, so is the wait.
            let settled = entry.settled_verification();
            match tokio::time::timeout(self.coordinator.deadline(), settled).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(address = %address, "verification from another trigger never settled");
                    return CandidateOutcome::Pending { address };
                }
            }
        };

        let dispatch = if verification.verified {
            enter(message_id, Stage::Dispatching);
            self.dispatch(&entry).await
        } else {
            Dispatch::NotVerified
        };

        if verification.verified && (fresh || dispatch != Dispatch::AlreadyDispatched) {
            self.remember(&entry).await;
        }

        CandidateOutcome::Checked {
            address,
            provenance: candidate.provenance,
            verification,
            fresh,
            dispatch,
        }
    }

    async fn dispatch(&self, entry: &Entry) -> Dispatch {
        let address = entry.address().as_str();

        let dispatch = if !load_auto_forward(self.store.as_ref(), self.auto_forward).await {
            Dispatch::AutoForwardDisabled
        } else if !self.registry.mark_dispatched(address) {
            Dispatch::AlreadyDispatched
        } else {
            match self.forwarder.forward(address).await {
                Ok(()) => {
                    info!(address, provenance = %entry.provenance(), "forwarded address");
                    Dispatch::Forwarded
                }
                Err(e) => {
                    error!(address, "failed to forward address: {}", e);
                    Dispatch::Failed
                }
            }
        };

        let labels = [("outcome", dispatch.as_str())];
        metrics::counter!("scanner_dispatches_total", &labels).increment(1);

        dispatch
    }

    async fn remember(&self, entry: &Entry) {
        let _guard = self.history.lock().await;
        let record = HistoryRecord::from(&entry.snapshot());

        if let Err(e) = record_history(self.store.as_ref(), record, self.history_limit).await {
            warn!(address = %entry.address(), "failed to record history: {}", e);
        }
    }
}
