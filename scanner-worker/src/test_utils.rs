//! In-memory stand-ins for the external services, shared by unit and integration tests.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use async_trait::async_trait;
use scanner_common::registry::VerificationResult;
use scanner_common::window::{Message, MessageId};

use crate::error::{DispatchError, ProviderError, ReconstructionError};
use crate::forward::Forwarder;
use crate::llm::{ReconstructionProvider, ReconstructionRequest, ReconstructionResponse};
use crate::verify::VerificationProvider;

pub fn message(id: &str, text: &str) -> Message {
    Message::new(MessageId::from(id), text)
}

#[derive(Debug, Clone)]
pub enum MockOutcome {
    Verified { name: String },
    Rejected,
    Error,
    /// Never answers.
    Hang,
}

/// A verification provider with a scripted answer. Clones share the call counter.
#[derive(Clone)]
pub struct MockProvider {
    name: String,
    timeout: time::Duration,
    delay: time::Duration,
    outcome: MockOutcome,
    only_for: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl MockProvider {
    pub fn new(name: &str, timeout: time::Duration, outcome: MockOutcome) -> Self {
        Self {
            name: name.to_owned(),
            timeout,
            delay: time::Duration::ZERO,
            outcome,
            only_for: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: time::Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Reject every other address.
    pub fn only_for(mut self, address: &str) -> Self {
        self.only_for = Some(address.to_owned());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VerificationProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> time::Duration {
        self.timeout
    }

    async fn verify(&self, address: &str) -> Result<VerificationResult, ProviderError> {
        _ = self.calls.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if matches!(&self.only_for, Some(only) if only != address) {
            return Ok(VerificationResult::rejected("unknown"));
        }

        match &self.outcome {
            MockOutcome::Verified { name } => Ok(VerificationResult::confirmed(
                Some(name.clone()),
                Some(self.name.clone()),
            )),
            MockOutcome::Rejected => Ok(VerificationResult::rejected("unknown")),
            MockOutcome::Error => Err(ProviderError::MalformedResponse(
                "scripted failure".to_owned(),
            )),
            MockOutcome::Hang => std::future::pending().await,
        }
    }
}

/// A reconstruction provider answering from a script, one entry per call.
/// Once the script runs out every call gets an empty answer. Clones share state.
#[derive(Clone)]
pub struct MockReconstructor {
    script: Arc<Mutex<VecDeque<Result<Vec<String>, ()>>>>,
    requests: Arc<Mutex<Vec<ReconstructionRequest>>>,
    delay: time::Duration,
}

impl MockReconstructor {
    pub fn new(script: Vec<Result<Vec<String>, ()>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
            delay: time::Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: time::Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<ReconstructionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReconstructionProvider for MockReconstructor {
    async fn complete(
        &self,
        request: ReconstructionRequest,
    ) -> Result<ReconstructionResponse, ReconstructionError> {
        self.requests.lock().unwrap().push(request);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(lines)) => Ok(ReconstructionResponse { lines }),
            Some(Err(())) => Err(ReconstructionError::MalformedResponse(
                "scripted failure".to_owned(),
            )),
            None => Ok(ReconstructionResponse::default()),
        }
    }
}

/// Records every forwarded address. Clones share the record.
#[derive(Clone, Default)]
pub struct MemoryForwarder {
    forwarded: Arc<Mutex<Vec<String>>>,
    failing: bool,
}

impl MemoryForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call is recorded, then fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn forwarded(&self) -> Vec<String> {
        self.forwarded.lock().unwrap().clone()
    }
}

#[async_trait]
impl Forwarder for MemoryForwarder {
    async fn forward(&self, address: &str) -> Result<(), DispatchError> {
        self.forwarded.lock().unwrap().push(address.to_owned());

        if self.failing {
            return Err(DispatchError::StatusError(
                http::StatusCode::SERVICE_UNAVAILABLE,
            ));
        }

        Ok(())
    }
}
