//! Racing independent verification providers for a single address.
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use scanner_common::address::is_valid_address;
use scanner_common::registry::VerificationResult;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::error::ProviderError;

/// An external service able to confirm that an address is a real token.
///
/// Implementations translate their own wire format into a `VerificationResult`,
/// so the coordinator only ever deals with that one shape.
#[async_trait]
pub trait VerificationProvider: Send + Sync {
    fn name(&self) -> &str;

    /// How long the coordinator waits for this provider before counting it out.
    fn timeout(&self) -> time::Duration;

    async fn verify(&self, address: &str) -> Result<VerificationResult, ProviderError>;
}

#[derive(Clone)]
pub struct VerificationCoordinator {
    providers: Vec<Arc<dyn VerificationProvider>>,
}

impl VerificationCoordinator {
    pub fn new(providers: Vec<Arc<dyn VerificationProvider>>) -> Self {
        Self { providers }
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|provider| provider.name())
    }

    /// The longest a single `verify` call can take.
    pub fn deadline(&self) -> time::Duration {
        self.providers
            .iter()
            .map(|provider| provider.timeout())
            .max()
            .unwrap_or_default()
    }

    /// Race every provider and return the first confirmation.
    ///
    /// Each provider runs in its own detached task, bounded by its own timeout. Once a
    /// provider confirms, the remaining tasks keep running but nobody listens to them
    /// anymore. Timeouts, errors and rejections all count as lost races; when every
    /// provider loses, the address is reported as not confirmed.
    #[instrument(skip(self))]
    pub async fn verify(&self, address: &str) -> VerificationResult {
        if !is_valid_address(address) {
            let labels = [("outcome", "invalid_format")];
            metrics::counter!("scanner_verifications_total", &labels).increment(1);
            return VerificationResult::invalid_format();
        }

        let now = tokio::time::Instant::now();
        let (tx, mut rx) = mpsc::channel(self.providers.len().max(1));

        for provider in &self.providers {
            let provider = provider.clone();
            let tx = tx.clone();
            let address = address.to_owned();

            tokio::spawn(async move {
                let timeout = provider.timeout();
                let outcome = match tokio::time::timeout(timeout, provider.verify(&address)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProviderError::Timeout(timeout)),
                };

                // The receiver is dropped as soon as the race is decided.
                drop(tx.send((provider.name().to_owned(), outcome)).await);
            });
        }
        drop(tx);

        while let Some((provider, outcome)) = rx.recv().await {
            match outcome {
                Ok(result) if result.verified => {
                    debug!(provider = %provider, "address verified");
                    let labels = [("provider", provider)];
                    metrics::counter!("scanner_provider_wins_total", &labels).increment(1);
                    let labels = [("outcome", "verified")];
                    metrics::counter!("scanner_verifications_total", &labels).increment(1);
                    metrics::histogram!("scanner_verification_duration_seconds")
                        .record(now.elapsed().as_secs_f64());

                    return result;
                }
                Ok(result) => {
                    debug!(
                        provider = %provider,
                        reason = result.reason.as_deref().unwrap_or_default(),
                        "provider did not confirm address"
                    );
                }
                Err(ProviderError::Timeout(timeout)) => {
                    debug!(provider = %provider, "provider timed out after {:?}", timeout);
                    let labels = [("provider", provider)];
                    metrics::counter!("scanner_provider_timeouts_total", &labels).increment(1);
                }
                Err(error) => {
                    warn!(provider = %provider, "provider failed: {}", error);
                    let labels = [("provider", provider)];
                    metrics::counter!("scanner_provider_errors_total", &labels).increment(1);
                }
            }
        }

        let labels = [("outcome", "not_confirmed")];
        metrics::counter!("scanner_verifications_total", &labels).increment(1);
        metrics::histogram!("scanner_verification_duration_seconds")
            .record(now.elapsed().as_secs_f64());

        VerificationResult::not_confirmed()
    }
}
