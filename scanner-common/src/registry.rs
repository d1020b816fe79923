//! Process-wide record of every address seen, its verification and whether it was dispatched.
//!
//! Entries are never evicted: keeping them for the lifetime of the process is what
//! guarantees an address is forwarded at most once.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::debug;

use crate::address::Address;
use crate::candidate::{Candidate, Provenance};

pub const REASON_INVALID_FORMAT: &str = "invalid format";
pub const REASON_NOT_CONFIRMED: &str = "no provider confirmed";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("candidate {0:?} does not reduce to a single address")]
    InvalidCandidate(String),
    #[error("address {0} was never admitted")]
    NotAdmitted(String),
}

/// The outcome of verifying an address, regardless of which provider produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl VerificationResult {
    pub fn confirmed(name: Option<String>, platform: Option<String>) -> Self {
        Self {
            verified: true,
            name,
            platform,
            reason: None,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self {
            verified: false,
            name: None,
            platform: None,
            reason: Some(reason.to_owned()),
        }
    }

    pub fn invalid_format() -> Self {
        Self::rejected(REASON_INVALID_FORMAT)
    }

    pub fn not_confirmed() -> Self {
        Self::rejected(REASON_NOT_CONFIRMED)
    }
}

#[derive(Debug)]
pub struct Entry {
    address: Address,
    first_seen_at: OffsetDateTime,
    provenance: Provenance,
    verification: RwLock<Option<VerificationResult>>,
    /// Woken every time a verification is recorded.
    settled: Notify,
    dispatched: AtomicBool,
}

impl Entry {
    fn new(address: Address, provenance: Provenance) -> Self {
        Self {
            address,
            first_seen_at: OffsetDateTime::now_utc(),
            provenance,
            verification: RwLock::new(None),
            settled: Notify::new(),
            dispatched: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn first_seen_at(&self) -> OffsetDateTime {
        self.first_seen_at
    }

    /// Provenance of the candidate that first admitted this address.
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn verification(&self) -> Option<VerificationResult> {
        self.verification
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Wait for the verification started by whoever admitted this entry.
    /// Never returns if that verification is abandoned, so callers bound the wait.
    pub async fn settled_verification(&self) -> VerificationResult {
        loop {
            // Registered before the check, so a result recorded in between still wakes us.
            let settled = self.settled.notified();
            if let Some(result) = self.verification() {
                return result;
            }
            settled.await;
        }
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched.load(Ordering::SeqCst)
    }

    fn set_verification(&self, result: VerificationResult) {
        *self
            .verification
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(result);

        self.settled.notify_waiters();
    }

    fn mark_dispatched(&self) -> bool {
        self.dispatched
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            address: self.address.clone(),
            first_seen_at: self.first_seen_at,
            provenance: self.provenance,
            verification: self.verification(),
            dispatched: self.is_dispatched(),
        }
    }
}

/// A point in time copy of an `Entry`, for debug views and history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    pub address: Address,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen_at: OffsetDateTime,
    pub provenance: Provenance,
    pub verification: Option<VerificationResult>,
    pub dispatched: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<HashMap<Address, Arc<Entry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for the candidate's canonical address, creating it if needed.
    /// The boolean is true only for the call that created the entry, which makes this
    /// the check-and-set gate for starting a verification.
    pub fn admit(&self, candidate: &Candidate) -> Result<(Arc<Entry>, bool), RegistryError> {
        let address = Address::parse(&candidate.value).ok_or_else(|| {
            debug!(value = %candidate.value, "discarding invalid candidate");
            RegistryError::InvalidCandidate(candidate.value.clone())
        })?;

        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(entry) = entries.get(&address) {
            return Ok((entry.clone(), false));
        }

        let entry = Arc::new(Entry::new(address.clone(), candidate.provenance));
        drop(entries.insert(address, entry.clone()));
        metrics::gauge!("scanner_registry_entries").set(entries.len() as f64);

        Ok((entry, true))
    }

    pub fn get(&self, address: &str) -> Option<Arc<Entry>> {
        let address = Address::parse(address)?;

        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&address)
            .cloned()
    }

    /// Store the verification for an admitted address, replacing any earlier one.
    pub fn record_verification(
        &self,
        address: &str,
        result: VerificationResult,
    ) -> Result<Arc<Entry>, RegistryError> {
        let entry = self
            .get(address)
            .ok_or_else(|| RegistryError::NotAdmitted(address.to_owned()))?;

        entry.set_verification(result);

        Ok(entry)
    }

    /// Flip the dispatched flag. Only the first call for an address returns true,
    /// and nothing may be forwarded on a false return.
    pub fn mark_dispatched(&self, address: &str) -> bool {
        match self.get(address) {
            Some(entry) => entry.mark_dispatched(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, oldest first.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let entries: Vec<Arc<Entry>> = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();

        let mut snapshots: Vec<EntrySnapshot> = entries.iter().map(|e| e.snapshot()).collect();
        snapshots.sort_by(|a, b| {
            a.first_seen_at
                .cmp(&b.first_seen_at)
                .then_with(|| a.address.cmp(&b.address))
        });
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const ADDRESS: &str = "4k3Dyjzvzp8eMZWUXbBCjEvwSkkk59S5iCNLY3QrkX6R";

    fn candidate(value: &str) -> Candidate {
        Candidate::new(value.to_owned(), Provenance::Direct, vec![])
    }

    #[test]
    fn test_admit_returns_the_same_entry() {
        let registry = Registry::new();

        let (first, is_new) = registry.admit(&candidate(ADDRESS)).unwrap();
        assert!(is_new);

        let (second, is_new) = registry
            .admit(&candidate(&format!("CA: {}", ADDRESS)))
            .unwrap();
        assert!(!is_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_admit_rejects_invalid_candidates() {
        let registry = Registry::new();

        assert_eq!(
            registry.admit(&candidate("too short")).unwrap_err(),
            RegistryError::InvalidCandidate("too short".to_owned())
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mark_dispatched_only_once() {
        let registry = Registry::new();
        drop(registry.admit(&candidate(ADDRESS)).unwrap());

        assert!(registry.mark_dispatched(ADDRESS));
        for _ in 0..5 {
            assert!(!registry.mark_dispatched(ADDRESS));
        }
        assert!(registry.get(ADDRESS).unwrap().is_dispatched());
    }

    #[test]
    fn test_mark_dispatched_unknown_address() {
        let registry = Registry::new();

        assert!(!registry.mark_dispatched(ADDRESS));
    }

    #[test]
    fn test_mark_dispatched_is_exclusive_across_threads() {
        let registry = Arc::new(Registry::new());
        drop(registry.admit(&candidate(ADDRESS)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.mark_dispatched(ADDRESS))
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_record_verification_overwrites() {
        let registry = Registry::new();
        drop(registry.admit(&candidate(ADDRESS)).unwrap());

        registry
            .record_verification(ADDRESS, VerificationResult::not_confirmed())
            .unwrap();
        let entry = registry
            .record_verification(
                ADDRESS,
                VerificationResult::confirmed(Some("Token".to_owned()), None),
            )
            .unwrap();

        assert_eq!(
            entry.verification(),
            Some(VerificationResult::confirmed(Some("Token".to_owned()), None))
        );
    }

    #[tokio::test]
    async fn test_settled_verification_waits_for_the_verifier() {
        let registry = Arc::new(Registry::new());
        let (entry, _) = registry.admit(&candidate(ADDRESS)).unwrap();

        let waiter = tokio::spawn(async move { entry.settled_verification().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        registry
            .record_verification(ADDRESS, VerificationResult::not_confirmed())
            .unwrap();
        assert_eq!(waiter.await.unwrap(), VerificationResult::not_confirmed());

        // Already settled: returns right away.
        let entry = registry.get(ADDRESS).unwrap();
        assert_eq!(
            entry.settled_verification().await,
            VerificationResult::not_confirmed()
        );
    }

    #[test]
    fn test_record_verification_requires_admission() {
        let registry = Registry::new();

        assert_eq!(
            registry
                .record_verification(ADDRESS, VerificationResult::not_confirmed())
                .unwrap_err(),
            RegistryError::NotAdmitted(ADDRESS.to_owned())
        );
    }

    #[test]
    fn test_snapshot() {
        let registry = Registry::new();
        drop(registry.admit(&candidate(ADDRESS)).unwrap());
        assert!(registry.mark_dispatched(ADDRESS));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].address.as_str(), ADDRESS);
        assert!(snapshot[0].dispatched);
        assert_eq!(snapshot[0].verification, None);
    }
}
