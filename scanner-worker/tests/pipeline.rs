use std::sync::Arc;
use std::time::Duration;

use scanner_common::candidate::Provenance;
use scanner_common::extract::PatternExtractor;
use scanner_common::health::HealthRegistry;
use scanner_common::store::{load_history, Client, MemoryClient, AUTO_FORWARD_KEY};
use scanner_worker::llm::ReconstructionProvider;
use scanner_worker::pipeline::{CandidateOutcome, Dispatch, Pipeline, PipelineSettings};
use scanner_worker::reconstruct::{ReconstructionEngine, ReconstructionSettings};
use scanner_worker::source::{consume, IncomingMessage};
use scanner_worker::test_utils::{MemoryForwarder, MockOutcome, MockProvider, MockReconstructor};
use scanner_worker::verify::{VerificationCoordinator, VerificationProvider};

const ADDRESS: &str = "4k3Dyjzvzp8eMZWUXbBCjEvwSkkk59S5iCNLY3QrkX6R";

fn verifying_provider() -> MockProvider {
    MockProvider::new(
        "registry",
        Duration::from_secs(5),
        MockOutcome::Verified {
            name: "Token".to_owned(),
        },
    )
    .only_for(ADDRESS)
}

fn pipeline(
    provider: &MockProvider,
    forwarder: &MemoryForwarder,
    reconstructor: Option<&MockReconstructor>,
    store: &Arc<MemoryClient>,
) -> Arc<Pipeline> {
    let providers: Vec<Arc<dyn VerificationProvider>> = vec![Arc::new(provider.clone())];
    let reconstructor = reconstructor.map(|reconstructor| {
        let reconstructor: Arc<dyn ReconstructionProvider> = Arc::new(reconstructor.clone());
        reconstructor
    });

    Arc::new(Pipeline::new(
        ReconstructionEngine::new(
            PatternExtractor::default(),
            ReconstructionSettings::default(),
            reconstructor,
        ),
        VerificationCoordinator::new(providers),
        store.clone(),
        Arc::new(forwarder.clone()),
        PipelineSettings::default(),
    ))
}

fn incoming(handle: &str, text: &str) -> IncomingMessage {
    IncomingMessage {
        text: text.to_owned(),
        handle: Some(handle.to_owned()),
        ..Default::default()
    }
}

#[tokio::test]
async fn marked_address_is_verified_and_forwarded_once() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let pipeline = pipeline(&provider, &forwarder, None, &store);

    let report = pipeline
        .handle(incoming("m1", &format!("CA: {}", ADDRESS)))
        .expect("first delivery")
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 1);
    match &report.outcomes[0] {
        CandidateOutcome::Checked {
            address,
            provenance,
            verification,
            fresh,
            dispatch,
        } => {
            assert_eq!(address, ADDRESS);
            assert_eq!(*provenance, Provenance::Direct);
            assert!(verification.verified);
            assert!(*fresh);
            assert_eq!(*dispatch, Dispatch::Forwarded);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(forwarder.forwarded(), vec![ADDRESS.to_owned()]);
    assert_eq!(provider.calls(), 1);

    let entry = pipeline.registry().get(ADDRESS).expect("admitted");
    assert!(entry.is_dispatched());

    let history = load_history(store.as_ref()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].address, ADDRESS);
    assert_eq!(history[0].name.as_deref(), Some("Token"));
    assert!(history[0].dispatched);
}

#[tokio::test]
async fn reingested_messages_are_never_forwarded_again() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let pipeline = pipeline(&provider, &forwarder, None, &store);
    let text = format!("CA: {}", ADDRESS);

    drop(pipeline.handle(incoming("m1", &text)).unwrap().await.unwrap());

    // Same handle: dropped before extraction.
    assert!(pipeline.handle(incoming("m1", &text)).is_none());

    // Same text reposted: the cached verification is reused.
    let report = pipeline
        .handle(incoming("m2", &text))
        .unwrap()
        .await
        .unwrap();
    match &report.outcomes[0] {
        CandidateOutcome::Checked {
            fresh, dispatch, ..
        } => {
            assert!(!*fresh);
            assert_eq!(*dispatch, Dispatch::AlreadyDispatched);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    assert_eq!(forwarder.forwarded(), vec![ADDRESS.to_owned()]);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn short_prefix_combines_with_next_message() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let pipeline = pipeline(&provider, &forwarder, None, &store);

    let first = pipeline
        .handle(incoming("m1", &ADDRESS[..3]))
        .unwrap()
        .await
        .unwrap();
    assert!(first.outcomes.is_empty());

    let report = pipeline
        .handle(incoming("m2", &ADDRESS[3..]))
        .unwrap()
        .await
        .unwrap();

    assert!(report.outcomes.iter().any(|outcome| matches!(
        outcome,
        CandidateOutcome::Checked {
            address,
            provenance: Provenance::CrossMessage,
            dispatch: Dispatch::Forwarded,
            ..
        } if address == ADDRESS
    )));
    assert_eq!(report.forwarded(), vec![ADDRESS]);
    assert_eq!(forwarder.forwarded(), vec![ADDRESS.to_owned()]);
}

#[tokio::test]
async fn combination_longer_than_an_address_is_not_produced() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let pipeline = pipeline(&provider, &forwarder, None, &store);

    let first = pipeline
        .handle(incoming("m1", &ADDRESS[..4]))
        .unwrap()
        .await
        .unwrap();
    assert!(first.outcomes.is_empty());
    let report = pipeline
        .handle(incoming("m2", &ADDRESS[3..]))
        .unwrap()
        .await
        .unwrap();

    assert!(!report.outcomes.iter().any(|outcome| matches!(
        outcome,
        CandidateOutcome::Checked {
            provenance: Provenance::CrossMessage,
            ..
        }
    )));
    assert!(forwarder.forwarded().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ai_fallback_retries_until_an_address_verifies() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let reconstructor = MockReconstructor::new(vec![
        Ok(vec!["I could not find anything".to_owned()]),
        Ok(vec![format!("1. {}", ADDRESS)]),
        Ok(vec![ADDRESS.to_owned()]),
    ]);
    let pipeline = pipeline(&provider, &forwarder, Some(&reconstructor), &store);

    let report = pipeline
        .handle(incoming("m1", "ca soon, starts with 4k3Dyjzvzp8eMZWUX"))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(report.ai_attempts, 2);
    assert!(report.outcomes.iter().any(|outcome| matches!(
        outcome,
        CandidateOutcome::Checked {
            provenance: Provenance::AiReconstructed,
            dispatch: Dispatch::Forwarded,
            ..
        }
    )));
    assert_eq!(forwarder.forwarded(), vec![ADDRESS.to_owned()]);

    let requests = reconstructor.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].user_text.contains("4k3Dyjzvzp8eMZWUX"));
}

#[tokio::test]
async fn ai_fallback_is_skipped_without_a_signal() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let reconstructor = MockReconstructor::new(vec![Ok(vec![ADDRESS.to_owned()])]);
    let pipeline = pipeline(&provider, &forwarder, Some(&reconstructor), &store);

    let report = pipeline
        .handle(incoming("m1", "gm everyone"))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(report.ai_attempts, 0);
    assert!(reconstructor.requests().is_empty());
    assert!(forwarder.forwarded().is_empty());
}

#[tokio::test]
async fn disabled_auto_forward_keeps_address_for_later() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    store
        .set(AUTO_FORWARD_KEY.to_owned(), "false".to_owned())
        .await
        .unwrap();
    let pipeline = pipeline(&provider, &forwarder, None, &store);
    let text = format!("CA: {}", ADDRESS);

    let report = pipeline
        .handle(incoming("m1", &text))
        .unwrap()
        .await
        .unwrap();
    assert!(report.outcomes[0].is_verified());
    assert!(forwarder.forwarded().is_empty());
    assert!(!pipeline.registry().get(ADDRESS).unwrap().is_dispatched());

    store
        .set(AUTO_FORWARD_KEY.to_owned(), "true".to_owned())
        .await
        .unwrap();
    let report = pipeline
        .handle(incoming("m2", &text))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(report.forwarded(), vec![ADDRESS]);
    assert_eq!(provider.calls(), 1);
    let history = load_history(store.as_ref()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].dispatched);
}

#[tokio::test]
async fn failed_dispatch_is_not_retried() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::failing();
    let store = Arc::new(MemoryClient::new());
    let pipeline = pipeline(&provider, &forwarder, None, &store);
    let text = format!("CA: {}", ADDRESS);

    let report = pipeline
        .handle(incoming("m1", &text))
        .unwrap()
        .await
        .unwrap();
    assert!(matches!(
        report.outcomes[0],
        CandidateOutcome::Checked {
            dispatch: Dispatch::Failed,
            ..
        }
    ));

    drop(pipeline.handle(incoming("m2", &text)).unwrap().await.unwrap());

    assert_eq!(forwarder.forwarded().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_sightings_verify_and_forward_once() {
    let provider = verifying_provider().with_delay(Duration::from_secs(1));
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let pipeline = pipeline(&provider, &forwarder, None, &store);

    let first = pipeline
        .handle(incoming("m1", &format!("CA: {}", ADDRESS)))
        .unwrap();
    let second = pipeline
        .handle(incoming("m2", &format!("buy {} now", ADDRESS)))
        .unwrap();
    let (first, second) = (first.await.unwrap(), second.await.unwrap());

    assert_eq!(provider.calls(), 1);
    assert_eq!(forwarder.forwarded(), vec![ADDRESS.to_owned()]);
    assert_eq!(first.forwarded().len() + second.forwarded().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn sighting_during_verification_waits_instead_of_asking_ai() {
    let provider = verifying_provider().with_delay(Duration::from_secs(1));
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let reconstructor = MockReconstructor::new(vec![]);
    let pipeline = pipeline(&provider, &forwarder, Some(&reconstructor), &store);
    let text = format!("CA: {}", ADDRESS);

    let first = pipeline.handle(incoming("m1", &text)).unwrap();
    let second = pipeline.handle(incoming("m2", &text)).unwrap();
    let reports = [first.await.unwrap(), second.await.unwrap()];

    for report in &reports {
        assert_eq!(report.ai_attempts, 0);
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.outcomes[0].is_verified());
    }
    let reused: Vec<&CandidateOutcome> = reports
        .iter()
        .map(|report| &report.outcomes[0])
        .filter(|outcome| matches!(outcome, CandidateOutcome::Checked { fresh: false, .. }))
        .collect();
    assert!(matches!(
        reused.as_slice(),
        [CandidateOutcome::Checked {
            dispatch: Dispatch::AlreadyDispatched,
            ..
        }]
    ));

    assert!(reconstructor.requests().is_empty());
    assert_eq!(provider.calls(), 1);
    assert_eq!(forwarder.forwarded(), vec![ADDRESS.to_owned()]);
}

#[tokio::test(start_paused = true)]
async fn direct_combination_skips_pair_and_ai_reconstruction() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let reconstructor = MockReconstructor::new(vec![]);
    let pipeline = pipeline(&provider, &forwarder, Some(&reconstructor), &store);

    // Both halves are partial runs, so each one on its own asks for AI help.
    drop(
        pipeline
            .handle(incoming("m1", &ADDRESS[..16]))
            .unwrap()
            .await
            .unwrap(),
    );
    let asked_before = reconstructor.requests().len();

    let report = pipeline
        .handle(incoming("m2", &ADDRESS[16..]))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(report.ai_attempts, 0);
    assert_eq!(reconstructor.requests().len(), asked_before);
    // The reversed pair would be a second, distinct candidate.
    assert_eq!(report.outcomes.len(), 1);
    assert!(matches!(
        &report.outcomes[0],
        CandidateOutcome::Checked {
            address,
            provenance: Provenance::CrossMessage,
            dispatch: Dispatch::Forwarded,
            ..
        } if address == ADDRESS
    ));
    assert_eq!(forwarder.forwarded(), vec![ADDRESS.to_owned()]);
}

#[tokio::test]
async fn consume_feeds_every_line_and_waits_for_triggers() {
    let provider = verifying_provider();
    let forwarder = MemoryForwarder::new();
    let store = Arc::new(MemoryClient::new());
    let pipeline = pipeline(&provider, &forwarder, None, &store);

    let liveness = HealthRegistry::new("liveness");
    let handle = liveness
        .register("message_source".to_owned(), Duration::from_secs(30))
        .await;

    let input = format!(
        "gm\n{{\"text\": \"CA: {0}\", \"handle\": \"1\"}}\n{{\"text\": \"CA: {0}\", \"handle\": \"1\"}}\n\n",
        ADDRESS
    );
    consume(
        input.as_bytes(),
        pipeline.clone(),
        handle,
        Duration::from_secs(10),
    )
    .await
    .unwrap();

    assert_eq!(forwarder.forwarded(), vec![ADDRESS.to_owned()]);
    assert_eq!(pipeline.registry().len(), 1);
}
