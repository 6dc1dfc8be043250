//! Property-based tests (fuzzing) for the sync engine's decision logic.
//!
//! Uses proptest to check retry, circuit, budget, batch-size and merge
//! invariants over random inputs, and to feed malformed payloads to the
//! decoders, which must never panic.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use serde_json::Value;

use crm_sync::config::{CircuitConfig, MemoryConfig};
use crm_sync::counters::InMemoryCounterStore;
use crm_sync::memory::FixedMemoryProbe;
use crm_sync::merge::CorrelationWindow;
use crm_sync::transport::{normalize_payload, TransportError};
use crm_sync::{
    CircuitBreaker, ClassifiedError, ErrorClassifier, ErrorKind, MemoryManager, RateLimitManager, RemoteRecord,
    SyncEngineConfig, WebhookAction, WebhookEvent,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn kind_strategy() -> impl Strategy<Value = ErrorKind> {
    prop::sample::select(ErrorKind::ALL.to_vec())
}

/// Kinds that are retryable with a non-zero budget
fn retryable_kind_strategy() -> impl Strategy<Value = ErrorKind> {
    prop::sample::select(vec![
        ErrorKind::Connection,
        ErrorKind::Auth,
        ErrorKind::Quota,
        ErrorKind::RateLimit,
        ErrorKind::Server,
    ])
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,  // depth
        64, // max nodes
        10, // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10).prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn classifier(threshold: u32) -> ErrorClassifier {
    let config = CircuitConfig {
        key_prefix: "prop".into(),
        failure_threshold: threshold,
        window: Duration::from_secs(600),
        cooldown: Duration::from_secs(300),
    };
    ErrorClassifier::new(Arc::new(CircuitBreaker::new(Arc::new(InMemoryCounterStore::new()), config)))
}

fn correlated(cid: &str, action: WebhookAction, id: &str) -> WebhookEvent {
    WebhookEvent::new(action, "deals", id).with_correlation_id(cid)
}

// =============================================================================
// Retry and Circuit Properties
// =============================================================================

proptest! {
    /// No retry once the attempt count reaches the kind's budget
    #[test]
    fn prop_should_retry_respects_max_retries(kind in kind_strategy(), attempt in 0u32..32) {
        let rt = runtime();
        let classifier = classifier(5);
        let error = ClassifiedError::new(kind, "boom");

        let allowed = rt.block_on(classifier.should_retry(&error, attempt));
        if attempt >= error.max_retries {
            prop_assert!(!allowed);
        } else {
            prop_assert_eq!(allowed, error.retryable);
        }
    }

    /// `threshold` failures open the circuit and deny retries; one success closes it
    #[test]
    fn prop_threshold_failures_open_circuit(kind in retryable_kind_strategy(), threshold in 1u32..10) {
        let rt = runtime();
        let classifier = classifier(threshold);
        let error = ClassifiedError::new(kind, "boom");

        rt.block_on(async {
            for _ in 0..threshold - 1 {
                classifier.record_failure(&error).await;
            }
            prop_assert!(!classifier.breaker().is_open(kind).await);
            classifier.record_failure(&error).await;
            prop_assert!(classifier.breaker().is_open(kind).await);
            prop_assert!(!classifier.should_retry(&error, 0).await);

            classifier.record_success(kind).await;
            prop_assert!(!classifier.breaker().is_open(kind).await);
            prop_assert!(classifier.should_retry(&error, 0).await);
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Retry delays stay within ±10% of the capped exponential value
    #[test]
    fn prop_retry_delay_bounded(kind in retryable_kind_strategy(), attempt in 1u32..20) {
        let classifier = classifier(5);
        let error = ClassifiedError::new(kind, "boom");
        let delay = classifier.retry_delay(&error, attempt).as_secs_f64();
        let cap: f64 = 60.0 * 1.1 + 0.001;
        prop_assert!(delay <= cap.max(error.retry_after_secs as f64 * 1.1 + 0.001));
        prop_assert!(delay >= error.retry_after_secs as f64 * 0.9 - 0.001);
    }
}

// =============================================================================
// Token Budget Properties
// =============================================================================

proptest! {
    /// After N calls of cost C, used == N*C and admission flips exactly at the limit
    #[test]
    fn prop_token_budget_accounting(n in 0u64..40, cost in 1u64..5, limit in 1u64..200, next in 1u64..5) {
        let rt = runtime();
        let config = SyncEngineConfig { daily_token_budget: limit, ..SyncEngineConfig::default() };
        let manager = RateLimitManager::new(Arc::new(InMemoryCounterStore::new()), config.rate_limit());

        rt.block_on(async {
            for _ in 0..n {
                manager.consume("deals", cost).await;
            }
            let budget = manager.budget().await;
            prop_assert_eq!(budget.used, n * cost);
            prop_assert_eq!(budget.remaining(), limit.saturating_sub(n * cost));
            prop_assert_eq!(manager.can_admit("deals", next).await, n * cost + next <= limit);
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// A retry-after hint wins over backoff, with at most 10% added
    #[test]
    fn prop_wait_delay_honors_hint(hint in 0u64..16, attempt in 1u32..10) {
        let manager = RateLimitManager::new(
            Arc::new(InMemoryCounterStore::new()),
            SyncEngineConfig::default().rate_limit(),
        );
        let wait = manager.wait_delay(attempt, Some(Duration::from_secs(hint)));
        prop_assert!(wait >= Duration::from_secs(hint));
        prop_assert!(wait.as_secs_f64() <= hint as f64 * 1.1 + 0.001);
    }
}

// =============================================================================
// Memory Properties
// =============================================================================

proptest! {
    /// Above the soft threshold the batch size never grows and never drops below the minimum
    #[test]
    fn prop_batch_size_non_increasing_under_pressure(
        min in 1usize..50,
        max in 50usize..1000,
        usages in prop::collection::vec(80.0f64..100.0, 1..25),
    ) {
        let config = MemoryConfig {
            min_batch_size: min,
            max_batch_size: max,
            ..MemoryConfig::default()
        };
        let probe = Arc::new(FixedMemoryProbe::at_percent(10.0));
        let manager = MemoryManager::new(probe.clone(), config);

        let mut previous = manager.current_batch_size();
        for usage in usages {
            probe.set_percent(usage);
            let next = manager.adaptive_batch_size();
            prop_assert!(next <= previous, "grew from {} to {} at {}%", previous, next, usage);
            prop_assert!(next >= min);
            previous = next;
        }
    }

    /// Below the growth margin the batch size never shrinks and never exceeds the maximum
    #[test]
    fn prop_batch_size_recovers_within_bounds(max in 10usize..1000, steps in 1usize..50) {
        let config = MemoryConfig { min_batch_size: 10, max_batch_size: max, ..MemoryConfig::default() };
        let probe = Arc::new(FixedMemoryProbe::at_percent(99.0));
        let manager = MemoryManager::new(probe.clone(), config);
        for _ in 0..10 {
            manager.adaptive_batch_size();
        }

        probe.set_percent(5.0);
        let mut previous = manager.current_batch_size();
        for _ in 0..steps {
            let next = manager.adaptive_batch_size();
            prop_assert!(next >= previous);
            prop_assert!(next <= max);
            previous = next;
        }
    }
}

// =============================================================================
// Merge Detection Properties
// =============================================================================

proptest! {
    /// update(s), update(s), delete(m) under one correlation id → exactly one inference
    #[test]
    fn prop_merge_same_correlation_infers_once(surviving in 1u32..10_000, merged in 1u32..10_000, cid in "[a-z0-9-]{1,24}") {
        prop_assume!(surviving != merged);
        let window = CorrelationWindow::new(Duration::from_secs(30));
        let (s, m) = (surviving.to_string(), merged.to_string());

        let inferences: Vec<_> = [
            correlated(&cid, WebhookAction::Update, &s),
            correlated(&cid, WebhookAction::Update, &s),
            correlated(&cid, WebhookAction::Delete, &m),
        ]
        .iter()
        .filter_map(|event| window.observe(event))
        .collect();

        prop_assert_eq!(inferences.len(), 1);
        prop_assert_eq!(&inferences[0].merged_id, &m);
        prop_assert_eq!(&inferences[0].surviving_id, &s);
    }

    /// The same events split across two correlation ids never infer a merge
    #[test]
    fn prop_merge_split_correlation_never_infers(surviving in 1u32..10_000, merged in 1u32..10_000) {
        prop_assume!(surviving != merged);
        let window = CorrelationWindow::new(Duration::from_secs(30));
        let (s, m) = (surviving.to_string(), merged.to_string());

        let inferred = [
            correlated("first", WebhookAction::Update, &s),
            correlated("first", WebhookAction::Update, &s),
            correlated("second", WebhookAction::Delete, &m),
        ]
        .iter()
        .filter_map(|event| window.observe(event))
        .count();
        prop_assert_eq!(inferred, 0);
    }
}

// =============================================================================
// Decoder Fuzz Tests
// =============================================================================

proptest! {
    /// Classification never panics and always lands on a known kind
    #[test]
    fn fuzz_classifier_any_status_and_message(status in prop::option::of(0u16..1000), message in ".*") {
        let err = match status {
            Some(code) => TransportError::status(code, message),
            None => TransportError::network(message),
        };
        let classified = ErrorClassifier::classify(&err, &[("entity_type", "deals")]);
        prop_assert!(ErrorKind::ALL.contains(&classified.kind));
        if let Some(code) = status {
            if (500..600).contains(&code) {
                prop_assert_eq!(classified.kind, ErrorKind::Server);
            }
        }
        prop_assert_eq!(classified.context.get("entity_type").map(String::as_str), Some("deals"));
    }

    /// Arbitrary retry-after header values never panic
    #[test]
    fn fuzz_retry_after_header(value in ".*") {
        let err = TransportError::status(429, "slow down").with_header("retry-after", value);
        let classified = ErrorClassifier::classify(&err, &[]);
        prop_assert_eq!(classified.kind, ErrorKind::RateLimit);
    }

    /// Payload normalisation accepts any JSON and only yields records with ids
    #[test]
    fn fuzz_normalize_arbitrary_payload(json in arbitrary_json_strategy()) {
        for record in normalize_payload(json.clone()) {
            prop_assert!(!record.id.is_empty());
        }
        let _ = RemoteRecord::from_value(json);
    }

    /// Webhook decoding should never panic on arbitrary bytes
    #[test]
    fn fuzz_webhook_event_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..2000)) {
        let _: Result<WebhookEvent, _> = serde_json::from_slice(&bytes);
    }

    /// Webhook decoding should handle arbitrary JSON gracefully
    #[test]
    fn fuzz_webhook_event_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let _: Result<WebhookEvent, _> = serde_json::from_value(json);
    }
}
