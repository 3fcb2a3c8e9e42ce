//! Circuit breaker behavior through the public API.

use callguard::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, DependencyError, Error, FailureKind,
    MemoryStore,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
    CircuitBreaker::new(config, Arc::new(MemoryStore::new()))
}

fn unavailable() -> std::result::Result<(), DependencyError> {
    Err(DependencyError::unavailable("503 from dependency"))
}

/// Three failing calls open the breaker; the fourth fails fast without
/// reaching the dependency; after the recovery timeout one successful
/// probe closes the circuit again.
#[tokio::test]
async fn open_fail_fast_recover_cycle() {
    let cb = breaker(
        CircuitBreakerConfig::new("pms")
            .with_failure_threshold(3)
            .with_success_threshold(1)
            .with_recovery_timeout(Duration::from_millis(250)),
    );
    let dependency_hits = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let hits = dependency_hits.clone();
        let err = cb
            .call(|| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                unavailable()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dependency(_)));
    }
    assert_eq!(cb.snapshot().await.state, CircuitState::Open);

    // Fourth call is denied before the dependency is touched.
    let hits = dependency_hits.clone();
    let err = cb
        .call(|| async move {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DependencyError>(())
        })
        .await
        .unwrap_err();
    match err {
        Error::CircuitOpen {
            circuit_name,
            next_attempt_time,
        } => {
            assert_eq!(circuit_name, "pms");
            assert!(next_attempt_time > 0);
        }
        other => panic!("expected CircuitOpen, got {:?}", other),
    }
    assert_eq!(dependency_hits.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_millis(300)).await;

    cb.call(|| async { Ok::<_, DependencyError>("recovered") })
        .await
        .unwrap();
    let snap = cb.snapshot().await;
    assert_eq!(snap.state, CircuitState::Closed);
    assert_eq!(snap.failure_count, 0);
    assert!(snap.next_attempt_time.is_none());
}

#[tokio::test]
async fn half_open_needs_consecutive_successes() {
    let cb = breaker(
        CircuitBreakerConfig::new("asr")
            .with_failure_threshold(1)
            .with_success_threshold(2)
            .with_recovery_timeout(Duration::from_millis(100)),
    );

    cb.call(|| async { unavailable() }).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(150)).await;

    cb.call(|| async { Ok::<_, DependencyError>(()) }).await.unwrap();
    assert_eq!(cb.snapshot().await.state, CircuitState::HalfOpen);

    cb.call(|| async { Ok::<_, DependencyError>(()) }).await.unwrap();
    assert_eq!(cb.snapshot().await.state, CircuitState::Closed);
}

#[tokio::test]
async fn half_open_reopens_on_single_failure() {
    let cb = breaker(
        CircuitBreakerConfig::new("asr")
            .with_failure_threshold(1)
            .with_success_threshold(3)
            .with_recovery_timeout(Duration::from_millis(100)),
    );

    cb.call(|| async { unavailable() }).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(150)).await;

    cb.call(|| async { Ok::<_, DependencyError>(()) }).await.unwrap();
    cb.call(|| async { unavailable() }).await.unwrap_err();

    let snap = cb.snapshot().await;
    assert_eq!(snap.state, CircuitState::Open);
    assert!(matches!(
        cb.call(|| async { Ok::<_, DependencyError>(()) }).await,
        Err(Error::CircuitOpen { .. })
    ));
}

#[tokio::test]
async fn unexpected_failure_kinds_never_open_the_circuit() {
    let cb = breaker(
        CircuitBreakerConfig::new("pms")
            .with_failure_threshold(2)
            .with_expected_failures([FailureKind::Connection]),
    );

    // A storm of protocol errors passes through without counting.
    for _ in 0..20 {
        let err = cb
            .call(|| async {
                Err::<(), _>(DependencyError::new(FailureKind::Protocol, "bad payload"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dependency(_)));
    }
    let snap = cb.snapshot().await;
    assert_eq!(snap.state, CircuitState::Closed);
    assert_eq!(snap.failure_count, 0);
    assert_eq!(snap.total_failures, 0);

    // The expected kind still counts.
    cb.call(|| async { Err::<(), _>(DependencyError::connection("refused")) })
        .await
        .unwrap_err();
    assert_eq!(cb.snapshot().await.failure_count, 1);
}

#[tokio::test]
async fn call_timeout_is_counted_and_surfaced() {
    let cb = breaker(
        CircuitBreakerConfig::new("slow")
            .with_failure_threshold(1)
            .with_call_timeout(Duration::from_millis(30))
            .with_recovery_timeout(Duration::from_secs(60)),
    );

    let err = cb
        .call(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, DependencyError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CircuitTimeout { .. }));
    assert_eq!(cb.snapshot().await.state, CircuitState::Open);
}

#[tokio::test]
async fn two_instances_share_breaker_state() {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let config = CircuitBreakerConfig::new("shared")
        .with_failure_threshold(2)
        .with_recovery_timeout(Duration::from_secs(60));
    let a = CircuitBreaker::new(config.clone(), store.clone());
    let b = CircuitBreaker::new(config, store);

    a.call(|| async { unavailable() }).await.unwrap_err();
    b.call(|| async { unavailable() }).await.unwrap_err();

    // Both instances observe the open circuit the other helped trip.
    assert!(matches!(
        a.call(|| async { Ok::<_, DependencyError>(()) }).await,
        Err(Error::CircuitOpen { .. })
    ));
    assert!(matches!(
        b.call(|| async { Ok::<_, DependencyError>(()) }).await,
        Err(Error::CircuitOpen { .. })
    ));

    // A reset through either instance reopens traffic for both.
    a.reset().await.unwrap();
    b.call(|| async { Ok::<_, DependencyError>(()) }).await.unwrap();
}

#[tokio::test]
async fn fallback_serves_while_open_and_steps_aside_when_closed() {
    let cb = breaker(
        CircuitBreakerConfig::new("tts")
            .with_failure_threshold(1)
            .with_recovery_timeout(Duration::from_secs(60)),
    );

    let live = cb
        .call_with_fallback(
            || async { Ok::<_, DependencyError>("live") },
            || async { Ok("canned") },
        )
        .await
        .unwrap();
    assert_eq!(live, "live");

    cb.call(|| async { unavailable() }).await.unwrap_err();
    let canned = cb
        .call_with_fallback(
            || async { Ok::<_, DependencyError>("live") },
            || async { Ok("canned") },
        )
        .await
        .unwrap();
    assert_eq!(canned, "canned");
}
