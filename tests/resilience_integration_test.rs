//! End-to-end resilience scenarios
//!
//! Circuit breaker trip/probe/recovery, two-instance leader failover,
//! hybrid storage read-through, and the rate-limited wrapper flow, all
//! through the public API.

use std::sync::Arc;
use std::time::Duration;

use fluxgate::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState, Coordinator,
    CoordinatorConfig, HybridStorage, LocalStorage, LocalStorageConfig, ManualClock,
    MetricsRecorder, RateLimited, RateLimiter, Storage, TokenBucketConfig, TokenBucketLimiter,
    WaitMode, WorkerPoolConfig,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

#[tokio::test]
async fn circuit_breaker_trip_probe_recover() {
    init_tracing();
    let clock = ManualClock::new();
    let breaker = CircuitBreaker::with_clock(
        CircuitBreakerConfig {
            failure_threshold: 3,
            timeout: Duration::from_secs(10),
        },
        Arc::new(clock.clone()),
    );

    // Three consecutive failures open the circuit.
    for _ in 0..3 {
        let outcome = breaker.call(|| async { Err::<(), _>("downstream broken") }).await;
        assert!(matches!(outcome, Err(CircuitError::Inner(_))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // Calls inside [t, t+10) reject without reaching downstream.
    for _ in 0..3 {
        let outcome = breaker.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(outcome, Err(CircuitError::Open { .. })));
        clock.advance(Duration::from_secs(3));
    }

    // At t+10 exactly one probe is admitted; its success closes the
    // circuit.
    clock.advance(Duration::from_secs(1));
    assert!(breaker.call(|| async { Ok::<_, &str>(()) }).await.is_ok());
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn coordinator_failover_between_instances() {
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(LocalStorageConfig::default()));
    let ttl = Duration::from_millis(150);
    let retry = Duration::from_millis(30);

    let a = Coordinator::new(
        CoordinatorConfig {
            lock_name: "cluster:leader".to_string(),
            ttl,
            retry_interval: retry,
        },
        storage.clone(),
    );
    let b = Coordinator::new(
        CoordinatorConfig {
            lock_name: "cluster:leader".to_string(),
            ttl,
            retry_interval: retry,
        },
        storage,
    );

    // Instance A wins the first election.
    assert!(a.acquire_leadership().await.unwrap());
    assert!(!b.acquire_leadership().await.unwrap());

    // "Kill" A: it stops heartbeating. B cannot take over inside the TTL.
    assert!(!b.acquire_leadership().await.unwrap());

    // Within ttl + retry_interval, B becomes leader.
    b.start().unwrap();
    tokio::time::sleep(ttl + retry * 3).await;
    assert!(b.is_leader());
    b.stop().await.unwrap();
}

#[tokio::test]
async fn at_most_one_leader_at_any_instant() {
    let storage: Arc<dyn Storage> = Arc::new(LocalStorage::new(LocalStorageConfig::default()));
    let make = || {
        Coordinator::new(
            CoordinatorConfig {
                lock_name: "cluster:leader".to_string(),
                ttl: Duration::from_millis(400),
                retry_interval: Duration::from_millis(20),
            },
            storage.clone(),
        )
    };
    let coordinators = [make(), make(), make()];
    for coordinator in &coordinators {
        coordinator.start().unwrap();
    }

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        let leaders = coordinators.iter().filter(|c| c.is_leader()).count();
        assert!(leaders <= 1, "observed {} simultaneous leaders", leaders);
    }
    for coordinator in &coordinators {
        coordinator.stop().await.unwrap();
    }
}

#[tokio::test]
async fn hybrid_storage_serves_reads_from_either_tier() {
    let l2: Arc<dyn Storage> = Arc::new(LocalStorage::new(LocalStorageConfig::default()));
    let hybrid = HybridStorage::new(LocalStorageConfig::default(), l2.clone());

    hybrid
        .set("session", "alive", Some(Duration::from_secs(300)))
        .await
        .unwrap();
    assert_eq!(
        hybrid.get("session").await.unwrap(),
        Some("alive".to_string())
    );

    // A write landing only in L2 is still visible through the hybrid.
    l2.set("direct", "l2-only", None).await.unwrap();
    assert_eq!(
        hybrid.get("direct").await.unwrap(),
        Some("l2-only".to_string())
    );

    // Counter traffic is always authoritative.
    l2.set("hits", "41", None).await.unwrap();
    assert_eq!(hybrid.incr("hits", 1.0).await.unwrap(), 42.0);
}

#[tokio::test]
async fn rate_limited_wrapper_backs_off_until_accept() {
    let storage = Arc::new(LocalStorage::new(LocalStorageConfig::default()));
    let limiter: Arc<dyn RateLimiter> = Arc::new(
        TokenBucketLimiter::new(
            TokenBucketConfig {
                rate: 20.0,
                ..TokenBucketConfig::default()
            },
            storage,
        )
        .unwrap(),
    );

    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let calls_in_fn = calls.clone();
    let wrapped = RateLimited::new(limiter, "downstream", move |x: u32| {
        let calls = calls_in_fn.clone();
        async move {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            x
        }
    });

    // More calls than the burst: the tail waits for refill instead of
    // erroring.
    for i in 0..25 {
        assert_eq!(wrapped.call(i).await.unwrap(), i);
    }
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 25);
}

#[tokio::test]
async fn wrapper_fail_fast_reports_rejection() {
    let storage = Arc::new(LocalStorage::new(LocalStorageConfig::default()));
    let limiter: Arc<dyn RateLimiter> = Arc::new(
        TokenBucketLimiter::new(
            TokenBucketConfig {
                rate: 1.0,
                ..TokenBucketConfig::default()
            },
            storage,
        )
        .unwrap(),
    );
    let wrapped = RateLimited::new(limiter, "downstream", |x: u32| async move { x })
        .wait_mode(WaitMode::FailFast);

    assert!(wrapped.call(1).await.is_ok());
    assert!(wrapped.call(2).await.is_err());
}

#[tokio::test]
async fn limiter_metrics_land_in_exposition_text() {
    let recorder = Arc::new(MetricsRecorder::new());
    let storage = Arc::new(LocalStorage::new(LocalStorageConfig::default()));
    let limiter = TokenBucketLimiter::new(
        TokenBucketConfig {
            rate: 2.0,
            ..TokenBucketConfig::default()
        },
        storage,
    )
    .unwrap()
    .with_metrics(recorder.clone());

    for _ in 0..3 {
        let _ = limiter.acquire("k", 1).await.unwrap();
    }
    assert_eq!(recorder.counter("fluxgate_limiter_accepted_total"), 2);
    assert_eq!(recorder.counter("fluxgate_limiter_rejected_total"), 1);

    let text = recorder.render();
    assert!(text.contains("# TYPE fluxgate_limiter_accepted_total counter"));
    assert!(text.contains("fluxgate_limiter_accepted_total 2"));
}

#[tokio::test]
async fn configs_load_from_json() {
    let limiter_config: TokenBucketConfig = serde_json::from_str(
        r#"{
            "rate": 50.0,
            "per": { "secs": 1, "nanos": 0 },
            "burst": 75.0,
            "scope": "public-api"
        }"#,
    )
    .unwrap();
    assert_eq!(limiter_config.rate, 50.0);
    assert_eq!(limiter_config.burst, Some(75.0));

    let pool_config: WorkerPoolConfig = serde_json::from_str(
        r#"{
            "min_workers": 2,
            "max_workers": 16,
            "scale_up_threshold": 8.0,
            "scale_down_threshold": 2.0,
            "check_interval": { "secs": 1, "nanos": 0 }
        }"#,
    )
    .unwrap();
    assert_eq!(pool_config.max_workers, 16);

    let storage = Arc::new(LocalStorage::new(LocalStorageConfig::default()));
    assert!(TokenBucketLimiter::new(limiter_config, storage).is_ok());
}
