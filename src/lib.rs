//! # callguard
//!
//! Resilience core for a voice-call orchestration service: protects calls
//! to unreliable external dependencies (PMS connectors, TTS/ASR engines,
//! datastores) by isolating failures, bounding concurrent and queued work,
//! and throttling request rates, across multiple cooperating process
//! instances sharing state through a common store.
//!
//! ## Overview
//!
//! This crate decides admit / deny / fail-fast and tracks the statistics
//! needed to do so. It serves no HTTP, implements no dependency clients and
//! persists no business data; the surrounding service wires its middleware
//! and admin routes to the operations exposed here.
//!
//! - **Circuit breaking**: a CLOSED/OPEN/HALF_OPEN state machine per named
//!   dependency, persisted in the shared store so every instance fails
//!   fast together and recovers together.
//! - **Rate limiting**: sliding window, token bucket or fixed window per
//!   rule, routed by ordered path/method/client-type rules, enforced at
//!   minute, hour and day granularity.
//! - **Backpressure**: bounded admission of queued asynchronous work per
//!   named resource, with reject / drop-oldest / adaptive shedding.
//! - **Composition**: one explicit [`ResilienceManager`] built at startup
//!   owns and observes all of the above; no global mutable state.
//!
//! Counter and state updates against the shared store are atomic
//! (increment or conditional read-modify-write), never get-then-set, so
//! concurrent instances cannot race each other. When the store is
//! unreachable, components degrade to process-local state and say so in
//! their snapshots rather than failing callers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use callguard::{ClientType, DependencyError, ResilienceConfig, ResilienceManager};
//!
//! #[tokio::main]
//! async fn main() -> callguard::Result<()> {
//!     let manager = ResilienceManager::builder()
//!         .with_config(ResilienceConfig::new())
//!         .build()?;
//!     manager.initialize().await?;
//!
//!     // Wrap a dependency call in its circuit breaker.
//!     let audio = manager
//!         .call("tts-engine", || async {
//!             Ok::<_, DependencyError>("synthesized audio")
//!         })
//!         .await?;
//!     let _ = audio;
//!
//!     // Admission-check an incoming request.
//!     let decision = manager
//!         .check_rate_limit("client-42", "/v1/calls", Some("POST"), ClientType::External)
//!         .await;
//!     if !decision.allowed {
//!         println!("throttled, retry after {:?}s", decision.retry_after);
//!     }
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`circuit`] | Per-dependency failure isolation state machine |
//! | [`rate_limit`] | Rule-routed throttling with three algorithms |
//! | [`backpressure`] | Bounded admission of queued asynchronous work |
//! | [`manager`] | Composition root, health/metrics/reset surface |
//! | [`store`] | Shared state store boundary and implementations |
//! | [`config`] | Typed configuration with YAML deserialization |

pub mod backpressure;
pub mod circuit;
pub mod config;
pub mod manager;
pub mod rate_limit;
pub mod store;

// Re-export main types for convenience
pub use backpressure::{
    BackpressureConfig, BackpressureHandler, BackpressureStats, BackpressureStrategy, TaskHandle,
};
pub use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use config::ResilienceConfig;
pub use manager::{
    HealthState, HealthStatus, MetricsSnapshot, ResilienceManager, ResilienceManagerBuilder,
    StoreMode,
};
pub use rate_limit::{
    ClientType, LimitType, RateLimitAlgorithm, RateLimitConfig, RateLimitResult, RateLimitRule,
    RateLimiter, RuleSet,
};
pub use store::{FailoverStore, MemoryStore, StateStore, StoreKey};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{DependencyError, Error, ErrorContext, FailureKind, RejectReason};
