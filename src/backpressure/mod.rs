//! # Backpressure Handler
//!
//! Bounded admission of queued asynchronous work per named resource, so
//! load beyond capacity is explicitly rejected or shed instead of growing
//! without bound. Queues are purely in-process; only their stats are ever
//! observed externally.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BackpressureHandler`] | Admission control + bounded worker pool |
//! | [`BackpressureConfig`] | Queue/memory/concurrency limits, strategy |
//! | [`BackpressureStrategy`] | Reject, DropOldest or Adaptive shedding |
//! | [`TaskHandle`] | Await, inspect or cancel an admitted task |
//! | [`BackpressureStats`] | Queue depth, memory and throughput counters |

mod handler;

pub use handler::{
    BackpressureConfig, BackpressureHandler, BackpressureStats, BackpressureStrategy, TaskHandle,
};
