use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Configuration key or field that caused the error (e.g., "rules[2].path_pattern")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected shape, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "circuit_breaker", "memory_store")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Closed set of failure kinds a wrapped dependency call can report.
///
/// Circuit breakers only count failures whose kind is in their configured
/// `expected_failures` set; everything else passes through untouched so an
/// unrelated bug cannot trip the breaker for a healthy dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Could not reach the dependency (DNS, connect, TLS, socket reset).
    Connection,
    /// The dependency did not answer within its deadline.
    Timeout,
    /// The dependency answered but reported itself unhealthy (5xx, overload).
    Unavailable,
    /// The dependency throttled the call (429-style).
    RateLimited,
    /// The dependency returned a malformed or unparseable response.
    Protocol,
    /// A bug on our side of the call (bad arguments, broken invariants).
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Connection => "connection",
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "unavailable",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Protocol => "protocol",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by a wrapped dependency call, tagged with its kind.
#[derive(Debug, Clone, Error)]
#[error("dependency failure ({kind}): {message}")]
pub struct DependencyError {
    pub kind: FailureKind,
    pub message: String,
}

impl DependencyError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Connection, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, message)
    }
}

/// Unified error type for the resilience core.
///
/// Admission/policy outcomes (`CircuitOpen`, `RateLimited`,
/// `BackpressureRejected`) are always surfaced to the immediate caller;
/// translating them into transport responses (429/503, Retry-After) is the
/// job of the external web layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error("circuit '{circuit_name}' is open, next attempt at {next_attempt_time} ms")]
    CircuitOpen {
        circuit_name: String,
        /// Unix milliseconds after which the next probe will be admitted.
        next_attempt_time: u64,
    },

    #[error("circuit '{circuit_name}' call timed out after {timeout_ms} ms")]
    CircuitTimeout { circuit_name: String, timeout_ms: u64 },

    #[error("rate limit exceeded for '{limit_type}', retry after {retry_after} s")]
    RateLimited {
        /// Seconds until the denying granularity resets.
        retry_after: u64,
        /// Which granularity produced the denial ("minute", "hour", "day").
        limit_type: String,
    },

    #[error("backpressure rejected task on '{resource}': {reason}")]
    BackpressureRejected { resource: String, reason: RejectReason },

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("state store error: {message}{}", format_context(.context))]
    Store {
        message: String,
        context: ErrorContext,
    },

    #[error("configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a backpressure handler refused or abandoned a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Admission denied: queue or memory limits reached.
    AtCapacity,
    /// Evicted from the queue to make room for a newer task.
    Dropped,
    /// Cancelled by the caller before it started.
    Cancelled,
    /// Combined wait + execution time exceeded the configured timeout.
    TimedOut,
    /// The handler is shutting down.
    ShuttingDown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::AtCapacity => "at capacity",
            RejectReason::Dropped => "dropped for a newer task",
            RejectReason::Cancelled => "cancelled before start",
            RejectReason::TimedOut => "timed out",
            RejectReason::ShuttingDown => "shutting down",
        };
        f.write_str(s)
    }
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new store error with structured context
    pub fn store_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Store {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Store { context, .. }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Seconds the caller should wait before retrying, when the error carries one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// True for admission/policy refusals that are not dependency failures.
    pub fn is_admission_refusal(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. }
                | Error::RateLimited { .. }
                | Error::BackpressureRejected { .. }
        )
    }
}
