//! Guards around every vault operation: the per-identity rate limiter and the
//! tamper-evident audit trail.

pub mod audit;
pub mod rate_limit;

pub use audit::{AuditEvent, AuditLogger, AuditOperation, AuditOutcome};
pub use rate_limit::{normalize_identity, RateDecision, RateLimitError, RateLimiter};
