//! Crate-wide error types and `Result` alias.
//!
//! This is distinct from the per-node error reporting in [`crate::response::ReadResult`]: a
//! [`ReadResult`](crate::response::ReadResult) failure is about one node and never fails a
//! batch, while an [`Error`] here is about an operation that fails as a whole (construction,
//! an admin op rejected by access level, adapter plumbing outside the per-node read path).

use crate::cache::AccessLevel;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the bridge crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	SystemTime(#[from] std::time::SystemTimeError),

	#[error("validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
	#[error("operation '{operation}' requires access level {required:?}, cache is {actual:?}")]
	AccessDenied { operation: &'static str, required: AccessLevel, actual: AccessLevel },
	#[error("OPC UA adapter error: {0}")]
	Adapter(String),
	#[error("internal invariant violated: {0}")]
	InvariantViolation(String),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),

	#[cfg(feature = "metrics")]
	#[error("metrics error: {0}")]
	Metrics(String),
}

#[cfg(feature = "metrics")]
impl<T> From<metrics::SetRecorderError<T>> for Error
where
	T: std::fmt::Display,
{
	fn from(value: metrics::SetRecorderError<T>) -> Self {
		Self::Metrics(value.to_string())
	}
}
