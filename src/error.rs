use std::path::PathBuf;
use thiserror::Error;

/// Typed failures produced by the bounded-operation engine. Usage errors are
/// surfaced immediately and never retried; transient I/O is retried inside the
/// write pipeline until the attempt budget runs out; verification mismatches
/// are always fatal.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("{0}")]
	Usage(String),
	#[error("continuation token not found or expired")]
	TokenNotFound,
	#[error(
		"continuation token was issued for {token_operation} on {token_target}, not {operation} on {target}"
	)]
	TokenMismatch {
		token_operation: &'static str,
		token_target: String,
		operation: &'static str,
		target: String,
	},
	#[error(
		"insufficient disk space for {}: {required} bytes required, {available} available",
		.path.display()
	)]
	InsufficientSpace {
		path: PathBuf,
		required: u64,
		available: u64,
	},
	#[error("write failed after {attempts} attempt(s): {source}")]
	WriteFailed {
		attempts: u32,
		#[source]
		source: std::io::Error,
	},
	#[error(
		"verification failed for {}: expected {expected} bytes, found {actual}",
		.path.display()
	)]
	Verification {
		path: PathBuf,
		expected: u64,
		actual: u64,
	},
}

impl EngineError {
	pub fn usage(message: impl Into<String>) -> Self {
		Self::Usage(message.into())
	}

	pub fn code(&self) -> &'static str {
		match self {
			EngineError::Usage(_) => "USAGE_ERROR",
			EngineError::TokenNotFound => "TOKEN_NOT_FOUND",
			EngineError::TokenMismatch { .. } => "TOKEN_MISMATCH",
			EngineError::InsufficientSpace { .. } => "NO_SPACE",
			EngineError::WriteFailed { .. } => "WRITE_FAILED",
			EngineError::Verification { .. } => "VERIFICATION_FAILED",
		}
	}
}
