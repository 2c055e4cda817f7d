//! Error types shared by every broker adapter.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by broker operations.
///
/// Every transport failure is classified into one of these kinds before it
/// reaches the caller; adapters never return transport-library error types
/// directly.
#[derive(Debug, Error)]
pub enum BrokerError {
	/// Transport unreachable or connection in a non-operable state
	#[error("connection error: {0}")]
	Connection(String),

	/// Backend rejected a request as malformed or disallowed
	#[error("protocol error: {0}")]
	Protocol(String),

	/// An acknowledgement-bearing operation did not settle in time
	#[error("acknowledgement not received within {0:?}")]
	Timeout(Duration),

	/// Payload could not be encoded per the configured encoding
	#[error("serialization error: {0}")]
	Serialization(String),

	/// Operation attempted after `close()`
	#[error("broker is closed")]
	Closed,
}

impl BrokerError {
	/// Classify a failure as a connection-level error.
	pub fn connection(message: impl Into<String>) -> Self {
		Self::Connection(message.into())
	}

	/// Classify a failure as a backend rejection.
	pub fn protocol(message: impl Into<String>) -> Self {
		Self::Protocol(message.into())
	}

	/// Classify a failure as an encoding error.
	pub fn serialization(message: impl Into<String>) -> Self {
		Self::Serialization(message.into())
	}

	/// Whether this error was caused by calling into a closed broker.
	pub fn is_closed(&self) -> bool {
		matches!(self, Self::Closed)
	}
}

impl From<serde_json::Error> for BrokerError {
	fn from(err: serde_json::Error) -> Self {
		Self::Serialization(err.to_string())
	}
}

/// Result type alias for operations that may fail with [`BrokerError`]
pub type Result<T> = std::result::Result<T, BrokerError>;
