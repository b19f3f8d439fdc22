//! Error types for the dispatcher, endpoints, and handlers.

use thiserror::Error;

use crate::config::ConfigError;
use crate::{Status, StatusCode, Tag};

/// Errors surfaced by dispatcher startup, endpoints, and clients.
#[derive(Debug, Error)]
pub enum Error {
	/// The listening endpoint could not be bound.
	#[error("failed to bind listening endpoint {addr}: {source}")]
	Bind {
		/// Requested listen address.
		addr: String,
		/// The underlying I/O error.
		#[source]
		source: std::io::Error,
	},

	/// Worker threads could not be spawned.
	#[error("failed to spawn dispatcher workers: {0}")]
	Spawn(#[source] std::io::Error),

	/// A dispatcher was started without any methods.
	#[error("no methods registered")]
	NoMethods,

	/// Two methods share a name.
	#[error("duplicate method: {0}")]
	DuplicateMethod(String),

	/// Socket or stream I/O failed.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	/// A frame could not be encoded or decoded.
	#[error("wire codec error: {0}")]
	Codec(#[from] postcard::Error),

	/// A peer announced a frame above the size limit.
	#[error("frame of {0} bytes exceeds limit")]
	FrameTooLarge(u32),

	/// A peer sent a frame that is not valid at this point of the call.
	#[error("unexpected frame: {0}")]
	UnexpectedFrame(&'static str),

	/// The endpoint refused to attach.
	#[error("endpoint error: {0}")]
	Endpoint(#[from] EndpointError),

	/// Configuration could not be loaded.
	#[error(transparent)]
	Config(#[from] ConfigError),

	/// The server ended the call with a non-OK status.
	#[error("call failed: {0}")]
	Status(Status),
}

/// Result type for dispatcher and endpoint operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a [`ServiceHandler`](crate::ServiceHandler).
///
/// Unary calls always turn the error into an error-status response. On a
/// stream, a non-fatal error is written as an error-status response for that
/// item and the loop continues; a fatal error ends the stream with its status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}")]
pub struct HandlerError {
	status: Status,
	fatal: bool,
}

impl HandlerError {
	pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
		Self {
			status: Status::new(code, message),
			fatal: false,
		}
	}

	pub fn invalid_argument(message: impl Into<String>) -> Self {
		Self::new(StatusCode::InvalidArgument, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(StatusCode::Internal, message)
	}

	/// Marks the error as ending the whole stream.
	#[must_use]
	pub fn fatal(mut self) -> Self {
		self.fatal = true;
		self
	}

	pub fn is_fatal(&self) -> bool {
		self.fatal
	}

	pub fn status(&self) -> &Status {
		&self.status
	}

	pub fn into_status(self) -> Status {
		self.status
	}
}

/// Registration refused by an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
	/// The endpoint stopped accepting or was shut down.
	#[error("endpoint is shut down")]
	Closed,
	/// The endpoint already feeds another dispatcher.
	#[error("endpoint is already attached")]
	AlreadyAttached,
	/// The method was not announced when the endpoint was attached.
	#[error("method not attached: {0}")]
	UnknownMethod(String),
	/// No call is bound to the tag.
	#[error("no call bound to {0}")]
	UnknownCall(Tag),
}
