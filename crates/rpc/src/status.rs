//! Call completion status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status code carried by every response and stream trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
	Ok,
	Cancelled,
	Unknown,
	InvalidArgument,
	DeadlineExceeded,
	Unimplemented,
	Internal,
	Unavailable,
}

impl StatusCode {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Ok => "ok",
			Self::Cancelled => "cancelled",
			Self::Unknown => "unknown",
			Self::InvalidArgument => "invalid_argument",
			Self::DeadlineExceeded => "deadline_exceeded",
			Self::Unimplemented => "unimplemented",
			Self::Internal => "internal",
			Self::Unavailable => "unavailable",
		}
	}
}

/// Code plus human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
	pub code: StatusCode,
	pub message: String,
}

impl Status {
	pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
		Self {
			code,
			message: message.into(),
		}
	}

	pub fn ok() -> Self {
		Self::new(StatusCode::Ok, "")
	}

	pub fn cancelled(message: impl Into<String>) -> Self {
		Self::new(StatusCode::Cancelled, message)
	}

	pub fn invalid_argument(message: impl Into<String>) -> Self {
		Self::new(StatusCode::InvalidArgument, message)
	}

	pub fn internal(message: impl Into<String>) -> Self {
		Self::new(StatusCode::Internal, message)
	}

	pub fn unavailable(message: impl Into<String>) -> Self {
		Self::new(StatusCode::Unavailable, message)
	}

	pub fn unimplemented(method: &str) -> Self {
		Self::new(StatusCode::Unimplemented, format!("unknown method: {method}"))
	}

	pub fn is_ok(&self) -> bool {
		self.code == StatusCode::Ok
	}
}

impl Default for Status {
	fn default() -> Self {
		Self::ok()
	}
}

impl fmt::Display for Status {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.message.is_empty() {
			f.write_str(self.code.as_str())
		} else {
			write!(f, "{}: {}", self.code.as_str(), self.message)
		}
	}
}
