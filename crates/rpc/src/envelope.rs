//! Request and response records exchanged with handlers and clients.

use serde::{Deserialize, Serialize};

use crate::Status;

/// One RPC input message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
	pub id: u64,
	pub payload: Vec<u8>,
}

impl RequestEnvelope {
	pub fn new(id: u64, payload: impl Into<Vec<u8>>) -> Self {
		Self {
			id,
			payload: payload.into(),
		}
	}

	/// Returns the payload as UTF-8, if it is valid.
	pub fn payload_str(&self) -> Option<&str> {
		std::str::from_utf8(&self.payload).ok()
	}
}

/// One RPC output message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
	pub id: u64,
	pub payload: Vec<u8>,
	pub status: Status,
}

impl ResponseEnvelope {
	/// Successful response.
	pub fn ok(id: u64, payload: impl Into<Vec<u8>>) -> Self {
		Self {
			id,
			payload: payload.into(),
			status: Status::ok(),
		}
	}

	/// Payload-less response carrying only a status.
	pub fn from_status(id: u64, status: Status) -> Self {
		Self {
			id,
			payload: Vec::new(),
			status,
		}
	}

	pub fn is_ok(&self) -> bool {
		self.status.is_ok()
	}

	/// Returns the payload as UTF-8, if it is valid.
	pub fn payload_str(&self) -> Option<&str> {
		std::str::from_utf8(&self.payload).ok()
	}
}
