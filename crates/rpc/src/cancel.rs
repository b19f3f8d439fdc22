//! Per-call cancellation flag.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::Status;

/// Why a call was cancelled. Only the first reason sticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
	/// The client cancelled or disconnected.
	ClientCancelled,
	/// The call outlived its deadline.
	DeadlineExceeded,
	/// The server is shutting down.
	Shutdown,
}

impl CancelReason {
	const fn code(self) -> u8 {
		match self {
			Self::ClientCancelled => 1,
			Self::DeadlineExceeded => 2,
			Self::Shutdown => 3,
		}
	}

	const fn from_code(code: u8) -> Option<Self> {
		match code {
			1 => Some(Self::ClientCancelled),
			2 => Some(Self::DeadlineExceeded),
			3 => Some(Self::Shutdown),
			_ => None,
		}
	}

	/// Status reported to the client for this reason.
	pub fn status(self) -> Status {
		match self {
			Self::ClientCancelled => Status::cancelled("client cancelled, abandoning"),
			Self::DeadlineExceeded => Status::new(crate::StatusCode::DeadlineExceeded, "deadline exceeded, abandoning"),
			Self::Shutdown => Status::unavailable("server shutting down"),
		}
	}
}

/// Cancellation flag shared between a call's state machine and its transport.
///
/// The transport sets it; the state machine checks it at PROCESS entry and
/// before every stream iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
	reason: Arc<AtomicU8>,
}

impl CancelFlag {
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets the flag. Returns `true` if this call was the first to cancel.
	pub fn cancel(&self, reason: CancelReason) -> bool {
		self.reason.compare_exchange(0, reason.code(), Ordering::AcqRel, Ordering::Acquire).is_ok()
	}

	pub fn is_cancelled(&self) -> bool {
		self.reason.load(Ordering::Acquire) != 0
	}

	/// Returns the first recorded reason.
	pub fn reason(&self) -> Option<CancelReason> {
		CancelReason::from_code(self.reason.load(Ordering::Acquire))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::StatusCode;

	#[test]
	fn first_reason_wins() {
		let flag = CancelFlag::new();
		assert!(!flag.is_cancelled());
		assert_eq!(flag.reason(), None);

		assert!(flag.cancel(CancelReason::DeadlineExceeded));
		assert!(!flag.cancel(CancelReason::ClientCancelled));
		assert!(flag.is_cancelled());
		assert_eq!(flag.reason(), Some(CancelReason::DeadlineExceeded));
		assert_eq!(flag.reason().map(|r| r.status().code), Some(StatusCode::DeadlineExceeded));
	}

	#[test]
	fn clones_share_state() {
		let flag = CancelFlag::new();
		let transport_side = flag.clone();
		transport_side.cancel(CancelReason::ClientCancelled);
		assert!(flag.is_cancelled());
		assert_eq!(flag.reason().map(|r| r.status().code), Some(StatusCode::Cancelled));
	}
}
