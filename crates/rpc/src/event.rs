//! Tagged completion events flowing from endpoints to dispatcher workers.

use std::fmt;
use std::time::Instant;

use cqrpc_worker::CompletionQueue;

use crate::RequestEnvelope;

/// Opaque handle correlating a completion with the call that requested it.
///
/// `index` addresses a slot in the call arena; `generation` is unique per call
/// so an event aimed at a released call never reaches the slot's next tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
	pub(crate) index: usize,
	pub(crate) generation: u64,
}

impl Tag {
	pub(crate) const fn new(index: usize, generation: u64) -> Self {
		Self { index, generation }
	}
}

impl fmt::Display for Tag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "call#{}.{}", self.index, self.generation)
	}
}

/// Operation a completion answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
	Accept,
	Read,
	Send,
	Finish,
}

/// A freshly accepted call, handed to the ACCEPT state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
	pub method: String,
	/// The single request of a unary call; streams read theirs one by one.
	pub request: Option<RequestEnvelope>,
	pub deadline: Option<Instant>,
	pub peer: String,
}

/// Result of one registered operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
	/// A call arrived for a pending accept registration.
	Accepted(IncomingCall),
	/// One request was read from a stream.
	Read(RequestEnvelope),
	/// The client half-closed; no more requests will arrive.
	ReadDone,
	/// A response was handed to the transport.
	Sent,
	/// The trailing status was handed to the transport.
	Finished,
	/// The operation failed: transport error, cancellation, or shutdown.
	Failed(Op),
}

/// One `(tag, ok)` entry of the completion queue, plus the operation payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
	pub tag: Tag,
	pub completion: Completion,
}

impl Event {
	pub fn new(tag: Tag, completion: Completion) -> Self {
		Self { tag, completion }
	}

	/// `false` when the operation failed and the call must finish.
	pub fn ok(&self) -> bool {
		!matches!(self.completion, Completion::Failed(_))
	}
}

/// Producer side of the dispatcher's completion queue, handed to endpoints.
#[derive(Clone)]
pub struct CompletionSink {
	queue: CompletionQueue<Event>,
}

impl CompletionSink {
	pub(crate) fn new(queue: CompletionQueue<Event>) -> Self {
		Self { queue }
	}

	/// Posts one completion. Returns `false` if the queue is already closed.
	pub fn post(&self, tag: Tag, completion: Completion) -> bool {
		match self.queue.push(Event::new(tag, completion)) {
			Ok(()) => true,
			Err(_) => {
				tracing::warn!(%tag, "completion posted after queue shutdown; dropped");
				false
			}
		}
	}
}

impl fmt::Debug for CompletionSink {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CompletionSink").field("queued", &self.queue.len()).finish()
	}
}
