//! Transport side of the dispatcher.
//!
//! An endpoint accepts calls and performs the reads and writes a call state
//! machine registers. Every registration answers with exactly one completion
//! on the attached [`CompletionSink`], tagged with the registering call.

mod hub;
mod loopback;
mod tcp;

pub use hub::StreamItem;
pub use loopback::{ClientCall, LoopbackEndpoint};
pub use tcp::TcpEndpoint;

use crate::cancel::CancelFlag;
use crate::event::CompletionSink;
use crate::handler::MethodInfo;
use crate::{EndpointError, ResponseEnvelope, Status, Tag};

/// Source of calls and sink of responses for one dispatcher.
///
/// Registration methods must not block on the network; results arrive later
/// as completions. A registration refused with an error produces no
/// completion.
pub trait Endpoint: Send + Sync + 'static {
	/// Connects the endpoint to a dispatcher's completion queue and announces
	/// the methods it serves.
	fn attach(&self, sink: CompletionSink, methods: &[MethodInfo]) -> Result<(), EndpointError>;

	/// Asks for the next call to `method`. Completes with
	/// [`Completion::Accepted`](crate::Completion::Accepted), or fails once the
	/// endpoint stops accepting. The transport sets `cancel` if the call is
	/// cancelled by the client or aborted.
	fn register_accept(&self, tag: Tag, method: &str, cancel: CancelFlag) -> Result<(), EndpointError>;

	/// Reads the next request of a stream. Completes with `Read` or `ReadDone`.
	fn register_read(&self, tag: Tag) -> Result<(), EndpointError>;

	/// Writes one response. Completes with `Sent` once the transport has room.
	fn register_send(&self, tag: Tag, response: ResponseEnvelope) -> Result<(), EndpointError>;

	/// Ends a stream with its trailing status. Completes with `Finished`.
	fn register_finish(&self, tag: Tag, status: Status) -> Result<(), EndpointError>;

	/// Drops all transport state for a finished call.
	fn release(&self, tag: Tag);

	/// Stops taking new calls. Pending accepts complete as failed.
	fn stop_accepting(&self);

	/// Aborts every remaining call. Outstanding registrations complete as failed.
	fn shutdown(&self);
}
