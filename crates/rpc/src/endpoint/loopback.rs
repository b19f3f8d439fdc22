//! In-process endpoint with a blocking client API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::Endpoint;
use super::hub::{CallHub, CallPipe, StreamItem};
use crate::cancel::{CancelFlag, CancelReason};
use crate::event::CompletionSink;
use crate::handler::{CallKind, MethodInfo};
use crate::{EndpointError, RequestEnvelope, ResponseEnvelope, ServerConfig, Status, Tag};

/// Endpoint whose clients live in the same process.
///
/// Used by tests and embedders that want the dispatcher without sockets.
pub struct LoopbackEndpoint {
	hub: CallHub,
	next_peer: AtomicU64,
}

impl LoopbackEndpoint {
	pub fn new(write_window: usize, accept_backlog: usize) -> Self {
		Self {
			hub: CallHub::new(write_window, accept_backlog),
			next_peer: AtomicU64::new(1),
		}
	}

	pub fn from_config(config: &ServerConfig) -> Self {
		Self::new(config.write_window, config.accept_backlog)
	}

	fn peer(&self) -> String {
		format!("loopback#{}", self.next_peer.fetch_add(1, Ordering::Relaxed))
	}

	/// Issues a unary call and blocks until its response.
	///
	/// Handler failures arrive as a response with a non-OK status; `Err` means
	/// the call was refused or ended without a response.
	pub fn call_unary(&self, method: &str, request: RequestEnvelope) -> Result<ResponseEnvelope, Status> {
		let mut call = self.open_unary(method, request, None)?;
		match call.recv() {
			StreamItem::Response(response) => Ok(response),
			StreamItem::End(status) => Err(status),
		}
	}

	/// Issues a unary call without waiting for its response.
	pub fn open_unary(&self, method: &str, request: RequestEnvelope, deadline: Option<Instant>) -> Result<ClientCall, Status> {
		let pipe = self.hub.connect(method, Some(request), deadline, self.peer())?;
		Ok(ClientCall::new(pipe))
	}

	/// Opens a bidirectional stream.
	pub fn open_stream(&self, method: &str, deadline: Option<Instant>) -> Result<ClientCall, Status> {
		let pipe = self.hub.connect(method, None, deadline, self.peer())?;
		Ok(ClientCall::new(pipe))
	}

	/// Accept registrations currently waiting for a call to `method`.
	pub fn pending_accepts(&self, method: &str) -> usize {
		self.hub.pending_accepts(method)
	}

	/// Calls to `method` parked until an accept is registered.
	pub fn waiting_calls(&self, method: &str) -> usize {
		self.hub.waiting_calls(method)
	}

	/// Calls bound to a server-side state machine and not yet released.
	pub fn bound_calls(&self) -> usize {
		self.hub.bound_calls()
	}
}

impl Default for LoopbackEndpoint {
	fn default() -> Self {
		Self::from_config(&ServerConfig::default())
	}
}

impl Endpoint for LoopbackEndpoint {
	fn attach(&self, sink: CompletionSink, methods: &[MethodInfo]) -> Result<(), EndpointError> {
		self.hub.attach(sink, methods)
	}

	fn register_accept(&self, tag: Tag, method: &str, cancel: CancelFlag) -> Result<(), EndpointError> {
		self.hub.register_accept(tag, method, cancel)
	}

	fn register_read(&self, tag: Tag) -> Result<(), EndpointError> {
		self.hub.register_read(tag)
	}

	fn register_send(&self, tag: Tag, response: ResponseEnvelope) -> Result<(), EndpointError> {
		self.hub.register_send(tag, response)
	}

	fn register_finish(&self, tag: Tag, status: Status) -> Result<(), EndpointError> {
		self.hub.register_finish(tag, status)
	}

	fn release(&self, tag: Tag) {
		self.hub.release(tag);
	}

	fn stop_accepting(&self) {
		self.hub.stop_accepting();
	}

	fn shutdown(&self) {
		self.hub.shutdown();
	}
}

/// Client handle of one loopback call. Dropping an unfinished call cancels it.
pub struct ClientCall {
	pipe: Arc<CallPipe>,
	done: bool,
}

impl ClientCall {
	fn new(pipe: Arc<CallPipe>) -> Self {
		Self { pipe, done: false }
	}

	/// Sends one request on a stream.
	pub fn send(&self, request: RequestEnvelope) -> Result<(), Status> {
		self.pipe.client_send(request)
	}

	/// Signals that no more requests follow.
	pub fn close_send(&self) {
		self.pipe.client_close_send();
	}

	/// Blocks until the next response or the end of the call.
	pub fn recv(&mut self) -> StreamItem {
		loop {
			if let Some(item) = self.pipe.recv_blocking(None) {
				self.observe(&item);
				return item;
			}
		}
	}

	/// Like [`recv`](Self::recv), giving up after `timeout`.
	pub fn recv_timeout(&mut self, timeout: Duration) -> Option<StreamItem> {
		let item = self.pipe.recv_blocking(Some(timeout))?;
		self.observe(&item);
		Some(item)
	}

	/// Half-closes, then collects the remaining responses and the final status.
	pub fn finish(mut self) -> (Vec<ResponseEnvelope>, Status) {
		self.close_send();
		let mut responses = Vec::new();
		loop {
			match self.recv() {
				StreamItem::Response(response) => {
					let unary = self.done;
					responses.push(response);
					if unary {
						return (responses, Status::ok());
					}
				}
				StreamItem::End(status) => return (responses, status),
			}
		}
	}

	/// Cancels the call. Responses not yet received are discarded.
	pub fn cancel(&mut self) {
		if !self.done {
			self.pipe.abort(CancelReason::ClientCancelled);
			self.done = true;
		}
	}

	/// Whether the call has ended from this side.
	pub fn is_done(&self) -> bool {
		self.done
	}

	fn observe(&mut self, item: &StreamItem) {
		match item {
			StreamItem::End(_) => self.done = true,
			StreamItem::Response(_) if self.pipe.kind() == CallKind::Unary => self.done = true,
			StreamItem::Response(_) => {}
		}
	}
}

impl Drop for ClientCall {
	fn drop(&mut self) {
		self.cancel();
	}
}

impl std::fmt::Debug for ClientCall {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ClientCall").field("kind", &self.pipe.kind()).field("done", &self.done).finish()
	}
}
