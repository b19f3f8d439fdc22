//! Transport-neutral call bookkeeping shared by the concrete endpoints.
//!
//! The hub pairs arriving calls with pending ACCEPT registrations and owns one
//! [`CallPipe`] per bound call. A pipe buffers requests the server has not read
//! yet and responses the client has not taken yet; a send completes only while
//! the unread responses fit the write window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::cancel::{CancelFlag, CancelReason};
use crate::event::{Completion, CompletionSink, IncomingCall, Op};
use crate::handler::{CallKind, MethodInfo};
use crate::{EndpointError, RequestEnvelope, ResponseEnvelope, Status, Tag};

/// What a client observes next on a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
	/// One response, in send order.
	Response(ResponseEnvelope),
	/// The call is over; no further responses follow.
	End(Status),
}

struct PendingAccept {
	tag: Tag,
	cancel: CancelFlag,
}

struct Arrival {
	pipe: Arc<CallPipe>,
	call: IncomingCall,
}

#[derive(Default)]
struct HubState {
	sink: Option<CompletionSink>,
	methods: HashMap<Arc<str>, CallKind>,
	accepts: HashMap<Arc<str>, VecDeque<PendingAccept>>,
	waiting: HashMap<Arc<str>, VecDeque<Arrival>>,
	bound: HashMap<Tag, Arc<CallPipe>>,
	accepting: bool,
	closed: bool,
}

impl HubState {
	fn bind(&mut self, accept: PendingAccept, arrival: Arrival) {
		let Some(sink) = self.sink.clone() else {
			return;
		};
		arrival.pipe.bind(accept.tag, accept.cancel, sink.clone());
		self.bound.insert(accept.tag, arrival.pipe);
		sink.post(accept.tag, Completion::Accepted(arrival.call));
	}
}

pub(crate) struct CallHub {
	state: Mutex<HubState>,
	window: usize,
	backlog: usize,
}

impl CallHub {
	pub(crate) fn new(window: usize, backlog: usize) -> Self {
		Self {
			state: Mutex::new(HubState::default()),
			window: window.max(1),
			backlog,
		}
	}

	pub(crate) fn method_kind(&self, method: &str) -> Option<CallKind> {
		self.state.lock().methods.get(method).copied()
	}

	/// Hands a new call to a pending accept, or parks it in the backlog.
	pub(crate) fn connect(&self, method: &str, request: Option<RequestEnvelope>, deadline: Option<Instant>, peer: String) -> Result<Arc<CallPipe>, Status> {
		let mut state = self.state.lock();
		if state.closed || !state.accepting {
			return Err(Status::unavailable("server is not accepting calls"));
		}
		let Some((name, kind)) = state.methods.get_key_value(method).map(|(name, kind)| (Arc::clone(name), *kind)) else {
			return Err(Status::unimplemented(method));
		};

		let pipe = Arc::new(CallPipe::new(kind, self.window));
		let arrival = Arrival {
			pipe: Arc::clone(&pipe),
			call: IncomingCall {
				method: method.to_owned(),
				request,
				deadline,
				peer,
			},
		};

		if let Some(accept) = state.accepts.get_mut(method).and_then(VecDeque::pop_front) {
			state.bind(accept, arrival);
			return Ok(pipe);
		}

		let waiting = state.waiting.entry(name).or_default();
		if waiting.len() >= self.backlog {
			tracing::warn!(method, backlog = self.backlog, "endpoint.backlog_full");
			return Err(Status::unavailable("accept backlog full"));
		}
		waiting.push_back(arrival);
		tracing::trace!(method, waiting = waiting.len(), "endpoint.call_parked");
		Ok(pipe)
	}

	pub(crate) fn attach(&self, sink: CompletionSink, methods: &[MethodInfo]) -> Result<(), EndpointError> {
		let mut state = self.state.lock();
		if state.closed {
			return Err(EndpointError::Closed);
		}
		if state.sink.is_some() {
			return Err(EndpointError::AlreadyAttached);
		}
		state.sink = Some(sink);
		state.methods = methods.iter().map(|info| (Arc::clone(&info.name), info.kind)).collect();
		state.accepting = true;
		Ok(())
	}

	pub(crate) fn register_accept(&self, tag: Tag, method: &str, cancel: CancelFlag) -> Result<(), EndpointError> {
		let mut state = self.state.lock();
		if state.closed || !state.accepting {
			return Err(EndpointError::Closed);
		}
		let Some(name) = state.methods.get_key_value(method).map(|(name, _)| Arc::clone(name)) else {
			return Err(EndpointError::UnknownMethod(method.to_owned()));
		};

		let accept = PendingAccept { tag, cancel };
		match state.waiting.get_mut(method).and_then(VecDeque::pop_front) {
			Some(arrival) => state.bind(accept, arrival),
			None => state.accepts.entry(name).or_default().push_back(accept),
		}
		Ok(())
	}

	fn bound(&self, tag: Tag) -> Result<Arc<CallPipe>, EndpointError> {
		let state = self.state.lock();
		if state.closed {
			return Err(EndpointError::Closed);
		}
		state.bound.get(&tag).cloned().ok_or(EndpointError::UnknownCall(tag))
	}

	pub(crate) fn register_read(&self, tag: Tag) -> Result<(), EndpointError> {
		self.bound(tag)?.arm_read();
		Ok(())
	}

	pub(crate) fn register_send(&self, tag: Tag, response: ResponseEnvelope) -> Result<(), EndpointError> {
		self.bound(tag)?.send(response);
		Ok(())
	}

	pub(crate) fn register_finish(&self, tag: Tag, status: Status) -> Result<(), EndpointError> {
		self.bound(tag)?.finish(status);
		Ok(())
	}

	pub(crate) fn release(&self, tag: Tag) {
		let pipe = self.state.lock().bound.remove(&tag);
		if let Some(pipe) = pipe {
			pipe.release();
		}
	}

	/// Fails every pending accept and turns away parked calls.
	pub(crate) fn stop_accepting(&self) {
		let mut state = self.state.lock();
		if !state.accepting {
			return;
		}
		state.accepting = false;

		let accepts: Vec<PendingAccept> = state.accepts.drain().flat_map(|(_, queue)| queue).collect();
		let waiting: Vec<Arrival> = state.waiting.drain().flat_map(|(_, queue)| queue).collect();
		if let Some(sink) = &state.sink {
			for accept in &accepts {
				sink.post(accept.tag, Completion::Failed(Op::Accept));
			}
		}
		drop(state);

		for arrival in waiting {
			arrival.pipe.reject(Status::unavailable("server shutting down"));
		}
		tracing::debug!(failed_accepts = accepts.len(), "endpoint.stopped_accepting");
	}

	/// Stops accepting, then aborts every bound call.
	///
	/// Calls are aborted before registrations are refused, so a call that sees
	/// [`EndpointError::Closed`] already carries its cancellation.
	pub(crate) fn shutdown(&self) {
		self.stop_accepting();
		let pipes: Vec<Arc<CallPipe>> = {
			let state = self.state.lock();
			if state.closed {
				return;
			}
			state.bound.values().cloned().collect()
		};
		for pipe in &pipes {
			pipe.abort(CancelReason::Shutdown);
		}
		self.state.lock().closed = true;
		tracing::debug!(aborted = pipes.len(), "endpoint.shutdown");
	}

	pub(crate) fn pending_accepts(&self, method: &str) -> usize {
		self.state.lock().accepts.get(method).map_or(0, VecDeque::len)
	}

	pub(crate) fn waiting_calls(&self, method: &str) -> usize {
		self.state.lock().waiting.get(method).map_or(0, VecDeque::len)
	}

	pub(crate) fn bound_calls(&self) -> usize {
		self.state.lock().bound.len()
	}
}

struct Binding {
	tag: Tag,
	cancel: CancelFlag,
	sink: CompletionSink,
}

#[derive(Default)]
struct PipeState {
	binding: Option<Binding>,
	inbound: VecDeque<RequestEnvelope>,
	half_closed: bool,
	read_armed: bool,
	outbound: VecDeque<ResponseEnvelope>,
	send_pending: bool,
	end: Option<Status>,
	abort: Option<CancelReason>,
	released: bool,
}

impl PipeState {
	fn post(&self, completion: Completion) {
		if let Some(binding) = &self.binding {
			binding.sink.post(binding.tag, completion);
		}
	}

	fn is_over(&self) -> bool {
		self.released || self.abort.is_some() || self.end.is_some()
	}
}

/// Both directions of one call.
pub(crate) struct CallPipe {
	kind: CallKind,
	window: usize,
	state: Mutex<PipeState>,
	changed: Condvar,
	notify: Notify,
}

impl CallPipe {
	fn new(kind: CallKind, window: usize) -> Self {
		Self {
			kind,
			window,
			state: Mutex::new(PipeState::default()),
			changed: Condvar::new(),
			notify: Notify::new(),
		}
	}

	pub(crate) fn kind(&self) -> CallKind {
		self.kind
	}

	fn wake(&self) {
		self.changed.notify_all();
		self.notify.notify_waiters();
	}

	fn bind(&self, tag: Tag, cancel: CancelFlag, sink: CompletionSink) {
		let mut state = self.state.lock();
		if let Some(reason) = state.abort {
			cancel.cancel(reason);
		}
		state.binding = Some(Binding { tag, cancel, sink });
	}

	fn arm_read(&self) {
		let mut state = self.state.lock();
		if state.abort.is_some() {
			state.post(Completion::Failed(Op::Read));
		} else if let Some(request) = state.inbound.pop_front() {
			state.post(Completion::Read(request));
		} else if state.half_closed {
			state.post(Completion::ReadDone);
		} else {
			state.read_armed = true;
		}
	}

	fn send(&self, response: ResponseEnvelope) {
		let mut state = self.state.lock();
		if state.abort.is_some() {
			state.post(Completion::Failed(Op::Send));
			return;
		}
		state.outbound.push_back(response);
		if state.outbound.len() <= self.window {
			state.post(Completion::Sent);
		} else {
			state.send_pending = true;
		}
		drop(state);
		self.wake();
	}

	fn finish(&self, status: Status) {
		let mut state = self.state.lock();
		if state.abort.is_some() {
			state.post(Completion::Failed(Op::Finish));
			return;
		}
		state.end = Some(status);
		state.post(Completion::Finished);
		drop(state);
		self.wake();
	}

	fn release(&self) {
		self.state.lock().released = true;
		self.wake();
	}

	fn reject(&self, status: Status) {
		let mut state = self.state.lock();
		state.abort.get_or_insert(CancelReason::Shutdown);
		state.end.get_or_insert(status);
		drop(state);
		self.wake();
	}

	/// Ends the call from the transport side. Outstanding operations fail and
	/// buffered responses are discarded. No effect once the call is over.
	pub(crate) fn abort(&self, reason: CancelReason) {
		let mut state = self.state.lock();
		if state.is_over() {
			return;
		}
		state.abort = Some(reason);
		state.end = Some(reason.status());
		state.outbound.clear();
		if let Some(binding) = &state.binding {
			binding.cancel.cancel(reason);
		}
		if std::mem::take(&mut state.read_armed) {
			state.post(Completion::Failed(Op::Read));
		}
		if std::mem::take(&mut state.send_pending) {
			state.post(Completion::Failed(Op::Send));
		}
		drop(state);
		self.wake();
	}

	/// Queues one request for the server.
	pub(crate) fn client_send(&self, request: RequestEnvelope) -> Result<(), Status> {
		let mut state = self.state.lock();
		if let Some(end) = &state.end {
			return Err(end.clone());
		}
		if state.half_closed || state.released {
			return Err(Status::invalid_argument("request stream already closed"));
		}
		if std::mem::take(&mut state.read_armed) {
			state.post(Completion::Read(request));
		} else {
			state.inbound.push_back(request);
		}
		Ok(())
	}

	/// Half-closes the request direction.
	pub(crate) fn client_close_send(&self) {
		let mut state = self.state.lock();
		if state.half_closed {
			return;
		}
		state.half_closed = true;
		if std::mem::take(&mut state.read_armed) {
			state.post(Completion::ReadDone);
		}
	}

	pub(crate) fn try_recv(&self) -> Option<StreamItem> {
		let mut state = self.state.lock();
		if let Some(response) = state.outbound.pop_front() {
			if state.send_pending && state.outbound.len() <= self.window {
				state.send_pending = false;
				state.post(Completion::Sent);
			}
			return Some(StreamItem::Response(response));
		}
		if let Some(end) = &state.end {
			return Some(StreamItem::End(end.clone()));
		}
		state.released.then(|| StreamItem::End(Status::unavailable("call ended without status")))
	}

	/// Blocks until the next item, or until `timeout` elapses.
	pub(crate) fn recv_blocking(&self, timeout: Option<Duration>) -> Option<StreamItem> {
		let deadline = timeout.map(|timeout| Instant::now() + timeout);
		loop {
			if let Some(item) = self.try_recv() {
				return Some(item);
			}
			let mut state = self.state.lock();
			if !state.outbound.is_empty() || state.end.is_some() || state.released {
				continue;
			}
			match deadline {
				Some(deadline) => {
					if self.changed.wait_until(&mut state, deadline).timed_out() {
						drop(state);
						return self.try_recv();
					}
				}
				None => self.changed.wait(&mut state),
			}
		}
	}

	/// Resolves with the next item.
	pub(crate) async fn recv(&self) -> StreamItem {
		loop {
			let notified = self.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();
			if let Some(item) = self.try_recv() {
				return item;
			}
			notified.await;
		}
	}
}
