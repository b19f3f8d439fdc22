//! Per-call state machine: ACCEPT, PROCESS, FINISH.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use cqrpc_worker::panic_message;

use crate::context::{CallContext, CallEnd, CallState};
use crate::event::{Completion, IncomingCall, Op};
use crate::handler::{CallKind, Method};
use crate::{Endpoint, EndpointError, HandlerError, RequestEnvelope, ResponseEnvelope, Status, Tag};

/// What a call needs from the dispatcher while it advances.
pub(crate) trait CallEnv {
	fn endpoint(&self) -> &dyn Endpoint;

	/// Registers a fresh ACCEPT-state machine for `method`.
	fn spawn_accept(&self, method: &Arc<Method>);
}

/// Outcome of one advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
	/// An operation is registered; the machine waits for its completion.
	Pending,
	/// The machine reached FINISH and must be released.
	Finished(CallEnd),
}

/// Drives one call. Every method registers at most one endpoint operation,
/// so at most one completion for the call is ever outstanding.
#[derive(Debug)]
pub(crate) struct CallStateMachine {
	ctx: CallContext,
	method: Arc<Method>,
}

impl CallStateMachine {
	pub(crate) fn new(tag: Tag, method: Arc<Method>) -> Self {
		Self {
			ctx: CallContext::new(tag),
			method,
		}
	}

	pub(crate) fn tag(&self) -> Tag {
		self.ctx.tag
	}

	pub(crate) fn state(&self) -> CallState {
		self.ctx.state
	}

	pub(crate) fn method(&self) -> &Arc<Method> {
		&self.method
	}

	/// ACCEPT entry: asks the endpoint for the next call to this method.
	pub(crate) fn start(&mut self, env: &dyn CallEnv) -> Step {
		match env.endpoint().register_accept(self.ctx.tag, self.method.name(), self.ctx.cancel.clone()) {
			Ok(()) => Step::Pending,
			Err(err) => {
				tracing::debug!(tag = %self.ctx.tag, method = self.method.name(), error = %err, "call.accept_refused");
				self.finish(CallEnd::Aborted)
			}
		}
	}

	/// Advances on one completion.
	pub(crate) fn proceed(&mut self, completion: Completion, env: &dyn CallEnv) -> Step {
		match (self.ctx.state, completion) {
			(CallState::Accept, Completion::Accepted(call)) => self.enter_process(call, env),
			(CallState::Accept, Completion::Failed(_)) => self.finish(CallEnd::Aborted),
			(CallState::Process, completion) => match self.method.kind() {
				CallKind::Unary => self.proceed_unary(completion),
				CallKind::Streaming => self.proceed_stream(completion, env),
			},
			(state, completion) => self.unexpected(state, &completion),
		}
	}

	fn enter_process(&mut self, call: IncomingCall, env: &dyn CallEnv) -> Step {
		self.ctx.state = CallState::Process;
		self.ctx.deadline = call.deadline;
		self.ctx.peer = call.peer;

		// Re-arm before serving so the method is never left without an accept.
		env.spawn_accept(&self.method);

		tracing::debug!(tag = %self.ctx.tag, method = self.method.name(), peer = %self.ctx.peer, "call.accepted");

		let request_id = call.request.as_ref().map_or(0, |request| request.id);
		if let Some(status) = self.ctx.check_cancelled() {
			return self.abandon(request_id, status, env);
		}

		match self.method.kind() {
			CallKind::Unary => {
				let Some(request) = call.request else {
					self.ctx.pending_end = Some(CallEnd::HandlerFailed);
					let status = Status::invalid_argument("unary call carried no request");
					return self.send(ResponseEnvelope::from_status(0, status), env);
				};
				self.ctx.reads = 1;
				let response = match self.invoke(request) {
					Ok(response) => response,
					Err(err) => ResponseEnvelope::from_status(request_id, err.into_status()),
				};
				self.ctx.pending_end = Some(if response.is_ok() { CallEnd::Completed } else { CallEnd::HandlerFailed });
				self.send(response, env)
			}
			CallKind::Streaming => self.read(env),
		}
	}

	fn proceed_unary(&mut self, completion: Completion) -> Step {
		match completion {
			Completion::Sent => {
				let end = self.ctx.pending_end.unwrap_or(CallEnd::Completed);
				self.finish(end)
			}
			Completion::Failed(op) => self.failed(op),
			completion => self.unexpected(CallState::Process, &completion),
		}
	}

	fn proceed_stream(&mut self, completion: Completion, env: &dyn CallEnv) -> Step {
		match completion {
			Completion::Read(request) => {
				self.ctx.reads += 1;
				let request_id = request.id;
				if let Some(status) = self.ctx.check_cancelled() {
					return self.abandon(request_id, status, env);
				}
				match self.invoke(request) {
					Ok(response) => self.send(response, env),
					Err(err) if err.is_fatal() => {
						self.ctx.pending_end = Some(CallEnd::HandlerFailed);
						self.finish_stream(err.into_status(), env)
					}
					Err(err) => self.send(ResponseEnvelope::from_status(request_id, err.into_status()), env),
				}
			}
			Completion::Sent => match self.ctx.check_cancelled() {
				Some(status) => self.abandon(0, status, env),
				None => self.read(env),
			},
			Completion::ReadDone => {
				self.ctx.pending_end.get_or_insert(CallEnd::Completed);
				self.finish_stream(Status::ok(), env)
			}
			Completion::Finished => {
				let end = self.ctx.pending_end.unwrap_or(CallEnd::Completed);
				self.finish(end)
			}
			Completion::Failed(op) => self.failed(op),
			completion => self.unexpected(CallState::Process, &completion),
		}
	}

	/// Runs the handler, turning a panic into a fatal internal error.
	fn invoke(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
		let handler = &self.method.handler;
		let result = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
			Ok(result) => result,
			Err(payload) => {
				let message = panic_message(&*payload);
				tracing::error!(
					tag = %self.ctx.tag,
					method = self.method.name(),
					panic = message.as_deref().unwrap_or("<opaque>"),
					"handler.panicked"
				);
				Err(HandlerError::internal(format!("handler panicked: {}", message.as_deref().unwrap_or("<opaque>"))).fatal())
			}
		};
		if let Err(err) = &result {
			tracing::warn!(tag = %self.ctx.tag, method = self.method.name(), status = %err.status(), "handler.failed");
		}
		result
	}

	/// Cancelled at a check point: skip the handler and report the reason.
	fn abandon(&mut self, request_id: u64, status: Status, env: &dyn CallEnv) -> Step {
		tracing::debug!(tag = %self.ctx.tag, method = self.method.name(), status = %status, "call.abandoned");
		self.ctx.pending_end = Some(CallEnd::Cancelled);
		match self.method.kind() {
			CallKind::Unary => self.send(ResponseEnvelope::from_status(request_id, status), env),
			CallKind::Streaming => self.finish_stream(status, env),
		}
	}

	fn read(&mut self, env: &dyn CallEnv) -> Step {
		match env.endpoint().register_read(self.ctx.tag) {
			Ok(()) => Step::Pending,
			Err(err) => self.refused(Op::Read, &err),
		}
	}

	fn send(&mut self, response: ResponseEnvelope, env: &dyn CallEnv) -> Step {
		self.ctx.writes += 1;
		match env.endpoint().register_send(self.ctx.tag, response) {
			Ok(()) => Step::Pending,
			Err(err) => self.refused(Op::Send, &err),
		}
	}

	fn finish_stream(&mut self, status: Status, env: &dyn CallEnv) -> Step {
		match env.endpoint().register_finish(self.ctx.tag, status) {
			Ok(()) => Step::Pending,
			Err(err) => self.refused(Op::Finish, &err),
		}
	}

	fn refused(&mut self, op: Op, err: &EndpointError) -> Step {
		tracing::debug!(tag = %self.ctx.tag, method = self.method.name(), ?op, error = %err, "call.register_refused");
		self.failed(op)
	}

	fn failed(&mut self, op: Op) -> Step {
		let end = if self.ctx.cancel.is_cancelled() { CallEnd::Cancelled } else { CallEnd::TransportFailed };
		tracing::debug!(tag = %self.ctx.tag, method = self.method.name(), ?op, end = end.as_str(), "call.op_failed");
		self.finish(end)
	}

	fn unexpected(&mut self, state: CallState, completion: &Completion) -> Step {
		tracing::error!(tag = %self.ctx.tag, method = self.method.name(), ?state, ?completion, "call.unexpected_completion");
		self.finish(CallEnd::TransportFailed)
	}

	fn finish(&mut self, end: CallEnd) -> Step {
		self.ctx.state = CallState::Finish;
		tracing::debug!(
			tag = %self.ctx.tag,
			method = self.method.name(),
			end = end.as_str(),
			reads = self.ctx.reads,
			writes = self.ctx.writes,
			"call.finished"
		);
		Step::Finished(end)
	}
}

#[cfg(test)]
mod tests {
	use std::time::{Duration, Instant};

	use parking_lot::Mutex;

	use super::*;
	use crate::cancel::CancelFlag;
	use crate::event::CompletionSink;
	use crate::{CancelReason, MethodInfo, StatusCode};

	#[derive(Debug, Clone, PartialEq, Eq)]
	enum Registered {
		Accept(String),
		Read,
		Send(ResponseEnvelope),
		Finish(Status),
	}

	#[derive(Default)]
	struct FakeEnv {
		registered: Mutex<Vec<Registered>>,
		cancel: Mutex<Option<CancelFlag>>,
		accepts_spawned: Mutex<usize>,
		closed: bool,
	}

	impl FakeEnv {
		fn closed() -> Self {
			Self {
				closed: true,
				..Self::default()
			}
		}

		fn take(&self) -> Vec<Registered> {
			std::mem::take(&mut *self.registered.lock())
		}

		fn single(&self) -> Registered {
			let mut registered = self.take();
			assert_eq!(registered.len(), 1, "{registered:?}");
			registered.remove(0)
		}

		fn record(&self, entry: Registered) -> Result<(), EndpointError> {
			if self.closed {
				return Err(EndpointError::Closed);
			}
			self.registered.lock().push(entry);
			Ok(())
		}

		fn cancel(&self, reason: CancelReason) {
			self.cancel.lock().as_ref().expect("accept registered").cancel(reason);
		}
	}

	impl Endpoint for FakeEnv {
		fn attach(&self, _sink: CompletionSink, _methods: &[MethodInfo]) -> Result<(), EndpointError> {
			Ok(())
		}

		fn register_accept(&self, _tag: Tag, method: &str, cancel: CancelFlag) -> Result<(), EndpointError> {
			*self.cancel.lock() = Some(cancel);
			self.record(Registered::Accept(method.to_owned()))
		}

		fn register_read(&self, _tag: Tag) -> Result<(), EndpointError> {
			self.record(Registered::Read)
		}

		fn register_send(&self, _tag: Tag, response: ResponseEnvelope) -> Result<(), EndpointError> {
			self.record(Registered::Send(response))
		}

		fn register_finish(&self, _tag: Tag, status: Status) -> Result<(), EndpointError> {
			self.record(Registered::Finish(status))
		}

		fn release(&self, _tag: Tag) {}

		fn stop_accepting(&self) {}

		fn shutdown(&self) {}
	}

	impl CallEnv for FakeEnv {
		fn endpoint(&self) -> &dyn Endpoint {
			self
		}

		fn spawn_accept(&self, _method: &Arc<Method>) {
			*self.accepts_spawned.lock() += 1;
		}
	}

	fn upper(request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
		let text = request.payload_str().ok_or_else(|| HandlerError::invalid_argument("payload is not UTF-8"))?;
		Ok(ResponseEnvelope::ok(request.id, text.to_uppercase()))
	}

	fn method(kind: CallKind, handler: impl crate::ServiceHandler) -> Arc<Method> {
		Arc::new(Method::new("m", kind, Arc::new(handler)))
	}

	fn accepted(request: Option<RequestEnvelope>) -> Completion {
		Completion::Accepted(IncomingCall {
			method: "m".to_owned(),
			request,
			deadline: None,
			peer: "test".to_owned(),
		})
	}

	#[test]
	fn unary_uppercase_round() {
		let env = FakeEnv::default();
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Unary, upper));

		assert_eq!(call.start(&env), Step::Pending);
		assert_eq!(env.take(), vec![Registered::Accept("m".into())]);

		let step = call.proceed(accepted(Some(RequestEnvelope::new(1, "abc"))), &env);
		assert_eq!(step, Step::Pending);
		assert_eq!(call.state(), CallState::Process);
		assert_eq!(*env.accepts_spawned.lock(), 1, "successor armed on PROCESS entry");
		assert_eq!(env.take(), vec![Registered::Send(ResponseEnvelope::ok(1, "ABC"))]);

		assert_eq!(call.proceed(Completion::Sent, &env), Step::Finished(CallEnd::Completed));
		assert_eq!(call.state(), CallState::Finish);
	}

	#[test]
	fn unary_handler_error_becomes_status_response() {
		let env = FakeEnv::default();
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Unary, upper));
		call.start(&env);
		env.take();

		call.proceed(accepted(Some(RequestEnvelope::new(9, vec![0xff, 0xfe]))), &env);
		let Registered::Send(response) = env.single() else {
			panic!("expected a single send");
		};
		assert_eq!(response.id, 9);
		assert_eq!(response.status.code, StatusCode::InvalidArgument);
		assert_eq!(call.proceed(Completion::Sent, &env), Step::Finished(CallEnd::HandlerFailed));
	}

	#[test]
	fn handler_panic_is_internal_error() {
		let env = FakeEnv::default();
		let boom = |_: RequestEnvelope| -> Result<ResponseEnvelope, HandlerError> { panic!("boom") };
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Unary, boom));
		call.start(&env);
		env.take();

		call.proceed(accepted(Some(RequestEnvelope::new(2, "x"))), &env);
		let Registered::Send(response) = env.single() else {
			panic!("expected a single send");
		};
		assert_eq!(response.status.code, StatusCode::Internal);
		assert!(response.status.message.contains("boom"));
		assert_eq!(call.proceed(Completion::Sent, &env), Step::Finished(CallEnd::HandlerFailed));
	}

	#[test]
	fn unary_without_request_is_invalid_argument() {
		let env = FakeEnv::default();
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Unary, upper));
		call.start(&env);
		env.take();

		call.proceed(accepted(None), &env);
		let Registered::Send(response) = env.single() else {
			panic!("expected a single send");
		};
		assert_eq!(response.status.code, StatusCode::InvalidArgument);
	}

	#[test]
	fn refused_or_failed_accept_aborts() {
		let env = FakeEnv::closed();
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Unary, upper));
		assert_eq!(call.start(&env), Step::Finished(CallEnd::Aborted));

		let env = FakeEnv::default();
		let mut call = CallStateMachine::new(Tag::new(1, 2), method(CallKind::Unary, upper));
		call.start(&env);
		assert_eq!(call.proceed(Completion::Failed(Op::Accept), &env), Step::Finished(CallEnd::Aborted));
		assert_eq!(*env.accepts_spawned.lock(), 0, "aborted accept spawns no successor");
	}

	#[test]
	fn expired_deadline_skips_handler() {
		let env = FakeEnv::default();
		let never = |_: RequestEnvelope| -> Result<ResponseEnvelope, HandlerError> { panic!("handler must not run") };
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Unary, never));
		call.start(&env);
		env.take();

		let step = call.proceed(
			Completion::Accepted(IncomingCall {
				method: "m".to_owned(),
				request: Some(RequestEnvelope::new(4, "late")),
				deadline: Some(Instant::now() - Duration::from_millis(1)),
				peer: "test".to_owned(),
			}),
			&env,
		);
		assert_eq!(step, Step::Pending);
		let Registered::Send(response) = env.single() else {
			panic!("expected a single send");
		};
		assert_eq!(response.id, 4);
		assert_eq!(response.status.code, StatusCode::DeadlineExceeded);
		assert_eq!(call.proceed(Completion::Sent, &env), Step::Finished(CallEnd::Cancelled));
	}

	#[test]
	fn stream_reads_writes_and_finishes() {
		let env = FakeEnv::default();
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Streaming, upper));
		call.start(&env);
		env.take();

		call.proceed(accepted(None), &env);
		assert_eq!(env.take(), vec![Registered::Read]);

		for (id, word) in [(1, "a"), (2, "b")] {
			call.proceed(Completion::Read(RequestEnvelope::new(id, word)), &env);
			assert_eq!(env.take(), vec![Registered::Send(ResponseEnvelope::ok(id, word.to_uppercase()))]);
			call.proceed(Completion::Sent, &env);
			assert_eq!(env.take(), vec![Registered::Read]);
		}

		call.proceed(Completion::ReadDone, &env);
		assert_eq!(env.take(), vec![Registered::Finish(Status::ok())]);
		assert_eq!(call.proceed(Completion::Finished, &env), Step::Finished(CallEnd::Completed));
	}

	#[test]
	fn stream_nonfatal_error_continues_fatal_error_ends() {
		let env = FakeEnv::default();
		let picky = |request: RequestEnvelope| -> Result<ResponseEnvelope, HandlerError> {
			match request.payload_str() {
				Some("bad") => Err(HandlerError::invalid_argument("bad item")),
				Some("stop") => Err(HandlerError::internal("giving up").fatal()),
				_ => Ok(ResponseEnvelope::ok(request.id, "ok")),
			}
		};
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Streaming, picky));
		call.start(&env);
		call.proceed(accepted(None), &env);
		env.take();

		call.proceed(Completion::Read(RequestEnvelope::new(1, "bad")), &env);
		let Registered::Send(response) = env.single() else {
			panic!("expected a single send");
		};
		assert_eq!(response.status.code, StatusCode::InvalidArgument);
		call.proceed(Completion::Sent, &env);
		assert_eq!(env.take(), vec![Registered::Read]);

		call.proceed(Completion::Read(RequestEnvelope::new(2, "stop")), &env);
		assert_eq!(env.take(), vec![Registered::Finish(Status::internal("giving up"))]);
		assert_eq!(call.proceed(Completion::Finished, &env), Step::Finished(CallEnd::HandlerFailed));
	}

	#[test]
	fn stream_cancel_between_items_finishes_cancelled() {
		let env = FakeEnv::default();
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Streaming, upper));
		call.start(&env);
		call.proceed(accepted(None), &env);
		call.proceed(Completion::Read(RequestEnvelope::new(1, "a")), &env);
		env.take();

		env.cancel(CancelReason::ClientCancelled);
		call.proceed(Completion::Sent, &env);
		let Registered::Finish(status) = env.single() else {
			panic!("expected finish");
		};
		assert_eq!(status.code, StatusCode::Cancelled);
		assert_eq!(call.proceed(Completion::Failed(Op::Finish), &env), Step::Finished(CallEnd::Cancelled));
	}

	#[test]
	fn stream_cancel_after_k_reads_writes_exactly_k() {
		const KEPT: u64 = 3;
		let env = FakeEnv::default();
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Streaming, upper));
		call.start(&env);
		call.proceed(accepted(None), &env);
		env.take();

		for id in 0..KEPT {
			call.proceed(Completion::Read(RequestEnvelope::new(id, "k")), &env);
			call.proceed(Completion::Sent, &env);
		}
		let before: Vec<_> = env.take();
		let sends = before.iter().filter(|entry| matches!(entry, Registered::Send(_))).count();
		assert_eq!(sends, KEPT as usize, "{before:?}");
		assert_eq!(before.last(), Some(&Registered::Read));

		// The client cancels while the next read is already in flight.
		env.cancel(CancelReason::ClientCancelled);
		assert_eq!(call.proceed(Completion::Read(RequestEnvelope::new(KEPT, "late")), &env), Step::Pending);
		let after = env.take();
		assert!(!after.iter().any(|entry| matches!(entry, Registered::Send(_))), "{after:?}");
		assert_eq!(after, vec![Registered::Finish(CancelReason::ClientCancelled.status())]);
		assert_eq!(call.proceed(Completion::Finished, &env), Step::Finished(CallEnd::Cancelled));
	}

	#[test]
	fn failed_send_without_cancel_is_transport_failure() {
		let env = FakeEnv::default();
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Streaming, upper));
		call.start(&env);
		call.proceed(accepted(None), &env);
		call.proceed(Completion::Read(RequestEnvelope::new(1, "a")), &env);
		assert_eq!(call.proceed(Completion::Failed(Op::Send), &env), Step::Finished(CallEnd::TransportFailed));
	}

	#[test]
	fn completion_out_of_order_ends_call() {
		let env = FakeEnv::default();
		let mut call = CallStateMachine::new(Tag::new(0, 1), method(CallKind::Unary, upper));
		call.start(&env);
		assert_eq!(call.proceed(Completion::Sent, &env), Step::Finished(CallEnd::TransportFailed));
	}
}
