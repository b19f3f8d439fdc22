//! Worker pool draining the completion queue into call state machines.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use cqrpc_worker::{CompletionQueue, WorkerPool, WorkerRecord, WorkerRegistry};
use parking_lot::Mutex;

use crate::context::{CallEnd, CallState, CallTable};
use crate::event::{Completion, CompletionSink, Event};
use crate::handler::{CallKind, Method, MethodInfo};
use crate::machine::{CallEnv, CallStateMachine, Step};
use crate::{Endpoint, Error, Result, ServerConfig, ServiceHandler, Tag};

/// How [`Dispatcher::shutdown`] treats calls already in PROCESS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
	/// Abort in-flight calls right away.
	Immediate,
	/// Let in-flight calls finish for up to `timeout`, then abort the rest.
	Graceful { timeout: Duration },
}

/// Per-outcome call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
	pub completed: u64,
	pub handler_failed: u64,
	pub cancelled: u64,
	pub transport_failed: u64,
	/// Accept registrations torn down without a call.
	pub aborted: u64,
}

impl StatsSnapshot {
	/// Calls that reached PROCESS and then finished, whatever the outcome.
	pub fn served(&self) -> u64 {
		self.completed + self.handler_failed + self.cancelled + self.transport_failed
	}
}

#[derive(Default)]
struct Stats {
	completed: AtomicU64,
	handler_failed: AtomicU64,
	cancelled: AtomicU64,
	transport_failed: AtomicU64,
	aborted: AtomicU64,
}

impl Stats {
	fn record(&self, end: CallEnd) {
		let counter = match end {
			CallEnd::Completed => &self.completed,
			CallEnd::HandlerFailed => &self.handler_failed,
			CallEnd::Cancelled => &self.cancelled,
			CallEnd::TransportFailed => &self.transport_failed,
			CallEnd::Aborted => &self.aborted,
		};
		counter.fetch_add(1, Ordering::Relaxed);
	}

	fn snapshot(&self) -> StatsSnapshot {
		StatsSnapshot {
			completed: self.completed.load(Ordering::Relaxed),
			handler_failed: self.handler_failed.load(Ordering::Relaxed),
			cancelled: self.cancelled.load(Ordering::Relaxed),
			transport_failed: self.transport_failed.load(Ordering::Relaxed),
			aborted: self.aborted.load(Ordering::Relaxed),
		}
	}
}

/// Summary returned by [`Dispatcher::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
	/// All in-flight calls finished before the endpoint was shut down.
	pub drained: bool,
	/// Calls still registered after the workers exited; released by force.
	pub abandoned: usize,
	/// Worker threads that terminated abnormally.
	pub failed_workers: Vec<String>,
	pub stats: StatsSnapshot,
}

/// State shared by all workers.
struct Core {
	endpoint: Arc<dyn Endpoint>,
	methods: Vec<Arc<Method>>,
	table: CallTable<CallStateMachine>,
	accepting: AtomicBool,
	stats: Stats,
}

impl CallEnv for Core {
	fn endpoint(&self) -> &dyn Endpoint {
		&*self.endpoint
	}

	fn spawn_accept(&self, method: &Arc<Method>) {
		self.submit_accept(method);
	}
}

impl Core {
	/// Creates an ACCEPT-state machine for `method` and registers it.
	fn submit_accept(&self, method: &Arc<Method>) {
		if !self.accepting.load(Ordering::Acquire) {
			tracing::trace!(method = method.name(), "dispatcher.accept_skipped");
			return;
		}
		let (tag, mut machine) = self.table.reserve(|tag| CallStateMachine::new(tag, Arc::clone(method)));
		match machine.start(self) {
			Step::Pending => self.table.checkin(tag, machine, CallState::Accept),
			Step::Finished(end) => self.settle(tag, end),
		}
	}

	/// Handles one completion: restore the machine, advance it, then put it
	/// back or release it.
	fn dispatch(&self, event: Event) {
		let ok = event.ok();
		let Event { tag, completion } = event;
		let entering = matches!(completion, Completion::Accepted(_)).then_some(CallState::Process);
		let Some(mut machine) = self.table.checkout(tag, entering) else {
			tracing::debug!(%tag, ok, "dispatcher.stale_completion");
			return;
		};
		debug_assert_eq!(machine.tag(), tag);

		match machine.proceed(completion, self) {
			Step::Pending => {
				let state = machine.state();
				self.table.checkin(tag, machine, state);
			}
			Step::Finished(end) => {
				tracing::trace!(%tag, method = machine.method().name(), end = end.as_str(), "dispatcher.call_settled");
				drop(machine);
				self.settle(tag, end);
			}
		}
	}

	/// FINISH: releases transport state and the arena slot exactly once.
	fn settle(&self, tag: Tag, end: CallEnd) {
		self.endpoint.release(tag);
		if !self.table.remove(tag) {
			tracing::error!(%tag, end = end.as_str(), "dispatcher.double_release");
			return;
		}
		self.stats.record(end);
	}
}

/// Collects methods before a dispatcher starts.
#[must_use]
pub struct DispatcherBuilder {
	config: ServerConfig,
	methods: Vec<Method>,
}

impl DispatcherBuilder {
	/// Registers a one-request, one-response method.
	pub fn unary(self, name: &str, handler: impl ServiceHandler) -> Self {
		self.method(name, CallKind::Unary, Arc::new(handler))
	}

	/// Registers a bidirectional streaming method.
	pub fn streaming(self, name: &str, handler: impl ServiceHandler) -> Self {
		self.method(name, CallKind::Streaming, Arc::new(handler))
	}

	pub fn method(mut self, name: &str, kind: CallKind, handler: Arc<dyn ServiceHandler>) -> Self {
		self.methods.push(Method::new(name, kind, handler));
		self
	}

	/// Attaches `endpoint`, starts the workers, and arms one accept per method.
	///
	/// # Errors
	///
	/// Fails on invalid configuration, an empty or duplicated method table, an
	/// endpoint that refuses to attach, or worker threads that cannot spawn.
	pub fn start(self, endpoint: Arc<dyn Endpoint>) -> Result<Dispatcher> {
		self.config.validate()?;
		if self.methods.is_empty() {
			return Err(Error::NoMethods);
		}
		let mut seen = HashSet::new();
		for method in &self.methods {
			if !seen.insert(method.name()) {
				return Err(Error::DuplicateMethod(method.name().to_owned()));
			}
		}

		let infos: Vec<MethodInfo> = self.methods.iter().map(|method| method.info.clone()).collect();
		let queue = CompletionQueue::new();
		endpoint.attach(CompletionSink::new(queue.clone()), &infos)?;

		let core = Arc::new(Core {
			endpoint,
			methods: self.methods.into_iter().map(Arc::new).collect(),
			table: CallTable::new(),
			accepting: AtomicBool::new(true),
			stats: Stats::default(),
		});

		let registry = WorkerRegistry::new();
		let worker_core = Arc::clone(&core);
		let pool = match WorkerPool::start("cqrpc-dispatch", self.config.workers, queue.clone(), registry.clone(), move |event| {
			worker_core.dispatch(event)
		}) {
			Ok(pool) => pool,
			Err(error) => {
				core.endpoint.shutdown();
				queue.shutdown();
				return Err(Error::Spawn(error));
			}
		};

		for method in &core.methods {
			core.submit_accept(method);
		}
		tracing::info!(
			methods = core.methods.len(),
			workers = pool.len(),
			write_window = self.config.write_window,
			"dispatcher.started"
		);

		Ok(Dispatcher {
			core,
			queue,
			registry,
			grace: self.config.shutdown_grace(),
			shutdown: Mutex::new(ShutdownState {
				pool: Some(pool),
				report: None,
			}),
		})
	}
}

struct ShutdownState {
	pool: Option<WorkerPool>,
	report: Option<ShutdownReport>,
}

/// Running server core: one completion queue, a pool of workers, and the
/// call arena they share.
pub struct Dispatcher {
	core: Arc<Core>,
	queue: CompletionQueue<Event>,
	registry: WorkerRegistry,
	grace: Duration,
	shutdown: Mutex<ShutdownState>,
}

impl Dispatcher {
	pub fn builder(config: ServerConfig) -> DispatcherBuilder {
		DispatcherBuilder {
			config,
			methods: Vec::new(),
		}
	}

	/// Registered methods.
	pub fn methods(&self) -> Vec<MethodInfo> {
		self.core.methods.iter().map(|method| method.info.clone()).collect()
	}

	/// Live calls, including one pending accept per method.
	pub fn live_calls(&self) -> usize {
		self.core.table.len()
	}

	/// Calls past ACCEPT that have not finished.
	pub fn in_flight_calls(&self) -> usize {
		self.core.table.in_flight()
	}

	/// Waits until no call is in flight. Returns `false` on timeout.
	pub fn wait_idle(&self, timeout: Duration) -> bool {
		self.core.table.wait_idle(timeout)
	}

	pub fn stats(&self) -> StatsSnapshot {
		self.core.stats.snapshot()
	}

	pub fn workers(&self) -> Vec<WorkerRecord> {
		self.registry.snapshots()
	}

	/// Graceful shutdown using the configured grace period.
	pub fn shutdown_graceful(&self) -> ShutdownReport {
		self.shutdown(ShutdownMode::Graceful { timeout: self.grace })
	}

	/// Stops the server: the endpoint stops accepting, in-flight calls finish
	/// or are aborted, the endpoint shuts down, then the queue drains and the
	/// workers exit. Later calls return the first report.
	pub fn shutdown(&self, mode: ShutdownMode) -> ShutdownReport {
		let mut state = self.shutdown.lock();
		let Some(pool) = state.pool.take() else {
			return state.report.clone().unwrap_or_default();
		};
		tracing::info!(?mode, in_flight = self.core.table.in_flight(), "dispatcher.shutdown_started");

		self.core.accepting.store(false, Ordering::Release);
		self.core.endpoint.stop_accepting();

		let drained = match mode {
			ShutdownMode::Immediate => self.core.table.in_flight() == 0,
			ShutdownMode::Graceful { timeout } => self.core.table.wait_idle(timeout),
		};
		if !drained {
			tracing::warn!(in_flight = self.core.table.in_flight(), "dispatcher.aborting_in_flight");
		}

		self.core.endpoint.shutdown();
		self.queue.shutdown();
		let failed_workers = pool.join();

		let leftover = self.core.table.drain();
		for tag in &leftover {
			tracing::warn!(%tag, "dispatcher.call_abandoned");
			self.core.endpoint.release(*tag);
		}

		let report = ShutdownReport {
			drained,
			abandoned: leftover.len(),
			failed_workers,
			stats: self.core.stats.snapshot(),
		};
		tracing::info!(
			drained = report.drained,
			abandoned = report.abandoned,
			served = report.stats.served(),
			"dispatcher.shutdown_complete"
		);
		state.report = Some(report.clone());
		report
	}
}

impl Drop for Dispatcher {
	fn drop(&mut self) {
		self.shutdown(ShutdownMode::Immediate);
	}
}

impl fmt::Debug for Dispatcher {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Dispatcher")
			.field("methods", &self.core.methods)
			.field("live_calls", &self.core.table.len())
			.field("stats", &self.core.stats.snapshot())
			.finish_non_exhaustive()
	}
}
