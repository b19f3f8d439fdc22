use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::{CompletionQueue, TaskClass, WorkerRegistry, panic_message, spawn_named_thread};

/// Fixed set of named OS threads draining one [`CompletionQueue`].
///
/// Each thread runs `handler` on one item at a time until the queue reports
/// closed. A panic escaping `handler` is caught and recorded in the registry;
/// the thread keeps serving.
#[derive(Debug)]
pub struct WorkerPool {
	name: String,
	handles: Vec<(String, JoinHandle<()>)>,
	registry: WorkerRegistry,
}

impl WorkerPool {
	/// Spawns `threads` workers named `{name}-{idx}`.
	///
	/// # Errors
	///
	/// Returns the OS error if a thread cannot be spawned. Threads started
	/// before the failure exit once `queue` is shut down.
	pub fn start<T, F>(name: &str, threads: usize, queue: CompletionQueue<T>, registry: WorkerRegistry, handler: F) -> std::io::Result<Self>
	where
		T: Send + 'static,
		F: Fn(T) + Send + Sync + 'static,
	{
		let handler = Arc::new(handler);
		let mut handles = Vec::with_capacity(threads);

		for idx in 0..threads {
			let thread_name = format!("{name}-{idx}");
			let queue = queue.clone();
			let registry = registry.clone();
			let handler = Arc::clone(&handler);
			registry.register(&thread_name, TaskClass::Dispatch);

			let worker_name = thread_name.clone();
			let handle = spawn_named_thread(TaskClass::Dispatch, thread_name.clone(), move || {
				tracing::debug!(worker = %worker_name, "worker.started");
				while let Some(item) = queue.next() {
					if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(item))) {
						let message = panic_message(&*payload);
						tracing::error!(worker = %worker_name, panic = message.as_deref().unwrap_or("<opaque>"), "worker.panicked");
						registry.record_panic(&worker_name, message);
					}
					registry.record_event(&worker_name);
				}
				registry.mark_exited(&worker_name);
				tracing::debug!(worker = %worker_name, "worker.exited");
			})?;
			handles.push((thread_name, handle));
		}

		Ok(Self {
			name: name.to_owned(),
			handles,
			registry,
		})
	}

	/// Returns the number of worker threads.
	pub fn len(&self) -> usize {
		self.handles.len()
	}

	/// Returns `true` if the pool has no threads.
	pub fn is_empty(&self) -> bool {
		self.handles.is_empty()
	}

	/// Returns the shared worker registry.
	pub fn registry(&self) -> &WorkerRegistry {
		&self.registry
	}

	/// Joins every worker. Callers must shut the queue down first or this blocks forever.
	///
	/// Returns the names of threads that terminated abnormally.
	pub fn join(self) -> Vec<String> {
		let mut failed = Vec::new();
		for (name, handle) in self.handles {
			if handle.join().is_err() {
				tracing::error!(pool = %self.name, worker = %name, "worker.join_failed");
				failed.push(name);
			}
		}
		failed
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[test]
	fn drains_queue_and_exits_on_shutdown() {
		let queue = CompletionQueue::new();
		let seen = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&seen);
		let pool = WorkerPool::start("cq-drain", 3, queue.clone(), WorkerRegistry::new(), move |n: usize| {
			counter.fetch_add(n, Ordering::SeqCst);
		})
		.unwrap();
		assert_eq!(pool.len(), 3);

		for _ in 0..100 {
			queue.push(1).unwrap();
		}
		queue.shutdown();

		let registry = pool.registry().clone();
		assert!(pool.join().is_empty());
		assert_eq!(seen.load(Ordering::SeqCst), 100);

		let snapshots = registry.snapshots();
		assert_eq!(snapshots.iter().map(|r| r.events).sum::<u64>(), 100);
		assert!(snapshots.iter().all(|r| r.exited));
	}

	#[test]
	fn panicking_handler_does_not_kill_worker() {
		let queue = CompletionQueue::new();
		let seen = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&seen);
		let pool = WorkerPool::start("cq-panic", 1, queue.clone(), WorkerRegistry::new(), move |n: u32| {
			if n == 2 {
				panic!("bad item");
			}
			counter.fetch_add(1, Ordering::SeqCst);
		})
		.unwrap();

		for n in 1..=4 {
			queue.push(n).unwrap();
		}
		queue.shutdown();

		let registry = pool.registry().clone();
		assert!(pool.join().is_empty());
		assert_eq!(seen.load(Ordering::SeqCst), 3);

		let record = &registry.snapshots()[0];
		assert_eq!(record.panics, 1);
		assert_eq!(record.last_panic.as_deref(), Some("bad item"));
		assert_eq!(record.events, 4);
	}
}
