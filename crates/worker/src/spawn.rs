use std::future::Future;
use std::sync::OnceLock;

use tokio::task::JoinHandle;

use crate::TaskClass;

/// Returns the ambient Tokio handle, or a lazily built shared runtime when the
/// caller is not inside one (plain worker threads, blocking tests).
fn runtime_handle() -> tokio::runtime::Handle {
	if let Ok(handle) = tokio::runtime::Handle::try_current() {
		return handle;
	}

	static GLOBAL_RT: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
	let runtime = GLOBAL_RT.get_or_init(|| {
		tokio::runtime::Builder::new_multi_thread()
			.enable_all()
			.worker_threads(2)
			.thread_name("cqrpc-io")
			.build()
			.expect("failed to build cqrpc global tokio runtime")
	});
	runtime.handle().clone()
}

/// Spawns an async task with worker classification metadata.
pub fn spawn<F>(class: TaskClass, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(worker_class = class.as_str(), "worker.spawn");
	runtime_handle().spawn(fut)
}

/// Spawns a dedicated named OS thread with worker classification metadata.
pub fn spawn_named_thread<F, R>(class: TaskClass, name: impl Into<String>, f: F) -> std::io::Result<std::thread::JoinHandle<R>>
where
	F: FnOnce() -> R + Send + 'static,
	R: Send + 'static,
{
	let name = name.into();
	tracing::trace!(worker_class = class.as_str(), thread = %name, "worker.spawn_named_thread");
	std::thread::Builder::new().name(name).spawn(f)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn spawn_outside_runtime_uses_shared_runtime() {
		let handle = spawn(TaskClass::Io, async { 21 * 2 });
		let value = runtime_handle().block_on(handle).unwrap();
		assert_eq!(value, 42);
	}

	#[test]
	fn named_thread_carries_name() {
		let handle = spawn_named_thread(TaskClass::Dispatch, "cq-test-0", || std::thread::current().name().map(str::to_owned)).unwrap();
		assert_eq!(handle.join().unwrap().as_deref(), Some("cq-test-0"));
	}
}
