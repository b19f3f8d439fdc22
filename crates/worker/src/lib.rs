//! Worker runtime primitives for the cqrpc dispatcher.
//!
//! * [`CompletionQueue`]: blocking FIFO of completion events that drains on shutdown
//! * [`WorkerPool`]: fixed set of named OS threads pulling from one queue
//! * [`spawn`]: async I/O tasks on the shared Tokio runtime
//! * [`WorkerRegistry`]: per-thread status snapshots

mod class;
mod panic;
mod pool;
mod queue;
mod registry;
mod spawn;

pub use class::TaskClass;
pub use panic::panic_message;
pub use pool::WorkerPool;
pub use queue::{CompletionQueue, QueueClosed, QueuePoll};
pub use registry::{WorkerRecord, WorkerRegistry};
pub use spawn::{spawn, spawn_named_thread};
