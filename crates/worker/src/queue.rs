use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Returned when pushing into a queue that has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("completion queue is shut down")]
pub struct QueueClosed;

/// Outcome of a bounded wait on [`CompletionQueue::next_timeout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuePoll<T> {
	/// An item was dequeued.
	Ready(T),
	/// Nothing arrived before the deadline.
	TimedOut,
	/// The queue is shut down and fully drained.
	Closed,
}

struct QueueState<T> {
	items: VecDeque<T>,
	shutdown: bool,
}

struct QueueInner<T> {
	state: Mutex<QueueState<T>>,
	ready: Condvar,
}

/// Unbounded blocking multi-producer, multi-consumer FIFO.
///
/// Producers never block. Consumers park in [`next`](Self::next) until an item
/// arrives or the queue is shut down. After shutdown, already queued items are
/// still handed out; once the queue is empty every consumer sees `None`.
/// Pushes after shutdown are rejected, so nothing is delivered after a consumer
/// has observed the closed state.
pub struct CompletionQueue<T> {
	inner: Arc<QueueInner<T>>,
}

impl<T> Clone for CompletionQueue<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T> Default for CompletionQueue<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T> CompletionQueue<T> {
	/// Creates an empty, open queue.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(QueueInner {
				state: Mutex::new(QueueState {
					items: VecDeque::new(),
					shutdown: false,
				}),
				ready: Condvar::new(),
			}),
		}
	}

	/// Enqueues one item and wakes one waiting consumer.
	pub fn push(&self, item: T) -> Result<(), QueueClosed> {
		let mut state = self.inner.state.lock();
		if state.shutdown {
			return Err(QueueClosed);
		}
		state.items.push_back(item);
		drop(state);
		self.inner.ready.notify_one();
		Ok(())
	}

	/// Blocks until an item is available. Returns `None` once shut down and drained.
	pub fn next(&self) -> Option<T> {
		let mut state = self.inner.state.lock();
		loop {
			if let Some(item) = state.items.pop_front() {
				return Some(item);
			}
			if state.shutdown {
				return None;
			}
			self.inner.ready.wait(&mut state);
		}
	}

	/// Like [`next`](Self::next), but gives up after `timeout`.
	pub fn next_timeout(&self, timeout: Duration) -> QueuePoll<T> {
		let deadline = Instant::now() + timeout;
		let mut state = self.inner.state.lock();
		loop {
			if let Some(item) = state.items.pop_front() {
				return QueuePoll::Ready(item);
			}
			if state.shutdown {
				return QueuePoll::Closed;
			}
			if self.inner.ready.wait_until(&mut state, deadline).timed_out() {
				return match state.items.pop_front() {
					Some(item) => QueuePoll::Ready(item),
					None if state.shutdown => QueuePoll::Closed,
					None => QueuePoll::TimedOut,
				};
			}
		}
	}

	/// Closes the queue and wakes every consumer.
	///
	/// Returns `true` for the call that performed the transition; repeated calls
	/// are no-ops.
	pub fn shutdown(&self) -> bool {
		let mut state = self.inner.state.lock();
		if state.shutdown {
			return false;
		}
		state.shutdown = true;
		drop(state);
		self.inner.ready.notify_all();
		true
	}

	/// Returns true once [`shutdown`](Self::shutdown) has been called.
	pub fn is_shutdown(&self) -> bool {
		self.inner.state.lock().shutdown
	}

	/// Returns current queue depth.
	pub fn len(&self) -> usize {
		self.inner.state.lock().items.len()
	}

	/// Returns `true` if no items are queued.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use std::collections::VecDeque;
	use std::sync::Barrier;
	use std::thread;

	use super::*;

	#[test]
	fn delivers_in_fifo_order() {
		let queue = CompletionQueue::new();
		for i in 0..5u32 {
			queue.push(i).unwrap();
		}
		let drained: Vec<_> = (0..5).map(|_| queue.next().unwrap()).collect();
		assert_eq!(drained, vec![0, 1, 2, 3, 4]);
	}

	#[test]
	fn shutdown_drains_then_reports_closed() {
		let queue = CompletionQueue::new();
		queue.push(10u32).unwrap();
		queue.push(20).unwrap();
		assert!(queue.shutdown());

		assert_eq!(queue.next(), Some(10));
		assert_eq!(queue.next(), Some(20));
		assert_eq!(queue.next(), None);
		// Repeated next after drain still reports closed.
		assert_eq!(queue.next(), None);
	}

	#[test]
	fn shutdown_is_idempotent() {
		let queue: CompletionQueue<u32> = CompletionQueue::new();
		assert!(queue.shutdown());
		assert!(!queue.shutdown());
		assert!(queue.is_shutdown());
	}

	#[test]
	fn push_after_shutdown_is_rejected() {
		let queue = CompletionQueue::new();
		queue.shutdown();
		assert_eq!(queue.push(1u32), Err(QueueClosed));
		assert!(queue.is_empty());
		assert_eq!(queue.next(), None);
	}

	#[test]
	fn next_blocks_until_push() {
		let queue = CompletionQueue::new();
		assert_eq!(queue.next_timeout(Duration::from_millis(20)), QueuePoll::TimedOut);

		let producer = queue.clone();
		let handle = thread::spawn(move || {
			thread::sleep(Duration::from_millis(10));
			producer.push(42u32).unwrap();
		});

		assert_eq!(queue.next(), Some(42));
		handle.join().unwrap();
	}

	#[test]
	fn shutdown_wakes_blocked_consumers() {
		let queue: CompletionQueue<u32> = CompletionQueue::new();
		let consumers: Vec<_> = (0..4)
			.map(|_| {
				let queue = queue.clone();
				thread::spawn(move || queue.next())
			})
			.collect();

		thread::sleep(Duration::from_millis(20));
		queue.shutdown();

		for consumer in consumers {
			assert_eq!(consumer.join().unwrap(), None);
		}
	}

	#[test]
	fn next_timeout_reports_closed_after_drain() {
		let queue = CompletionQueue::new();
		queue.push(7u32).unwrap();
		queue.shutdown();
		assert_eq!(queue.next_timeout(Duration::from_millis(5)), QueuePoll::Ready(7));
		assert_eq!(queue.next_timeout(Duration::from_millis(5)), QueuePoll::Closed);
	}

	#[test]
	fn multi_producer_multi_consumer_never_drops() {
		const PRODUCERS: usize = 8;
		const CONSUMERS: usize = 3;
		const ITEMS_PER_PRODUCER: usize = 500;
		let total = PRODUCERS * ITEMS_PER_PRODUCER;

		let queue = CompletionQueue::new();
		let barrier = Arc::new(Barrier::new(PRODUCERS));

		let consumers: Vec<_> = (0..CONSUMERS)
			.map(|_| {
				let queue = queue.clone();
				thread::spawn(move || {
					let mut seen = Vec::new();
					while let Some(v) = queue.next() {
						seen.push(v);
					}
					seen
				})
			})
			.collect();

		let producers: Vec<_> = (0..PRODUCERS)
			.map(|producer| {
				let queue = queue.clone();
				let barrier = Arc::clone(&barrier);
				thread::spawn(move || {
					barrier.wait();
					for seq in 0..ITEMS_PER_PRODUCER {
						queue.push((producer * ITEMS_PER_PRODUCER + seq) as u32).unwrap();
					}
				})
			})
			.collect();

		for producer in producers {
			producer.join().unwrap();
		}
		queue.shutdown();

		let mut received: Vec<u32> = consumers.into_iter().flat_map(|c| c.join().unwrap()).collect();
		assert_eq!(received.len(), total, "must receive exactly N*M items");
		received.sort_unstable();
		let expected: Vec<u32> = (0..total as u32).collect();
		assert_eq!(received, expected, "all items delivered without loss or duplication");
	}

	/// Deterministic pseudo-random number generator for reproducible stress tests.
	struct Xorshift64(u64);

	impl Xorshift64 {
		fn next_usize(&mut self, bound: usize) -> usize {
			let mut x = self.0;
			x ^= x << 13;
			x ^= x >> 7;
			x ^= x << 17;
			self.0 = x;
			(x % bound as u64) as usize
		}
	}

	#[test]
	fn stress_matches_vecdeque_model() {
		const OPS: usize = 10_000;
		let queue = CompletionQueue::new();
		let mut model = VecDeque::new();
		let mut rng = Xorshift64(0xDEAD_BEEF);

		for i in 0..OPS {
			// 55% push, 45% pop.
			if rng.next_usize(100) < 55 {
				queue.push(i as u32).unwrap();
				model.push_back(i as u32);
			} else {
				let real = match queue.next_timeout(Duration::ZERO) {
					QueuePoll::Ready(v) => Some(v),
					QueuePoll::TimedOut => None,
					QueuePoll::Closed => panic!("op {i}: queue closed unexpectedly"),
				};
				assert_eq!(real, model.pop_front(), "op {i}: pop");
			}
		}

		queue.shutdown();
		let mut remaining = Vec::new();
		while let Some(v) = queue.next() {
			remaining.push(v);
		}
		assert_eq!(remaining, model.into_iter().collect::<Vec<_>>(), "final drain mismatch");
	}
}
