//! Per-call state and the arena that owns it between events.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use slab::Slab;

use crate::cancel::CancelFlag;
use crate::{Status, Tag};

/// Lifecycle phase of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
	/// Registered with the endpoint, waiting for a call to arrive.
	Accept,
	/// Serving the call.
	Process,
	/// Terminal; resources are released.
	Finish,
}

/// How a call ended. Every call records exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CallEnd {
	/// Response or trailer delivered with OK status.
	Completed,
	/// The handler reported an error or panicked; an error status was delivered.
	HandlerFailed,
	/// Client cancellation or deadline expiry short-circuited processing.
	Cancelled,
	/// A registered operation failed; nothing more could be delivered.
	TransportFailed,
	/// The accept registration was torn down before any call arrived.
	Aborted,
}

impl CallEnd {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Completed => "completed",
			Self::HandlerFailed => "handler_failed",
			Self::Cancelled => "cancelled",
			Self::TransportFailed => "transport_failed",
			Self::Aborted => "aborted",
		}
	}
}

/// Mutable state of one in-flight call, owned by its state machine.
#[derive(Debug)]
pub(crate) struct CallContext {
	pub(crate) tag: Tag,
	pub(crate) state: CallState,
	pub(crate) cancel: CancelFlag,
	pub(crate) deadline: Option<Instant>,
	pub(crate) peer: String,
	pub(crate) reads: usize,
	pub(crate) writes: usize,
	/// End reason decided before the final completion arrives.
	pub(crate) pending_end: Option<CallEnd>,
}

impl CallContext {
	pub(crate) fn new(tag: Tag) -> Self {
		Self {
			tag,
			state: CallState::Accept,
			cancel: CancelFlag::new(),
			deadline: None,
			peer: String::new(),
			reads: 0,
			writes: 0,
			pending_end: None,
		}
	}

	/// Cancellation check point. Expired deadlines are folded into the flag.
	pub(crate) fn check_cancelled(&self) -> Option<Status> {
		if let Some(deadline) = self.deadline
			&& Instant::now() >= deadline
		{
			self.cancel.cancel(crate::CancelReason::DeadlineExceeded);
		}
		self.cancel.reason().map(|reason| reason.status())
	}
}

struct Slot<M> {
	generation: u64,
	state: CallState,
	/// `None` while a worker has the machine checked out.
	machine: Option<Box<M>>,
}

struct TableState<M> {
	slots: Slab<Slot<M>>,
	next_generation: u64,
}

/// Arena mapping tags to call state machines.
///
/// A machine is checked out by exactly one worker while it runs; a second
/// checkout of the same tag waits until it is checked back in. Slots are
/// reused, but each tag carries a fresh generation, so stale tags miss.
pub(crate) struct CallTable<M> {
	state: Mutex<TableState<M>>,
	changed: Condvar,
}

impl<M> Default for CallTable<M> {
	fn default() -> Self {
		Self {
			state: Mutex::new(TableState {
				slots: Slab::new(),
				next_generation: 1,
			}),
			changed: Condvar::new(),
		}
	}
}

impl<M> CallTable<M> {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	/// Inserts a machine built for its new tag. The slot starts checked out
	/// by the caller, who must [`checkin`](Self::checkin) or [`remove`](Self::remove) it.
	pub(crate) fn reserve(&self, make: impl FnOnce(Tag) -> M) -> (Tag, Box<M>) {
		let mut state = self.state.lock();
		let generation = state.next_generation;
		state.next_generation += 1;
		let entry = state.slots.vacant_entry();
		let tag = Tag::new(entry.key(), generation);
		entry.insert(Slot {
			generation,
			state: CallState::Accept,
			machine: None,
		});
		(tag, Box::new(make(tag)))
	}

	/// Takes the machine for `tag`, waiting while another worker holds it.
	/// Returns `None` for unknown or released tags.
	///
	/// `entering` is recorded as the slot's state for as long as the machine
	/// is held, so a call leaving ACCEPT counts as in flight from the moment
	/// a worker picks it up.
	pub(crate) fn checkout(&self, tag: Tag, entering: Option<CallState>) -> Option<Box<M>> {
		let mut state = self.state.lock();
		loop {
			let slot = state.slots.get_mut(tag.index).filter(|slot| slot.generation == tag.generation)?;
			if let Some(machine) = slot.machine.take() {
				if let Some(entering) = entering {
					slot.state = entering;
				}
				return Some(machine);
			}
			self.changed.wait(&mut state);
		}
	}

	/// Returns a checked-out machine to its slot.
	pub(crate) fn checkin(&self, tag: Tag, machine: Box<M>, call_state: CallState) {
		let mut state = self.state.lock();
		match state.slots.get_mut(tag.index).filter(|slot| slot.generation == tag.generation) {
			Some(slot) => {
				slot.state = call_state;
				slot.machine = Some(machine);
			}
			None => tracing::error!(%tag, "checkin for a released call"),
		}
		drop(state);
		self.changed.notify_all();
	}

	/// Releases the slot. Returns `false` if it was already released.
	pub(crate) fn remove(&self, tag: Tag) -> bool {
		let mut state = self.state.lock();
		let live = state.slots.get(tag.index).is_some_and(|slot| slot.generation == tag.generation);
		if live {
			state.slots.remove(tag.index);
		}
		drop(state);
		self.changed.notify_all();
		live
	}

	/// Releases every remaining slot and returns the tags that were live.
	pub(crate) fn drain(&self) -> Vec<Tag> {
		let mut state = self.state.lock();
		let tags: Vec<Tag> = state.slots.iter().map(|(index, slot)| Tag::new(index, slot.generation)).collect();
		state.slots.clear();
		drop(state);
		self.changed.notify_all();
		tags
	}

	/// Number of live calls, including those waiting in ACCEPT.
	pub(crate) fn len(&self) -> usize {
		self.state.lock().slots.len()
	}

	/// Number of calls past ACCEPT. Accept registrations being set up or
	/// torn down do not count.
	pub(crate) fn in_flight(&self) -> usize {
		Self::count_in_flight(&self.state.lock())
	}

	fn count_in_flight(state: &TableState<M>) -> usize {
		state.slots.iter().filter(|(_, slot)| slot.state != CallState::Accept).count()
	}

	/// Waits until no call is in flight. Returns `false` on timeout.
	pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut state = self.state.lock();
		while Self::count_in_flight(&state) > 0 {
			if self.changed.wait_until(&mut state, deadline).timed_out() {
				return Self::count_in_flight(&state) == 0;
			}
		}
		true
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::thread;

	use super::*;
	use crate::CancelReason;

	#[test]
	fn reserve_checkin_checkout_remove() {
		let table: CallTable<u32> = CallTable::new();
		let (tag, machine) = table.reserve(|tag| tag.index as u32 + 100);
		assert_eq!(*machine, 100);
		assert_eq!(table.len(), 1);
		assert_eq!(table.in_flight(), 0, "a fresh accept is not in flight");

		table.checkin(tag, machine, CallState::Accept);
		assert_eq!(table.in_flight(), 0);

		let machine = table.checkout(tag, None).unwrap();
		assert_eq!(table.in_flight(), 0, "accept held for teardown is not in flight");
		table.checkin(tag, machine, CallState::Accept);

		let machine = table.checkout(tag, Some(CallState::Process)).unwrap();
		assert_eq!(table.in_flight(), 1, "counted as soon as it leaves ACCEPT");
		table.checkin(tag, machine, CallState::Process);
		assert_eq!(table.in_flight(), 1);

		assert!(table.remove(tag));
		assert!(!table.remove(tag), "second release must be refused");
		assert_eq!(table.len(), 0);
		assert!(table.checkout(tag, None).is_none());
	}

	#[test]
	fn stale_tag_misses_reused_slot() {
		let table: CallTable<&'static str> = CallTable::new();
		let (old, machine) = table.reserve(|_| "old");
		drop(machine);
		assert!(table.remove(old));

		let (new, machine) = table.reserve(|_| "new");
		table.checkin(new, machine, CallState::Accept);
		assert_eq!(old.index, new.index, "slab reuses the vacant slot");
		assert_ne!(old, new);
		assert!(table.checkout(old, None).is_none());
		assert_eq!(*table.checkout(new, None).unwrap(), "new");
	}

	#[test]
	fn checkout_waits_for_checkin() {
		let table: Arc<CallTable<u32>> = Arc::new(CallTable::new());
		let (tag, machine) = table.reserve(|_| 7);

		let waiter = {
			let table = Arc::clone(&table);
			thread::spawn(move || table.checkout(tag, None).map(|m| *m))
		};
		thread::sleep(Duration::from_millis(20));
		table.checkin(tag, machine, CallState::Process);

		assert_eq!(waiter.join().unwrap(), Some(7));
	}

	#[test]
	fn wait_idle_tracks_in_flight() {
		let table: Arc<CallTable<u32>> = Arc::new(CallTable::new());
		let (tag, machine) = table.reserve(|_| 1);
		table.checkin(tag, machine, CallState::Process);
		assert!(!table.wait_idle(Duration::from_millis(10)));

		let remover = {
			let table = Arc::clone(&table);
			thread::spawn(move || {
				thread::sleep(Duration::from_millis(10));
				table.remove(tag)
			})
		};
		assert!(table.wait_idle(Duration::from_secs(5)));
		assert!(remover.join().unwrap());
	}

	#[test]
	fn expired_deadline_reads_as_cancelled() {
		let mut ctx = CallContext::new(Tag::new(0, 1));
		assert!(ctx.check_cancelled().is_none());

		ctx.deadline = Some(Instant::now() - Duration::from_millis(1));
		let status = ctx.check_cancelled().expect("deadline passed");
		assert_eq!(status.code, crate::StatusCode::DeadlineExceeded);
		assert_eq!(ctx.cancel.reason(), Some(CancelReason::DeadlineExceeded));
	}
}
