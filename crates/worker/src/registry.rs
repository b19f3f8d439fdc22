use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::TaskClass;

/// Snapshot for one worker thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
	pub name: String,
	pub class: TaskClass,
	pub events: u64,
	pub panics: u64,
	pub last_panic: Option<String>,
	pub exited: bool,
}

/// In-memory worker registry for status snapshots.
#[derive(Debug, Default, Clone)]
pub struct WorkerRegistry {
	inner: Arc<RwLock<HashMap<String, WorkerRecord>>>,
}

impl WorkerRegistry {
	/// Creates an empty registry.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a fresh record, replacing any previous one with the same name.
	pub fn register(&self, name: &str, class: TaskClass) {
		self.inner.write().insert(
			name.to_owned(),
			WorkerRecord {
				name: name.to_owned(),
				class,
				events: 0,
				panics: 0,
				last_panic: None,
				exited: false,
			},
		);
	}

	/// Counts one processed event.
	pub fn record_event(&self, name: &str) {
		if let Some(record) = self.inner.write().get_mut(name) {
			record.events = record.events.wrapping_add(1);
		}
	}

	/// Counts one panic caught on the worker.
	pub fn record_panic(&self, name: &str, message: Option<String>) {
		if let Some(record) = self.inner.write().get_mut(name) {
			record.panics += 1;
			record.last_panic = message;
		}
	}

	/// Marks a worker as exited.
	pub fn mark_exited(&self, name: &str) {
		if let Some(record) = self.inner.write().get_mut(name) {
			record.exited = true;
		}
	}

	/// Returns snapshots sorted by name.
	pub fn snapshots(&self) -> Vec<WorkerRecord> {
		let mut records: Vec<_> = self.inner.read().values().cloned().collect();
		records.sort_by(|a, b| a.name.cmp(&b.name));
		records
	}
}
