/// Execution classes used for worker scheduling and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Completion-queue threads resuming call state machines.
	Dispatch,
	/// Async network I/O that posts completions into the queue.
	Io,
}

impl TaskClass {
	pub(crate) const fn as_str(self) -> &'static str {
		match self {
			Self::Dispatch => "dispatch",
			Self::Io => "io",
		}
	}
}
