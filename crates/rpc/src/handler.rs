//! Business-logic callback and method registration.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{HandlerError, RequestEnvelope, ResponseEnvelope};

/// Computes a response from a request.
///
/// Called synchronously on a dispatcher worker, possibly from several workers
/// at once for different calls. All lifetime and concurrency management stays
/// with the call state machine.
pub trait ServiceHandler: Send + Sync + 'static {
	fn handle(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError>;
}

impl<F> ServiceHandler for F
where
	F: Fn(RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> + Send + Sync + 'static,
{
	fn handle(&self, request: RequestEnvelope) -> Result<ResponseEnvelope, HandlerError> {
		self(request)
	}
}

/// Shape of a method's call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
	/// One request, one response.
	Unary,
	/// Bidirectional stream: one response per request, in order.
	Streaming,
}

/// Name and kind of a registered method, as advertised to endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
	pub name: Arc<str>,
	pub kind: CallKind,
}

/// A registered method: its advertised shape plus the handler serving it.
pub(crate) struct Method {
	pub(crate) info: MethodInfo,
	pub(crate) handler: Arc<dyn ServiceHandler>,
}

impl Method {
	pub(crate) fn new(name: &str, kind: CallKind, handler: Arc<dyn ServiceHandler>) -> Self {
		Self {
			info: MethodInfo { name: name.into(), kind },
			handler,
		}
	}

	pub(crate) fn name(&self) -> &str {
		&self.info.name
	}

	pub(crate) fn kind(&self) -> CallKind {
		self.info.kind
	}
}

impl fmt::Debug for Method {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Method").field("name", &self.info.name).field("kind", &self.info.kind).finish_non_exhaustive()
	}
}
