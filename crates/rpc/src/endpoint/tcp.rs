//! TCP endpoint: one call per connection, framed with [`crate::wire`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cqrpc_worker::TaskClass;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::Endpoint;
use super::hub::{CallHub, CallPipe, StreamItem};
use crate::cancel::{CancelFlag, CancelReason};
use crate::event::CompletionSink;
use crate::handler::{CallKind, MethodInfo};
use crate::wire::{Frame, read_frame, write_frame};
use crate::{EndpointError, Error, RequestEnvelope, ResponseEnvelope, Result, ServerConfig, Status, Tag};

/// Listening endpoint serving calls over TCP.
///
/// The socket is bound synchronously so address errors surface at startup;
/// connections are served on the shared I/O runtime.
pub struct TcpEndpoint {
	hub: Arc<CallHub>,
	local_addr: SocketAddr,
	stop: CancellationToken,
}

impl TcpEndpoint {
	/// Binds `addr` and starts accepting connections.
	///
	/// # Errors
	///
	/// Returns [`Error::Bind`] if the address is unavailable.
	pub fn bind(addr: SocketAddr, write_window: usize, accept_backlog: usize) -> Result<Self> {
		let listener = std::net::TcpListener::bind(addr).map_err(|source| Error::Bind {
			addr: addr.to_string(),
			source,
		})?;
		listener.set_nonblocking(true)?;
		let local_addr = listener.local_addr()?;

		let hub = Arc::new(CallHub::new(write_window, accept_backlog));
		let stop = CancellationToken::new();
		cqrpc_worker::spawn(TaskClass::Io, accept_loop(listener, Arc::clone(&hub), stop.clone()));

		Ok(Self { hub, local_addr, stop })
	}

	pub fn from_config(config: &ServerConfig) -> Result<Self> {
		Self::bind(config.listen, config.write_window, config.accept_backlog)
	}

	/// The bound address; resolves port 0 to the port actually assigned.
	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}
}

impl Drop for TcpEndpoint {
	fn drop(&mut self) {
		self.stop.cancel();
	}
}

impl Endpoint for TcpEndpoint {
	fn attach(&self, sink: CompletionSink, methods: &[MethodInfo]) -> std::result::Result<(), EndpointError> {
		self.hub.attach(sink, methods)
	}

	fn register_accept(&self, tag: Tag, method: &str, cancel: CancelFlag) -> std::result::Result<(), EndpointError> {
		self.hub.register_accept(tag, method, cancel)
	}

	fn register_read(&self, tag: Tag) -> std::result::Result<(), EndpointError> {
		self.hub.register_read(tag)
	}

	fn register_send(&self, tag: Tag, response: ResponseEnvelope) -> std::result::Result<(), EndpointError> {
		self.hub.register_send(tag, response)
	}

	fn register_finish(&self, tag: Tag, status: Status) -> std::result::Result<(), EndpointError> {
		self.hub.register_finish(tag, status)
	}

	fn release(&self, tag: Tag) {
		self.hub.release(tag);
	}

	fn stop_accepting(&self) {
		self.stop.cancel();
		self.hub.stop_accepting();
	}

	fn shutdown(&self) {
		self.stop.cancel();
		self.hub.shutdown();
	}
}

async fn accept_loop(listener: std::net::TcpListener, hub: Arc<CallHub>, stop: CancellationToken) {
	let listener = match TcpListener::from_std(listener) {
		Ok(listener) => listener,
		Err(error) => {
			tracing::error!(%error, "endpoint.listener_failed");
			return;
		}
	};
	if let Ok(addr) = listener.local_addr() {
		tracing::info!(%addr, "endpoint.listening");
	}

	loop {
		tokio::select! {
			_ = stop.cancelled() => {
				tracing::info!("endpoint.accept_loop_stopped");
				break;
			}
			res = listener.accept() => {
				match res {
					Ok((stream, peer)) => {
						cqrpc_worker::spawn(TaskClass::Io, serve_connection(stream, peer, Arc::clone(&hub), stop.clone()));
					}
					Err(error) => {
						tracing::error!(%error, "endpoint.accept_failed");
					}
				}
			}
		}
	}
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, hub: Arc<CallHub>, stop: CancellationToken) {
	tracing::debug!(%peer, "connection.opened");
	if let Err(error) = stream.set_nodelay(true) {
		tracing::debug!(%peer, %error, "connection.nodelay_failed");
	}
	let (reader, mut writer) = stream.into_split();
	if let Err(error) = serve_call(reader, &mut writer, peer, &hub, &stop).await {
		tracing::debug!(%peer, %error, "connection.error");
	}
	tracing::debug!(%peer, "connection.closed");
}

/// A call as announced by the client, before it reaches the hub.
struct Opening {
	method: String,
	request: Option<RequestEnvelope>,
	deadline: Option<Instant>,
}

async fn serve_call(mut reader: OwnedReadHalf, writer: &mut OwnedWriteHalf, peer: SocketAddr, hub: &CallHub, stop: &CancellationToken) -> Result<()> {
	let opening = tokio::select! {
		() = stop.cancelled() => {
			tracing::debug!(%peer, "connection.refused_at_shutdown");
			return write_frame(writer, &Frame::Status(CancelReason::Shutdown.status())).await;
		}
		opening = read_opening(&mut reader, hub) => opening?,
	};
	let Some(Opening { method, request, deadline }) = opening else {
		return Ok(());
	};

	let pipe = match hub.connect(&method, request, deadline, peer.to_string()) {
		Ok(pipe) => pipe,
		Err(status) => {
			tracing::debug!(%peer, %method, %status, "connection.call_refused");
			return write_frame(writer, &Frame::Status(status)).await;
		}
	};

	let requests = cqrpc_worker::spawn(TaskClass::Io, pump_requests(reader, Arc::clone(&pipe)));
	let result = pump_responses(writer, &pipe, deadline).await;
	requests.abort();
	if result.is_err() {
		pipe.abort(CancelReason::ClientCancelled);
	}
	result
}

/// Reads `Open` and, for unary methods, the single request. `None` when the
/// client leaves first.
async fn read_opening(reader: &mut OwnedReadHalf, hub: &CallHub) -> Result<Option<Opening>> {
	let Some(frame) = read_frame(reader).await? else {
		return Ok(None);
	};
	let Frame::Open { method, timeout_ms } = frame else {
		return Err(Error::UnexpectedFrame(frame.name()));
	};
	let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

	let request = match hub.method_kind(&method) {
		Some(CallKind::Unary) => match read_frame(reader).await? {
			Some(Frame::Request(request)) => Some(request),
			Some(Frame::Cancel) | None => return Ok(None),
			Some(other) => return Err(Error::UnexpectedFrame(other.name())),
		},
		_ => None,
	};
	Ok(Some(Opening { method, request, deadline }))
}

/// Feeds client frames into the pipe until the client cancels or goes away.
async fn pump_requests(mut reader: OwnedReadHalf, pipe: Arc<CallPipe>) {
	loop {
		match read_frame(&mut reader).await {
			Ok(Some(Frame::Request(request))) => {
				if let Err(status) = pipe.client_send(request) {
					tracing::trace!(%status, "connection.request_dropped");
				}
			}
			Ok(Some(Frame::HalfClose)) => pipe.client_close_send(),
			Ok(Some(Frame::Cancel) | None) => {
				pipe.abort(CancelReason::ClientCancelled);
				return;
			}
			Ok(Some(other)) => {
				tracing::warn!(frame = other.name(), "connection.unexpected_frame");
				pipe.abort(CancelReason::ClientCancelled);
				return;
			}
			Err(error) => {
				tracing::debug!(%error, "connection.read_failed");
				pipe.abort(CancelReason::ClientCancelled);
				return;
			}
		}
	}
}

/// Writes responses until the call ends, enforcing the deadline.
async fn pump_responses(writer: &mut OwnedWriteHalf, pipe: &CallPipe, deadline: Option<Instant>) -> Result<()> {
	let mut expired = deadline.is_none();
	let expiry = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now)));
	tokio::pin!(expiry);

	loop {
		let item = tokio::select! {
			item = pipe.recv() => item,
			() = &mut expiry, if !expired => {
				expired = true;
				pipe.abort(CancelReason::DeadlineExceeded);
				continue;
			}
		};
		match item {
			StreamItem::Response(response) => {
				write_frame(writer, &Frame::Response(response)).await?;
				if pipe.kind() == CallKind::Unary {
					return Ok(());
				}
			}
			StreamItem::End(status) => return write_frame(writer, &Frame::Status(status)).await,
		}
	}
}
