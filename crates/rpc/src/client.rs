//! Async client for [`TcpEndpoint`](crate::TcpEndpoint).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::wire::{Frame, read_frame, write_frame};
use crate::{Error, RequestEnvelope, ResponseEnvelope, Result, Status, StreamItem};

/// Opens one connection per call.
#[derive(Debug, Clone)]
pub struct TcpClient {
	addr: SocketAddr,
	timeout: Option<Duration>,
}

impl TcpClient {
	pub fn new(addr: SocketAddr) -> Self {
		Self { addr, timeout: None }
	}

	/// Attaches a deadline of `timeout` to every call.
	#[must_use]
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	async fn open(&self, method: &str) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
		let stream = TcpStream::connect(self.addr).await?;
		stream.set_nodelay(true)?;
		let (reader, mut writer) = stream.into_split();
		let timeout_ms = self.timeout.map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
		write_frame(
			&mut writer,
			&Frame::Open {
				method: method.to_owned(),
				timeout_ms,
			},
		)
		.await?;
		Ok((reader, writer))
	}

	/// Issues a unary call.
	///
	/// # Errors
	///
	/// Returns [`Error::Status`] if the server ended the call without a
	/// response. A handler error arrives as `Ok` with a non-OK status.
	pub async fn unary(&self, method: &str, request: RequestEnvelope) -> Result<ResponseEnvelope> {
		let (mut reader, mut writer) = self.open(method).await?;
		write_frame(&mut writer, &Frame::Request(request)).await?;
		match read_frame(&mut reader).await? {
			Some(Frame::Response(response)) => Ok(response),
			Some(Frame::Status(status)) => Err(Error::Status(status)),
			Some(other) => Err(Error::UnexpectedFrame(other.name())),
			None => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
		}
	}

	/// Opens a bidirectional stream.
	pub async fn open_stream(&self, method: &str) -> Result<StreamCall> {
		let (reader, writer) = self.open(method).await?;
		Ok(StreamCall {
			reader,
			writer,
			ended: false,
		})
	}

	/// Sends every request, half-closes, and collects all responses plus the
	/// trailing status.
	pub async fn stream(&self, method: &str, requests: impl IntoIterator<Item = RequestEnvelope>) -> Result<(Vec<ResponseEnvelope>, Status)> {
		let mut call = self.open_stream(method).await?;
		for request in requests {
			call.send(request).await?;
		}
		call.close_send().await?;
		call.collect().await
	}
}

/// Client side of one streaming call over TCP.
#[derive(Debug)]
pub struct StreamCall {
	reader: OwnedReadHalf,
	writer: OwnedWriteHalf,
	ended: bool,
}

impl StreamCall {
	pub async fn send(&mut self, request: RequestEnvelope) -> Result<()> {
		write_frame(&mut self.writer, &Frame::Request(request)).await
	}

	/// Signals that no more requests follow.
	pub async fn close_send(&mut self) -> Result<()> {
		write_frame(&mut self.writer, &Frame::HalfClose).await
	}

	/// Abandons the call. The server observes a client cancellation.
	pub async fn cancel(mut self) -> Result<()> {
		write_frame(&mut self.writer, &Frame::Cancel).await
	}

	/// Waits for the next response or the trailing status.
	pub async fn recv(&mut self) -> Result<StreamItem> {
		if self.ended {
			return Err(Error::UnexpectedFrame("read after status"));
		}
		match read_frame(&mut self.reader).await? {
			Some(Frame::Response(response)) => Ok(StreamItem::Response(response)),
			Some(Frame::Status(status)) => {
				self.ended = true;
				Ok(StreamItem::End(status))
			}
			Some(other) => Err(Error::UnexpectedFrame(other.name())),
			None => Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into())),
		}
	}

	/// Reads until the trailing status.
	pub async fn collect(mut self) -> Result<(Vec<ResponseEnvelope>, Status)> {
		let mut responses = Vec::new();
		loop {
			match self.recv().await? {
				StreamItem::Response(response) => responses.push(response),
				StreamItem::End(status) => return Ok((responses, status)),
			}
		}
	}
}
