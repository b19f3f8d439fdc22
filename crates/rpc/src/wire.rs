//! Length-prefixed postcard frames carried over TCP.
//!
//! Each frame is a little-endian `u32` byte length followed by the postcard
//! encoding of one [`Frame`].

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, RequestEnvelope, ResponseEnvelope, Result, Status};

/// Largest frame body accepted from a peer.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// One message on a call connection.
///
/// A connection carries exactly one call. The client sends `Open`, then
/// requests; the server answers with responses and a final `Status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
	/// Client: starts a call.
	Open { method: String, timeout_ms: Option<u64> },
	/// Client: one request.
	Request(RequestEnvelope),
	/// Client: no more requests follow.
	HalfClose,
	/// Client: abandon the call.
	Cancel,
	/// Server: one response.
	Response(ResponseEnvelope),
	/// Server: the call ended.
	Status(Status),
}

impl Frame {
	pub(crate) const fn name(&self) -> &'static str {
		match self {
			Self::Open { .. } => "open",
			Self::Request(_) => "request",
			Self::HalfClose => "half_close",
			Self::Cancel => "cancel",
			Self::Response(_) => "response",
			Self::Status(_) => "status",
		}
	}
}

pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
	Ok(postcard::to_allocvec(frame)?)
}

pub fn decode(bytes: &[u8]) -> Result<Frame> {
	Ok(postcard::from_bytes(bytes)?)
}

/// Writes one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
	W: AsyncWrite + Unpin,
{
	let body = encode(frame)?;
	let len = u32::try_from(body.len()).map_err(|_| Error::FrameTooLarge(u32::MAX))?;
	if len > MAX_FRAME_LEN {
		return Err(Error::FrameTooLarge(len));
	}
	writer.write_u32_le(len).await?;
	writer.write_all(&body).await?;
	writer.flush().await?;
	Ok(())
}

/// Reads one frame. Returns `None` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
	R: AsyncRead + Unpin,
{
	let len = match reader.read_u32_le().await {
		Ok(len) => len,
		Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
		Err(err) => return Err(err.into()),
	};
	if len > MAX_FRAME_LEN {
		return Err(Error::FrameTooLarge(len));
	}
	let mut body = vec![0u8; len as usize];
	reader.read_exact(&mut body).await?;
	decode(&body).map(Some)
}
