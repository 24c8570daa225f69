//! Frame-level duplex links.
//!
//! A transport moves whole frames (one encoded envelope each); framing is the
//! transport's job. Links are split into a [`FrameSink`] and a [`FrameSource`]
//! so the multiplexer can drive writes and reads from separate loops.

pub mod fake;
mod websocket;

use std::future::Future;
use std::pin::Pin;

pub use websocket::WebSocketTransport;

use crate::error::Result;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Write half of a link.
pub trait FrameSink: Send {
	/// Sends one frame.
	fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>>;

	/// Closes the write half. Errors are not interesting to callers.
	fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Read half of a link.
pub trait FrameSource: Send {
	/// Waits for the next frame. `None` means the peer closed the link cleanly.
	fn recv(&mut self) -> BoxFuture<'_, Option<Result<Vec<u8>>>>;
}

/// Both halves of an accepted link plus a printable peer description.
pub struct TransportParts {
	pub sink: Box<dyn FrameSink>,
	pub source: Box<dyn FrameSource>,
	pub peer: String,
}
