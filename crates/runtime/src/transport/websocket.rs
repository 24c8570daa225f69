//! WebSocket transport: one binary message per frame.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;

use super::{BoxFuture, FrameSink, FrameSource, TransportParts};
use crate::error::{Error, Result};

pub struct WebSocketTransport;

impl WebSocketTransport {
	/// Performs the server-side handshake on an accepted TCP stream.
	pub async fn accept(stream: TcpStream) -> Result<TransportParts> {
		let peer = stream.peer_addr().map(|addr| addr.to_string()).unwrap_or_else(|_| "unknown".to_string());
		let ws = tokio_tungstenite::accept_async(stream).await.map_err(|e| Error::Transport(e.to_string()))?;
		Ok(Self::from_stream(ws, peer))
	}

	/// Opens a client connection, mainly for tooling and tests.
	pub async fn connect(url: &str) -> Result<TransportParts> {
		let (ws, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| Error::Transport(e.to_string()))?;
		Ok(Self::from_stream::<MaybeTlsStream<TcpStream>>(ws, url.to_string()))
	}

	/// Splits an established websocket into transport halves.
	pub fn from_stream<S>(ws: WebSocketStream<S>, peer: String) -> TransportParts
	where
		S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
	{
		let (sink, stream) = ws.split();
		TransportParts {
			sink: Box::new(WebSocketSink { sink }),
			source: Box::new(WebSocketSource { stream }),
			peer,
		}
	}
}

struct WebSocketSink<S> {
	sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> FrameSink for WebSocketSink<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move { self.sink.send(Message::Binary(frame)).await.map_err(map_ws_error) })
	}

	fn close(&mut self) -> BoxFuture<'_, ()> {
		Box::pin(async move {
			let _ = self.sink.close().await;
		})
	}
}

struct WebSocketSource<S> {
	stream: SplitStream<WebSocketStream<S>>,
}

impl<S> FrameSource for WebSocketSource<S>
where
	S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
	fn recv(&mut self) -> BoxFuture<'_, Option<Result<Vec<u8>>>> {
		Box::pin(async move {
			loop {
				match self.stream.next().await? {
					Ok(Message::Binary(frame)) => return Some(Ok(frame)),
					Ok(Message::Text(text)) => return Some(Ok(text.into_bytes())),
					Ok(Message::Close(_)) => return None,
					Ok(other) => trace!(target: "trap.ws", kind = ?other, "control frame"),
					Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => return None,
					Err(err) => return Some(Err(map_ws_error(err))),
				}
			}
		})
	}
}

fn map_ws_error(err: tungstenite::Error) -> Error {
	match err {
		tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => Error::ConnectionClosed,
		other => Error::Transport(other.to_string()),
	}
}
