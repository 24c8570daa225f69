//! WebSocket accept loop.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::mux::Multiplexer;
use crate::transport::WebSocketTransport;

/// Listens for clients and hands each upgraded link to the multiplexer.
pub struct WebSocketServer {
	listener: TcpListener,
}

impl WebSocketServer {
	pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
		Ok(Self {
			listener: TcpListener::bind(addr).await?,
		})
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		Ok(self.listener.local_addr()?)
	}

	/// Accepts connections until `shutdown` fires.
	pub async fn serve(self, mux: Multiplexer, shutdown: CancellationToken) {
		if let Ok(addr) = self.listener.local_addr() {
			info!(target: "trap.ws", %addr, "websocket server listening");
		}

		loop {
			let accepted = tokio::select! {
				_ = shutdown.cancelled() => break,
				accepted = self.listener.accept() => accepted,
			};

			match accepted {
				Ok((stream, peer)) => {
					let mux = mux.clone();
					let shutdown = shutdown.clone();
					// Handshake off the accept loop so a stalled client cannot block others.
					tokio::spawn(async move {
						match WebSocketTransport::accept(stream).await {
							Ok(parts) => {
								mux.attach(parts, &shutdown);
							}
							Err(err) => warn!(target: "trap.ws", %peer, error = %err, "websocket handshake failed"),
						}
					});
				}
				Err(err) => {
					warn!(target: "trap.ws", error = %err, "accept failed");
					tokio::time::sleep(Duration::from_millis(100)).await;
				}
			}
		}

		info!(target: "trap.ws", "websocket server stopped");
	}
}
