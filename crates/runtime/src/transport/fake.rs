//! In-memory transport for exercising the multiplexer without sockets.
//!
//! # Example
//!
//! ```ignore
//! let (parts, controller) = FakeTransportBuilder::new().build();
//! mux.attach(parts, &shutdown);
//!
//! controller.inject_envelope(&Envelope::empty("settings.get"));
//! let reply = controller.next_sent().await;
//! ```

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use trap_protocol::Envelope;

use super::{BoxFuture, FrameSink, FrameSource, TransportParts};
use crate::error::{Error, Result};

type Inbound = std::result::Result<Vec<u8>, String>;

/// Builder for creating fake transport instances.
pub struct FakeTransportBuilder {
	peer: String,
}

impl FakeTransportBuilder {
	pub fn new() -> Self {
		Self { peer: "fake".to_string() }
	}

	pub fn peer(mut self, peer: impl Into<String>) -> Self {
		self.peer = peer.into();
		self
	}

	/// Returns [`TransportParts`] for the multiplexer and a controller for the test side.
	pub fn build(self) -> (TransportParts, FakeTransportController) {
		let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
		let (sent_tx, sent_rx) = mpsc::unbounded_channel();

		let parts = TransportParts {
			sink: Box::new(FakeSink { sent: sent_tx }),
			source: Box::new(FakeSource { inbound: inbound_rx }),
			peer: self.peer,
		};
		let controller = FakeTransportController {
			inbound: Mutex::new(Some(inbound_tx)),
			sent: tokio::sync::Mutex::new(sent_rx),
		};
		(parts, controller)
	}
}

impl Default for FakeTransportBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Test-side handle: feeds inbound frames and observes outbound ones.
pub struct FakeTransportController {
	inbound: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
	sent: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl FakeTransportController {
	/// Delivers a raw frame as if the peer sent it.
	pub fn inject(&self, frame: Vec<u8>) {
		if let Some(tx) = self.inbound.lock().as_ref() {
			let _ = tx.send(Ok(frame));
		}
	}

	pub fn inject_envelope(&self, envelope: &Envelope) {
		self.inject(envelope.encode());
	}

	/// Makes the next read fail with a transport error.
	pub fn fail(&self, reason: &str) {
		if let Some(tx) = self.inbound.lock().as_ref() {
			let _ = tx.send(Err(reason.to_string()));
		}
	}

	/// Closes the peer side cleanly.
	pub fn close(&self) {
		self.inbound.lock().take();
	}

	/// Waits up to one second for the next outbound envelope.
	pub async fn next_sent(&self) -> Option<Envelope> {
		self.next_sent_within(Duration::from_secs(1)).await
	}

	pub async fn next_sent_within(&self, wait: Duration) -> Option<Envelope> {
		let mut sent = self.sent.lock().await;
		let frame = tokio::time::timeout(wait, sent.recv()).await.ok()??;
		Envelope::decode(&frame).ok()
	}

	/// Drains every outbound envelope written so far.
	pub async fn take_sent(&self) -> Vec<Envelope> {
		let mut sent = self.sent.lock().await;
		let mut out = Vec::new();
		while let Ok(frame) = sent.try_recv() {
			if let Ok(envelope) = Envelope::decode(&frame) {
				out.push(envelope);
			}
		}
		out
	}
}

struct FakeSink {
	sent: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameSink for FakeSink {
	fn send(&mut self, frame: Vec<u8>) -> BoxFuture<'_, Result<()>> {
		let result = self.sent.send(frame).map_err(|_| Error::ConnectionClosed);
		Box::pin(async move { result })
	}

	fn close(&mut self) -> BoxFuture<'_, ()> {
		Box::pin(async {})
	}
}

struct FakeSource {
	inbound: mpsc::UnboundedReceiver<Inbound>,
}

impl FrameSource for FakeSource {
	fn recv(&mut self) -> BoxFuture<'_, Option<Result<Vec<u8>>>> {
		Box::pin(async move {
			match self.inbound.recv().await? {
				Ok(frame) => Some(Ok(frame)),
				Err(reason) => Some(Err(Error::Transport(reason))),
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn injected_frames_are_read_in_order() {
		let (mut parts, controller) = FakeTransportBuilder::new().build();
		controller.inject(b"one".to_vec());
		controller.inject(b"two".to_vec());
		controller.close();

		assert_eq!(parts.source.recv().await.unwrap().unwrap(), b"one");
		assert_eq!(parts.source.recv().await.unwrap().unwrap(), b"two");
		assert!(parts.source.recv().await.is_none());
	}

	#[tokio::test]
	async fn sent_frames_are_captured() {
		let (mut parts, controller) = FakeTransportBuilder::new().build();
		parts.sink.send(Envelope::empty("a").encode()).await.unwrap();
		parts.sink.send(Envelope::empty("b").encode()).await.unwrap();

		let sent = controller.take_sent().await;
		let ids: Vec<_> = sent.iter().map(|e| e.identifier().to_string()).collect();
		assert_eq!(ids, ["a", "b"]);
	}

	#[tokio::test]
	async fn failure_surfaces_as_transport_error() {
		let (mut parts, controller) = FakeTransportBuilder::new().build();
		controller.fail("reset by peer");

		let err = parts.source.recv().await.unwrap().unwrap_err();
		assert!(matches!(err, Error::Transport(reason) if reason == "reset by peer"));
	}
}
