//! Connection multiplexer.
//!
//! Binds the single active duplex link to the bus:
//!
//! * inbound: each frame is decoded into an [`Envelope`] and published on the
//!   topic routed for its identifier. Several identifiers may share one topic
//!   so a component can handle a family of requests in one place.
//! * outbound: every component publishes envelopes on one shared outbound
//!   topic; the attached connection drains it in publish order. With no
//!   connection attached nothing subscribes, so those publishes vanish.
//! * lifecycle: attach publishes `true` on the connection-state topic; losing
//!   the current connection publishes `false`. Dependents react without the
//!   multiplexer knowing why they care.
//!
//! Attaching a new link supersedes the previous one immediately (last
//! connection wins). The superseded link's loops are cancelled and wind down
//! on their own; they do not report a disconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trap_protocol::Envelope;

use crate::bus::{Bus, Subscription, Topic};
use crate::error::Result;
use crate::transport::{FrameSink, FrameSource, TransportParts};

/// Topic every component publishes outbound envelopes on.
pub const OUTBOUND_TOPIC: &str = "protocol.outbound";
/// Topic carrying `true` on attach and `false` when the current link is lost.
pub const CONNECTION_STATE_TOPIC: &str = "connection_state";

struct Attached {
	id: u64,
	cancel: CancellationToken,
}

struct MuxInner {
	bus: Bus,
	outbound: Topic<Envelope>,
	connection_state: Topic<bool>,
	routes: RwLock<HashMap<String, Topic<Envelope>>>,
	current: Mutex<Option<Attached>>,
	next_id: AtomicU64,
}

/// Shared handle to the multiplexer.
#[derive(Clone)]
pub struct Multiplexer {
	inner: Arc<MuxInner>,
}

impl Multiplexer {
	pub fn new(bus: &Bus) -> Result<Self> {
		Ok(Self {
			inner: Arc::new(MuxInner {
				bus: bus.clone(),
				outbound: bus.topic(OUTBOUND_TOPIC)?,
				connection_state: bus.topic(CONNECTION_STATE_TOPIC)?,
				routes: RwLock::new(HashMap::new()),
				current: Mutex::new(None),
				next_id: AtomicU64::new(1),
			}),
		})
	}

	/// Routes every identifier in `identifiers` to the envelope topic `topic`.
	///
	/// Returns that topic so the caller can subscribe. Re-routing an identifier
	/// replaces its previous destination.
	pub fn route(&self, topic: &str, identifiers: &[&str]) -> Result<Topic<Envelope>> {
		let target: Topic<Envelope> = self.inner.bus.topic(topic)?;
		let mut routes = self.inner.routes.write();
		for identifier in identifiers {
			if let Some(previous) = routes.insert(identifier.to_string(), target.clone()) {
				if previous.name() != topic {
					warn!(target: "trap.mux", identifier, from = previous.name(), to = topic, "identifier re-routed");
				}
			}
		}
		Ok(target)
	}

	/// Handle for publishing typed messages to the client.
	pub fn publisher(&self) -> Publisher {
		Publisher {
			outbound: self.inner.outbound.clone(),
		}
	}

	pub fn connection_state(&self) -> Topic<bool> {
		self.inner.connection_state.clone()
	}

	pub fn is_connected(&self) -> bool {
		self.inner.current.lock().is_some()
	}

	/// Makes `parts` the active connection and starts its loops.
	///
	/// The returned task ends when the link closes, fails, is superseded, or
	/// `shutdown` fires.
	pub fn attach(&self, parts: TransportParts, shutdown: &CancellationToken) -> JoinHandle<()> {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let cancel = shutdown.child_token();

		// Subscribe before the slot flips so nothing published after attach is lost.
		let outbound = self.inner.outbound.subscribe();
		let previous = self.inner.current.lock().replace(Attached { id, cancel: cancel.clone() });
		if let Some(previous) = previous {
			info!(target: "trap.mux", superseded = previous.id, connection = id, "new connection supersedes previous");
			previous.cancel.cancel();
		}

		info!(target: "trap.mux", connection = id, peer = %parts.peer, "connection attached");
		self.inner.connection_state.publish(true);

		let TransportParts { sink, source, .. } = parts;
		let mux = self.clone();
		tokio::spawn(async move {
			let writer = tokio::spawn(outbound_loop(id, outbound, sink, cancel.clone()));
			mux.inbound_loop(id, source, &cancel).await;
			cancel.cancel();
			let _ = writer.await;
			mux.detach(id);
		})
	}

	async fn inbound_loop(&self, id: u64, mut source: Box<dyn FrameSource>, cancel: &CancellationToken) {
		loop {
			let frame = tokio::select! {
				_ = cancel.cancelled() => {
					debug!(target: "trap.mux", connection = id, "inbound loop cancelled");
					return;
				}
				frame = source.recv() => frame,
			};

			match frame {
				Some(Ok(frame)) => self.dispatch(&frame),
				Some(Err(err)) => {
					warn!(target: "trap.mux", connection = id, error = %err, "read failed");
					return;
				}
				None => {
					info!(target: "trap.mux", connection = id, "connection closed by peer");
					return;
				}
			}
		}
	}

	/// Decodes one inbound frame and publishes it on its routed topic.
	pub fn dispatch(&self, frame: &[u8]) {
		let envelope = match Envelope::decode(frame) {
			Ok(envelope) => envelope,
			Err(err) => {
				warn!(target: "trap.mux", error = %err, len = frame.len(), "dropping undecodable frame");
				return;
			}
		};

		let topic = self.inner.routes.read().get(envelope.identifier()).cloned();
		match topic {
			Some(topic) => {
				debug!(target: "trap.mux", identifier = envelope.identifier(), topic = topic.name(), "inbound");
				topic.publish(envelope);
			}
			None => {
				warn!(target: "trap.mux", identifier = envelope.identifier(), "no route for identifier; dropped");
			}
		}
	}

	fn detach(&self, id: u64) {
		let mut current = self.inner.current.lock();
		match current.as_ref() {
			Some(attached) if attached.id == id => {
				current.take();
				drop(current);
				info!(target: "trap.mux", connection = id, "connection lost");
				self.inner.connection_state.publish(false);
			}
			_ => debug!(target: "trap.mux", connection = id, "superseded connection ended"),
		}
	}
}

async fn outbound_loop(id: u64, mut outbound: Subscription<Envelope>, mut sink: Box<dyn FrameSink>, cancel: CancellationToken) {
	loop {
		let envelope = tokio::select! {
			_ = cancel.cancelled() => break,
			envelope = outbound.recv() => match envelope {
				Some(envelope) => envelope,
				None => break,
			},
		};

		// A stalled write must not outlive a superseded link.
		let written = tokio::select! {
			_ = cancel.cancelled() => break,
			written = sink.send(envelope.encode()) => written,
		};
		if let Err(err) = written {
			warn!(target: "trap.mux", connection = id, identifier = envelope.identifier(), error = %err, "write failed");
			cancel.cancel();
			break;
		}
	}
	drop(outbound);
	sink.close().await;
}

/// Serializes typed messages onto the shared outbound topic.
#[derive(Clone)]
pub struct Publisher {
	outbound: Topic<Envelope>,
}

impl Publisher {
	/// Publishes `message` under `identifier`. Encoding failures are logged and dropped.
	pub fn send<M: Serialize>(&self, identifier: &str, message: &M) {
		match Envelope::from_message(identifier, message) {
			Ok(envelope) => self.send_envelope(envelope),
			Err(err) => warn!(target: "trap.mux", identifier, error = %err, "failed to encode outbound message"),
		}
	}

	pub fn send_envelope(&self, envelope: Envelope) {
		debug!(target: "trap.mux", identifier = envelope.identifier(), "outbound");
		self.outbound.publish(envelope);
	}

	/// Envelopes the attached link has not picked up yet.
	pub fn backlog(&self) -> usize {
		self.outbound.backlog()
	}

	/// Waits until at most `limit` envelopes are waiting for the link.
	pub async fn drained(&self, limit: usize) {
		self.outbound.drained(limit).await
	}
}
