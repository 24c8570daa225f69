//! Typed in-process channels shared by the core components.
//!
//! These never leave the device; the client-facing traffic goes through the
//! multiplexer's envelope topics instead.

use std::sync::Arc;

use trap_protocol::AutofocusState;
use trap_runtime::{Bus, Queue, Topic};

use crate::error::Result;
use crate::sessions::{DetectionRecord, SessionId};

pub const SESSION_TOPIC: &str = "session";
pub const DETECTION_TOPIC: &str = "detection";
pub const STORAGE_FAULT_TOPIC: &str = "storage.fault";
pub const PREVIEW_QUEUE: &str = "preview";

/// Session lifecycle as decided by the capture workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
	Opened(SessionId),
	Closed(SessionId),
}

/// One surviving detection plus the JPEG crop of its best-shot candidate.
#[derive(Debug, Clone)]
pub struct DetectionEvent {
	pub record: DetectionRecord,
	pub image: Arc<Vec<u8>>,
}

/// A detection the session cache could not persist.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageFault {
	pub session: SessionId,
	pub track_id: i64,
	pub reason: String,
}

/// Encoded preview frame waiting for the link.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
	pub jpeg: Vec<u8>,
	pub af_state: AutofocusState,
	pub lens_position: f32,
}

#[derive(Clone)]
pub struct Channels {
	pub sessions: Topic<SessionEvent>,
	pub detections: Topic<DetectionEvent>,
	pub storage_faults: Topic<StorageFault>,
	pub preview: Queue<PreviewFrame>,
}

impl Channels {
	pub fn new(bus: &Bus, preview_depth: usize) -> Result<Self> {
		Ok(Self {
			sessions: bus.topic(SESSION_TOPIC)?,
			detections: bus.topic(DETECTION_TOPIC)?,
			storage_faults: bus.topic(STORAGE_FAULT_TOPIC)?,
			preview: bus.queue(PREVIEW_QUEUE, preview_depth.max(1))?,
		})
	}
}
