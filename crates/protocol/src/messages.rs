//! Payload shapes carried inside envelopes.

use serde::{Deserialize, Serialize};

/// Operator-tunable device settings (`settings`, `settings.set`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
	#[serde(default)]
	pub trap_name: String,
	pub max_sessions: u32,
	pub min_score: f32,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			trap_name: String::new(),
			max_sessions: 5,
			min_score: 0.75,
		}
	}
}

/// Names one session (`session.new`, `session.delete`, `session.detections`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
	pub session: String,
}

/// Catalog entry returned for `sessions` and pushed after each new detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetails {
	pub session: String,
	pub detections: u32,
}

/// A recorded subject with its best-shot image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
	pub session: String,
	pub track_id: i64,
	pub created: i64,
	pub updated: i64,
	pub score: f32,
	pub class: i32,
	pub width: u32,
	pub height: u32,
	#[serde(with = "crate::bytes")]
	pub image: Vec<u8>,
}

/// A detection the device failed to store (`detection.lost`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionLost {
	pub session: String,
	pub track_id: i64,
	pub reason: String,
}

/// On/off toggle used by detection and preview state messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
	pub state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutofocusMode {
	Manual,
	Continuous,
	Triggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutofocusState {
	Idle,
	Scanning,
	Focused,
	Failed,
}

/// Reply to `camera.get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
	pub camera: String,
	pub autofocus_mode: AutofocusMode,
	pub autofocus_modes: Vec<AutofocusMode>,
}

/// `<camera>.mode.set`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMode {
	pub mode: AutofocusMode,
}

/// `<camera>.position.set`; lens position in dioptres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetPosition {
	pub position: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
	pub af_state: AutofocusState,
	pub position: f32,
}

/// `<camera>.frame`: one JPEG preview frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
	pub metadata: FrameMetadata,
	#[serde(with = "crate::bytes")]
	pub frame: Vec<u8>,
}
