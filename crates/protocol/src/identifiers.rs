//! Identifier catalog.
//!
//! Requests flow client → device, notifications flow device → client. Some
//! identifiers are both (e.g. `detection` answers `session.detections` and is
//! also pushed when a new subject is recorded).

pub const SETTINGS_GET: &str = "settings.get";
pub const SETTINGS_SET: &str = "settings.set";
pub const SETTINGS: &str = "settings";

pub const SESSIONS: &str = "sessions";
pub const SESSION_DETAILS: &str = "session.details";
pub const SESSION_DETECTIONS: &str = "session.detections";
pub const SESSION_NEW: &str = "session.new";
pub const SESSION_DELETE: &str = "session.delete";
pub const DETECTION: &str = "detection";
pub const DETECTION_LOST: &str = "detection.lost";

pub const CAMERA_GET: &str = "camera.get";
pub const CAMERA: &str = "camera";

pub const DETECTION_STATE_GET: &str = "detection.state.get";
pub const DETECTION_STATE_SET: &str = "detection.state.set";
pub const DETECTION_STATE: &str = "detection.state";

pub const PREVIEW_STATE_GET: &str = "preview.state.get";
pub const PREVIEW_STATE_SET: &str = "preview.state.set";
pub const PREVIEW_STATE: &str = "preview.state";

/// Identifiers scoped to one camera variant, e.g. `picam3.mode.set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraIdentifiers {
	pub mode_set: String,
	pub position_set: String,
	pub focus_trigger: String,
	pub frame: String,
}

impl CameraIdentifiers {
	pub fn new(camera: &str) -> Self {
		Self {
			mode_set: format!("{camera}.mode.set"),
			position_set: format!("{camera}.position.set"),
			focus_trigger: format!("{camera}.focus.trigger"),
			frame: format!("{camera}.frame"),
		}
	}

	/// Inbound control identifiers, in the order they are routed.
	pub fn controls(&self) -> [&str; 3] {
		[&self.mode_set, &self.position_set, &self.focus_trigger]
	}
}
