//! Camera control commands.
//!
//! Client commands are queued as they arrive and applied by the capture loop
//! between frames, so the hardware is only ever touched from one place. The
//! queue is drained under the same lock that guards enqueueing: a command
//! that arrives during a drain waits and is applied on the next cycle.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trap_protocol::{AutofocusMode, AutofocusState, CameraIdentifiers, CameraInfo, Envelope, SetMode, SetPosition, identifiers};
use trap_runtime::{Publisher, Topic};

use super::{AfMode, AfState, Camera, Control};
use crate::error::Result;

/// Modes every camera advertises in its `camera` reply.
pub const SUPPORTED_MODES: [AutofocusMode; 3] = [AutofocusMode::Manual, AutofocusMode::Continuous, AutofocusMode::Triggered];

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CameraCommand {
	SetAutofocusMode(AutofocusMode),
	SetManualFocus(f32),
	TriggerAutofocus,
}

impl CameraCommand {
	pub fn control(self) -> Control {
		match self {
			Self::SetAutofocusMode(mode) => Control::AfMode(hardware_mode(mode)),
			Self::SetManualFocus(position) => Control::LensPosition(position),
			Self::TriggerAutofocus => Control::AutofocusCycle,
		}
	}
}

pub fn hardware_mode(mode: AutofocusMode) -> AfMode {
	match mode {
		AutofocusMode::Manual => AfMode::Manual,
		AutofocusMode::Continuous => AfMode::Continuous,
		AutofocusMode::Triggered => AfMode::Auto,
	}
}

pub fn protocol_mode(mode: AfMode) -> AutofocusMode {
	match mode {
		AfMode::Manual => AutofocusMode::Manual,
		AfMode::Continuous => AutofocusMode::Continuous,
		AfMode::Auto => AutofocusMode::Triggered,
	}
}

/// Maps a raw hardware AF state to the protocol state.
///
/// Manual focus never scans, so it always reports idle. Values outside the
/// hardware range read as failed.
pub fn translate_af_state(mode: AutofocusMode, raw: i32) -> AutofocusState {
	if mode == AutofocusMode::Manual {
		return AutofocusState::Idle;
	}
	match AfState::try_from(raw) {
		Ok(AfState::Idle) => AutofocusState::Idle,
		Ok(AfState::Scanning) => AutofocusState::Scanning,
		Ok(AfState::Focused) => AutofocusState::Focused,
		Ok(AfState::Failed) => AutofocusState::Failed,
		Err(raw) => {
			warn!(target: "trap.camera", raw, "unknown autofocus state");
			AutofocusState::Failed
		}
	}
}

struct ControlState {
	pending: Vec<CameraCommand>,
	mode: AutofocusMode,
}

/// Shared command queue plus the last successfully applied autofocus mode.
#[derive(Clone)]
pub struct CameraControl {
	camera: Arc<str>,
	identifiers: Arc<CameraIdentifiers>,
	state: Arc<Mutex<ControlState>>,
}

impl CameraControl {
	pub fn new(camera: &str, initial_mode: AutofocusMode) -> Self {
		Self {
			camera: Arc::from(camera),
			identifiers: Arc::new(CameraIdentifiers::new(camera)),
			state: Arc::new(Mutex::new(ControlState {
				pending: Vec::new(),
				mode: initial_mode,
			})),
		}
	}

	pub fn identifiers(&self) -> &CameraIdentifiers {
		&self.identifiers
	}

	pub async fn mode(&self) -> AutofocusMode {
		self.state.lock().await.mode
	}

	pub async fn pending(&self) -> usize {
		self.state.lock().await.pending.len()
	}

	pub async fn enqueue(&self, command: CameraCommand) {
		debug!(target: "trap.camera", ?command, "command queued");
		self.state.lock().await.pending.push(command);
	}

	/// Applies every queued command in arrival order and returns the mode in
	/// effect afterwards.
	///
	/// A command the camera rejects is logged and discarded; the tracked mode
	/// only follows mode changes that succeeded.
	pub async fn apply_pending(&self, camera: &mut dyn Camera) -> AutofocusMode {
		let mut state = self.state.lock().await;
		for command in std::mem::take(&mut state.pending) {
			match camera.apply_controls(command.control()) {
				Ok(()) => {
					if let CameraCommand::SetAutofocusMode(mode) = command {
						info!(target: "trap.camera", camera = camera.name(), ?mode, "autofocus mode changed");
						state.mode = mode;
					}
				}
				Err(err) => warn!(target: "trap.camera", camera = camera.name(), ?command, error = %err, "camera rejected command"),
			}
		}
		state.mode
	}

	/// Decodes an inbound camera envelope. `None` for identifiers this camera does not own.
	pub fn decode(&self, envelope: &Envelope) -> Result<Option<CameraCommand>> {
		let identifier = envelope.identifier();
		let command = if identifier == self.identifiers.mode_set {
			CameraCommand::SetAutofocusMode(envelope.parse::<SetMode>()?.mode)
		} else if identifier == self.identifiers.position_set {
			CameraCommand::SetManualFocus(envelope.parse::<SetPosition>()?.position)
		} else if identifier == self.identifiers.focus_trigger {
			CameraCommand::TriggerAutofocus
		} else {
			return Ok(None);
		};
		Ok(Some(command))
	}

	pub async fn handle(&self, envelope: Envelope, publisher: &Publisher) -> Result<()> {
		if envelope.identifier() == identifiers::CAMERA_GET {
			let info = CameraInfo {
				camera: self.camera.to_string(),
				autofocus_mode: self.mode().await,
				autofocus_modes: SUPPORTED_MODES.to_vec(),
			};
			publisher.send(identifiers::CAMERA, &info);
			return Ok(());
		}

		match self.decode(&envelope)? {
			Some(command) => self.enqueue(command).await,
			None => warn!(target: "trap.camera", identifier = envelope.identifier(), "unexpected camera request"),
		}
		Ok(())
	}

	/// Serves `requests` until `cancel` fires.
	pub fn spawn(self, requests: &Topic<Envelope>, publisher: Publisher, cancel: CancellationToken) -> JoinHandle<()> {
		requests.spawn_handler(cancel, move |envelope| {
			let control = self.clone();
			let publisher = publisher.clone();
			async move { control.handle(envelope, &publisher).await }
		})
	}
}
