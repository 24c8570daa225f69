//! Capture and detection workflow.
//!
//! The capture loop is the only producer of session and detection events and
//! the only user of the camera handle. Each cycle:
//!
//! 1. waits for the next frame,
//! 2. applies queued camera commands,
//! 3. when detection is enabled, runs the detector on the low-resolution
//!    frame, keeps tracked results scoring at least `min_score`, and emits one
//!    detection event (with the best-shot crop from the main stream) per result,
//! 4. when preview is enabled, queues the low-resolution frame as JPEG.
//!
//! Detection and preview are independent switches driven by the client.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use image::RgbImage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use trap_protocol::{AutofocusState, Envelope, Frame, FrameMetadata, State, identifiers};
use trap_runtime::{Publisher, Queue, Topic};

use crate::camera::{Camera, CameraControl, Size, control::translate_af_state};
use crate::config::Configuration;
use crate::detector::{Detection, InferenceWorker};
use crate::error::{Error, Result};
use crate::events::{Channels, DetectionEvent, PreviewFrame, SessionEvent};
use crate::render;
use crate::sessions::{DetectionRecord, SessionId, SessionIdGenerator};
use crate::settings::SettingsStore;

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Client-controlled switches shared between the loop and the request handlers.
#[derive(Debug, Default)]
pub struct WorkflowState {
	detection: AtomicBool,
	preview: AtomicBool,
}

impl WorkflowState {
	pub fn new(detection: bool, preview: bool) -> Arc<Self> {
		Arc::new(Self {
			detection: AtomicBool::new(detection),
			preview: AtomicBool::new(preview),
		})
	}

	pub fn detection_enabled(&self) -> bool {
		self.detection.load(Ordering::Acquire)
	}

	pub fn preview_enabled(&self) -> bool {
		self.preview.load(Ordering::Acquire)
	}

	pub fn set_detection(&self, enabled: bool) {
		self.detection.store(enabled, Ordering::Release);
	}

	pub fn set_preview(&self, enabled: bool) {
		self.preview.store(enabled, Ordering::Release);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowConfig {
	pub main: Size,
	pub lores: Size,
	pub jpeg_quality: u8,
}

impl From<&Configuration> for WorkflowConfig {
	fn from(config: &Configuration) -> Self {
		Self {
			main: config.main_size,
			lores: config.lores_size,
			jpeg_quality: config.jpeg_quality,
		}
	}
}

/// What one capture cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
	/// Raw detector results, before filtering.
	pub detections: usize,
	/// Detection events published.
	pub emitted: usize,
	pub preview_queued: bool,
}

pub struct Workflow {
	camera: Box<dyn Camera>,
	control: CameraControl,
	inference: InferenceWorker,
	settings: Arc<SettingsStore>,
	channels: Channels,
	state: Arc<WorkflowState>,
	session_ids: SessionIdGenerator,
	session: Option<SessionId>,
	config: WorkflowConfig,
}

impl Workflow {
	/// `last_session` is the newest session already cached; new ids sort after it.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		camera: Box<dyn Camera>,
		control: CameraControl,
		inference: InferenceWorker,
		settings: Arc<SettingsStore>,
		channels: Channels,
		state: Arc<WorkflowState>,
		last_session: Option<SessionId>,
		config: WorkflowConfig,
	) -> Self {
		Self {
			camera,
			control,
			inference,
			settings,
			channels,
			state,
			session_ids: SessionIdGenerator::new(last_session),
			session: None,
			config,
		}
	}

	pub fn current_session(&self) -> Option<&SessionId> {
		self.session.as_ref()
	}

	/// Runs one capture cycle.
	pub async fn cycle(&mut self) -> Result<CycleReport> {
		let frame = self.camera.capture_next().await?;
		let mode = self.control.apply_pending(self.camera.as_mut()).await;
		let af_state = translate_af_state(mode, frame.metadata.af_state);
		let lens_position = frame.metadata.lens_position;
		let mut report = CycleReport::default();

		if !self.state.detection_enabled() {
			self.close_session();
			if self.state.preview_enabled() {
				report.preview_queued = self.queue_preview(&frame.lores, af_state, lens_position);
			}
			return Ok(report);
		}

		let detections = match self.inference.infer(frame.lores.clone()).await {
			Ok(detections) => detections,
			Err(err) => {
				warn!(target: "trap.workflow", error = %err, "inference failed; treating frame as empty");
				Vec::new()
			}
		};
		report.detections = detections.len();

		let min_score = self.settings.current().min_score;
		let surviving: Vec<&Detection> = detections.iter().filter(|d| d.track_id.is_some() && d.score >= min_score).collect();
		let lores_size = Size::new(frame.lores.width(), frame.lores.height());
		report.emitted = self.emit_detections(&frame.main, lores_size, &surviving);

		if self.state.preview_enabled() {
			let mut annotated = frame.lores;
			render::draw_boxes(&mut annotated, detections.iter().map(|d| &d.bbox));
			report.preview_queued = self.queue_preview(&annotated, af_state, lens_position);
		}
		Ok(report)
	}

	fn emit_detections(&mut self, main: &RgbImage, lores_size: Size, surviving: &[&Detection]) -> usize {
		if surviving.is_empty() {
			return 0;
		}
		let session = self.ensure_session();
		let main_size = Size::new(main.width(), main.height());
		let now = Utc::now().timestamp_millis();

		let mut emitted = 0;
		for detection in surviving {
			let Some(track_id) = detection.track_id else {
				continue;
			};
			let bbox = render::scale_box(&detection.bbox, lores_size, main_size);
			let Some(crop) = render::crop(main, &bbox) else {
				debug!(target: "trap.workflow", track_id, "empty crop skipped");
				continue;
			};
			let jpeg = match render::encode_jpeg(&crop, self.config.jpeg_quality) {
				Ok(jpeg) => jpeg,
				Err(err) => {
					warn!(target: "trap.workflow", track_id, error = %err, "failed to encode best shot");
					continue;
				}
			};

			self.channels.detections.publish(DetectionEvent {
				record: DetectionRecord {
					session: session.clone(),
					track_id,
					created: now,
					updated: now,
					score: detection.score,
					class: detection.class,
					width: crop.width(),
					height: crop.height(),
				},
				image: Arc::new(jpeg),
			});
			emitted += 1;
		}
		emitted
	}

	fn ensure_session(&mut self) -> SessionId {
		if let Some(session) = &self.session {
			return session.clone();
		}
		let session = self.session_ids.next();
		info!(target: "trap.workflow", %session, "starting session");
		self.channels.sessions.publish(SessionEvent::Opened(session.clone()));
		self.session = Some(session.clone());
		session
	}

	fn close_session(&mut self) {
		if let Some(session) = self.session.take() {
			info!(target: "trap.workflow", %session, "stopping session");
			self.channels.sessions.publish(SessionEvent::Closed(session));
		}
	}

	fn queue_preview(&self, image: &RgbImage, af_state: AutofocusState, lens_position: f32) -> bool {
		let jpeg = match render::encode_jpeg(image, self.config.jpeg_quality) {
			Ok(jpeg) => jpeg,
			Err(err) => {
				warn!(target: "trap.workflow", error = %err, "failed to encode preview");
				return false;
			}
		};
		let frame = PreviewFrame {
			jpeg,
			af_state,
			lens_position,
		};
		match self.channels.preview.try_put(frame) {
			Ok(()) => true,
			Err(_) => {
				trace!(target: "trap.workflow", "preview queue full; frame dropped");
				false
			}
		}
	}

	/// Runs the capture loop on its own task until `cancel` fires.
	///
	/// A failed cycle is logged and retried after a short pause. The open
	/// session, if any, is closed on the way out.
	pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
		tokio::spawn(async move {
			info!(target: "trap.workflow", camera = self.camera.name(), "capture loop started");
			loop {
				let result = tokio::select! {
					_ = cancel.cancelled() => break,
					result = self.cycle() => result,
				};
				if let Err(err) = result {
					warn!(target: "trap.workflow", error = %err, "capture cycle failed");
					tokio::select! {
						_ = cancel.cancelled() => break,
						_ = tokio::time::sleep(RETRY_DELAY) => {}
					}
				}
			}
			self.close_session();
			info!(target: "trap.workflow", "capture loop stopped");
		})
	}
}

/// Answers the detection/preview state requests, applying `*.set` first.
pub fn handle_state_request(state: &WorkflowState, request: &Envelope, publisher: &Publisher) -> Result<()> {
	let (reply, value) = match request.identifier() {
		identifiers::DETECTION_STATE_GET => (identifiers::DETECTION_STATE, state.detection_enabled()),
		identifiers::DETECTION_STATE_SET => {
			let enabled = request.parse::<State>()?.state;
			state.set_detection(enabled);
			info!(target: "trap.workflow", enabled, "detection state set");
			(identifiers::DETECTION_STATE, enabled)
		}
		identifiers::PREVIEW_STATE_GET => (identifiers::PREVIEW_STATE, state.preview_enabled()),
		identifiers::PREVIEW_STATE_SET => {
			let enabled = request.parse::<State>()?.state;
			state.set_preview(enabled);
			info!(target: "trap.workflow", enabled, "preview state set");
			(identifiers::PREVIEW_STATE, enabled)
		}
		other => {
			warn!(target: "trap.workflow", identifier = other, "unexpected state request");
			return Ok(());
		}
	};
	publisher.send(reply, &State { state: value });
	Ok(())
}

/// Preview is only useful to a connected client; detection keeps running.
pub fn on_connection_state(state: &WorkflowState, connected: bool) {
	if !connected && state.preview.swap(false, Ordering::AcqRel) {
		info!(target: "trap.workflow", "connection lost; preview disabled");
	}
}

/// Spawns the state request handler and the connection-loss watcher.
pub fn spawn_state_service(
	state: Arc<WorkflowState>,
	requests: &Topic<Envelope>,
	connection_state: &Topic<bool>,
	publisher: Publisher,
	cancel: CancellationToken,
) -> [JoinHandle<()>; 2] {
	let requests = {
		let state = Arc::clone(&state);
		requests.spawn_handler(cancel.clone(), move |request| {
			let state = Arc::clone(&state);
			let publisher = publisher.clone();
			async move { handle_state_request(&state, &request, &publisher) }
		})
	};
	let connection = connection_state.spawn_handler(cancel, move |connected| {
		on_connection_state(&state, connected);
		async { Ok::<(), Error>(()) }
	});
	[requests, connection]
}

/// Publishes queued preview frames as `frame_identifier` until `cancel` fires.
///
/// Frames go out one at a time: the next is popped only once the link has
/// picked up everything published before it.
pub fn spawn_preview_publisher(queue: Queue<PreviewFrame>, publisher: Publisher, frame_identifier: String, cancel: CancellationToken) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			// Nothing is taken off the queue while the link still has unsent
			// envelopes, so a slow link fills the queue and the capture loop
			// drops frames there.
			tokio::select! {
				_ = cancel.cancelled() => break,
				_ = publisher.drained(0) => {}
			}
			let preview = tokio::select! {
				_ = cancel.cancelled() => break,
				preview = queue.pop() => match preview {
					Some(preview) => preview,
					None => break,
				},
			};
			publisher.send(
				&frame_identifier,
				&Frame {
					metadata: FrameMetadata {
						af_state: preview.af_state,
						position: preview.lens_position,
					},
					frame: preview.jpeg,
				},
			);
		}
	})
}
