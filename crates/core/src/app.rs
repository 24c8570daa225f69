//! Composition root.
//!
//! Startup happens in two phases. [`TrapApp::build`] does everything that
//! must finish before any task runs: settings are loaded (or defaulted), the
//! session cache is rebuilt from disk, and the camera is configured. Only then
//! does [`TrapApp::run`] route the protocol identifiers and spawn the tasks,
//! so no request can observe a half-built index.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trap_protocol::{AutofocusMode, Settings, identifiers};
use trap_runtime::{Bus, Multiplexer, WebSocketServer};

use crate::camera::control::hardware_mode;
use crate::camera::{Camera, CameraControl, Control, StreamConfig, create_camera};
use crate::config::Configuration;
use crate::detector::{Detector, InferenceWorker, create_detector};
use crate::error::Result;
use crate::events::Channels;
use crate::sessions::{self, SessionCache, SessionStorage};
use crate::settings::{self, SettingsStore};
use crate::workflow::{self, Workflow, WorkflowConfig, WorkflowState};

pub const SETTINGS_REQUESTS: &str = "settings.requests";
pub const SESSIONS_REQUESTS: &str = "sessions.requests";
pub const CAMERA_REQUESTS: &str = "camera.requests";
pub const STATE_REQUESTS: &str = "workflow.requests";

const STARTUP_AUTOFOCUS: AutofocusMode = AutofocusMode::Continuous;

pub struct TrapApp {
	config: Configuration,
	bus: Bus,
	mux: Multiplexer,
	channels: Channels,
	settings: Arc<SettingsStore>,
	cache: SessionCache,
	control: CameraControl,
	state: Arc<WorkflowState>,
	workflow: Workflow,
}

impl TrapApp {
	/// Builds the app with the camera and detector named in `config`.
	pub async fn from_config(config: Configuration) -> Result<Self> {
		let camera = create_camera(config.camera);
		let detector = create_detector(config.detector);
		Self::build(config, camera, detector).await
	}

	pub async fn build(config: Configuration, mut camera: Box<dyn Camera>, detector: Box<dyn Detector>) -> Result<Self> {
		config.validate()?;

		let defaults = Settings {
			trap_name: config.node_name.clone(),
			..Settings::default()
		};
		let settings = Arc::new(SettingsStore::open(&config.settings_path, defaults)?);

		let bus = Bus::new();
		let mux = Multiplexer::new(&bus)?;
		let channels = Channels::new(&bus, config.preview_queue_depth)?;

		let mut cache = SessionCache::new(
			SessionStorage::new(&config.sessions_path),
			Arc::clone(&settings),
			mux.publisher(),
			channels.storage_faults.clone(),
		);
		let last_session = cache.init().await?;

		camera.configure(&StreamConfig {
			main: config.main_size,
			lores: config.lores_size,
		})?;
		camera.apply_controls(Control::AfMode(hardware_mode(STARTUP_AUTOFOCUS)))?;
		let control = CameraControl::new(camera.name(), STARTUP_AUTOFOCUS);

		let inference = InferenceWorker::spawn(detector)?;
		let state = WorkflowState::new(config.detect_on_start, false);
		let workflow = Workflow::new(
			camera,
			control.clone(),
			inference,
			Arc::clone(&settings),
			channels.clone(),
			Arc::clone(&state),
			last_session,
			WorkflowConfig::from(&config),
		);

		Ok(Self {
			config,
			bus,
			mux,
			channels,
			settings,
			cache,
			control,
			state,
			workflow,
		})
	}

	pub fn bus(&self) -> &Bus {
		&self.bus
	}

	pub fn multiplexer(&self) -> &Multiplexer {
		&self.mux
	}

	pub fn settings(&self) -> &Arc<SettingsStore> {
		&self.settings
	}

	pub fn state(&self) -> &Arc<WorkflowState> {
		&self.state
	}

	/// Spawns every component and waits for `shutdown`.
	///
	/// With `server` the device accepts websocket clients; without one,
	/// links are attached directly through [`TrapApp::multiplexer`].
	pub async fn run(self, server: Option<WebSocketServer>, shutdown: CancellationToken) -> Result<()> {
		let Self {
			config,
			mux,
			channels,
			settings,
			cache,
			control,
			state,
			workflow,
			..
		} = self;
		let publisher = mux.publisher();
		let camera_ids = control.identifiers().clone();

		let settings_requests = mux.route(SETTINGS_REQUESTS, &[identifiers::SETTINGS_GET, identifiers::SETTINGS_SET])?;
		let session_requests = mux.route(SESSIONS_REQUESTS, &[identifiers::SESSIONS, identifiers::SESSION_DETECTIONS])?;
		let mut camera_routes = vec![identifiers::CAMERA_GET];
		camera_routes.extend(camera_ids.controls());
		let camera_requests = mux.route(CAMERA_REQUESTS, &camera_routes)?;
		let state_requests = mux.route(
			STATE_REQUESTS,
			&[
				identifiers::DETECTION_STATE_GET,
				identifiers::DETECTION_STATE_SET,
				identifiers::PREVIEW_STATE_GET,
				identifiers::PREVIEW_STATE_SET,
			],
		)?;

		// Consumers first, so nothing the capture loop publishes goes unheard.
		let mut tasks: Vec<JoinHandle<()>> = vec![
			settings::spawn_service(Arc::clone(&settings), &settings_requests, publisher.clone(), shutdown.clone()),
			cache.spawn(&channels, &session_requests, shutdown.clone()),
			sessions::spawn_fault_reporter(&channels.storage_faults, publisher.clone(), shutdown.clone()),
			control.spawn(&camera_requests, publisher.clone(), shutdown.clone()),
			workflow::spawn_preview_publisher(channels.preview.clone(), publisher.clone(), camera_ids.frame.clone(), shutdown.clone()),
		];
		tasks.extend(workflow::spawn_state_service(
			state,
			&state_requests,
			&mux.connection_state(),
			publisher,
			shutdown.clone(),
		));
		tasks.push(workflow.spawn(shutdown.clone()));

		if let Some(server) = server {
			tasks.push(tokio::spawn(server.serve(mux.clone(), shutdown.clone())));
		}

		info!(
			target: "trap.app",
			node = %config.node_name,
			camera = %config.camera,
			detector = %config.detector,
			sessions = %config.sessions_path.display(),
			"trap running"
		);

		shutdown.cancelled().await;
		for task in tasks {
			if let Err(err) = task.await {
				warn!(target: "trap.app", error = %err, "task ended abnormally");
			}
		}
		info!(target: "trap.app", "trap stopped");
		Ok(())
	}
}

/// Binds the websocket listener named in `config`.
pub async fn bind_server(config: &Configuration) -> Result<WebSocketServer> {
	let server = WebSocketServer::bind(config.listen_addr()).await?;
	Ok(server)
}
