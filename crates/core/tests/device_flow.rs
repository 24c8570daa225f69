//! End-to-end device flow over an in-memory link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use image::RgbImage;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use trap::camera::{Camera, CapturedFrame, Control, FrameMetadata, StreamConfig};
use trap::config::Configuration;
use trap::detector::{BoundingBox, Detection, Detector};
use trap::{Result, TrapApp};
use trap_protocol::{CameraInfo, Envelope, SessionDetails, SessionRef, Settings, State, identifiers};
use trap_runtime::transport::fake::{FakeTransportBuilder, FakeTransportController};

struct BenchCamera;

#[async_trait]
impl Camera for BenchCamera {
	fn name(&self) -> &str {
		"bench"
	}

	fn configure(&mut self, _config: &StreamConfig) -> Result<()> {
		Ok(())
	}

	async fn capture_next(&mut self) -> Result<CapturedFrame> {
		tokio::time::sleep(Duration::from_millis(10)).await;
		Ok(CapturedFrame {
			main: RgbImage::from_pixel(128, 128, image::Rgb([200, 100, 50])),
			lores: RgbImage::new(64, 64),
			metadata: FrameMetadata {
				af_state: 2,
				lens_position: 1.0,
			},
		})
	}

	fn apply_controls(&mut self, _control: Control) -> Result<()> {
		Ok(())
	}
}

/// One tracked subject, always in view.
struct OneSubject;

impl Detector for OneSubject {
	fn name(&self) -> &str {
		"one-subject"
	}

	fn infer(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
		Ok(vec![Detection {
			bbox: BoundingBox::new(8.0, 8.0, 24.0, 24.0),
			track_id: Some(1),
			score: 0.9,
			class: 0,
		}])
	}
}

fn config(tmp: &TempDir) -> Configuration {
	Configuration {
		node_name: "BENCH".into(),
		settings_path: tmp.path().join("configuration"),
		sessions_path: tmp.path().join("sessions"),
		..Configuration::default()
	}
}

/// Reads outbound envelopes until one with `identifier` shows up.
async fn expect(controller: &FakeTransportController, identifier: &str) -> Envelope {
	let deadline = Instant::now() + Duration::from_secs(5);
	while Instant::now() < deadline {
		match controller.next_sent().await {
			Some(envelope) if envelope.identifier() == identifier => return envelope,
			_ => {}
		}
	}
	panic!("no {identifier} within 5s");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
	let deadline = Instant::now() + Duration::from_secs(5);
	while !condition() {
		assert!(Instant::now() < deadline, "condition not met within 5s");
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detection_flow_records_and_reports_sessions() {
	let tmp = TempDir::new().unwrap();
	let app = TrapApp::build(config(&tmp), Box::new(BenchCamera), Box::new(OneSubject)).await.unwrap();
	let mux = app.multiplexer().clone();
	let shutdown = CancellationToken::new();
	let running = tokio::spawn(app.run(None, shutdown.clone()));

	// Give the components a moment to subscribe before the link shows up.
	tokio::time::sleep(Duration::from_millis(50)).await;
	let (parts, client) = FakeTransportBuilder::new().build();
	mux.attach(parts, &shutdown);

	client.inject_envelope(&Envelope::empty(identifiers::SETTINGS_GET));
	let settings = expect(&client, identifiers::SETTINGS).await.parse::<Settings>().unwrap();
	assert_eq!(settings.trap_name, "BENCH");

	client.inject_envelope(&Envelope::from_message(identifiers::DETECTION_STATE_SET, &State { state: true }).unwrap());
	let session = expect(&client, identifiers::SESSION_NEW).await.parse::<SessionRef>().unwrap().session;
	let detection = expect(&client, identifiers::DETECTION).await.parse::<trap_protocol::Detection>().unwrap();
	assert_eq!((detection.session.as_str(), detection.track_id), (session.as_str(), 1));
	// lores 8..24 at 64px doubles to 16..48 at 128px
	assert_eq!((detection.width, detection.height), (32, 32));
	let details = expect(&client, identifiers::SESSION_DETAILS).await.parse::<SessionDetails>().unwrap();
	assert_eq!(details.detections, 1);

	client.inject_envelope(&Envelope::from_message(identifiers::SESSION_DETECTIONS, &SessionRef { session: session.clone() }).unwrap());
	let replayed = expect(&client, identifiers::DETECTION).await.parse::<trap_protocol::Detection>().unwrap();
	assert_eq!(replayed.image, detection.image);

	client.inject_envelope(&Envelope::empty(identifiers::CAMERA_GET));
	let camera = expect(&client, identifiers::CAMERA).await.parse::<CameraInfo>().unwrap();
	assert_eq!(camera.camera, "bench");
	assert_eq!(camera.autofocus_modes.len(), 3);

	assert!(tmp.path().join("sessions").join(&session).join("images").join("1.jpg").exists());

	shutdown.cancel();
	running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn losing_the_link_turns_preview_off() {
	let tmp = TempDir::new().unwrap();
	let app = TrapApp::build(config(&tmp), Box::new(BenchCamera), Box::new(OneSubject)).await.unwrap();
	let mux = app.multiplexer().clone();
	let state = Arc::clone(app.state());
	let shutdown = CancellationToken::new();
	let running = tokio::spawn(app.run(None, shutdown.clone()));
	tokio::time::sleep(Duration::from_millis(50)).await;

	let (parts, client) = FakeTransportBuilder::new().build();
	mux.attach(parts, &shutdown);
	client.inject_envelope(&Envelope::from_message(identifiers::DETECTION_STATE_SET, &State { state: true }).unwrap());
	client.inject_envelope(&Envelope::from_message(identifiers::PREVIEW_STATE_SET, &State { state: true }).unwrap());
	expect(&client, "bench.frame").await;
	assert!(state.preview_enabled());
	assert!(state.detection_enabled());

	client.close();
	wait_until(|| !state.preview_enabled()).await;
	assert!(state.detection_enabled());

	shutdown.cancel();
	running.await.unwrap().unwrap();
}

/// One tracked subject scored just under the raised threshold.
struct Marginal;

impl Detector for Marginal {
	fn name(&self) -> &str {
		"marginal"
	}

	fn infer(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
		Ok(vec![Detection {
			bbox: BoundingBox::new(8.0, 8.0, 24.0, 24.0),
			track_id: Some(1),
			score: 0.5,
			class: 0,
		}])
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raised_min_score_applies_to_the_running_workflow() {
	let tmp = TempDir::new().unwrap();
	{
		let app = TrapApp::build(config(&tmp), Box::new(BenchCamera), Box::new(Marginal)).await.unwrap();
		app.settings()
			.set(Settings {
				trap_name: "BENCH".into(),
				max_sessions: 5,
				min_score: 0.4,
			})
			.unwrap();
	}

	let app = TrapApp::build(config(&tmp), Box::new(BenchCamera), Box::new(Marginal)).await.unwrap();
	let mux = app.multiplexer().clone();
	let settings = Arc::clone(app.settings());
	let shutdown = CancellationToken::new();
	let running = tokio::spawn(app.run(None, shutdown.clone()));
	tokio::time::sleep(Duration::from_millis(50)).await;

	let (parts, client) = FakeTransportBuilder::new().build();
	mux.attach(parts, &shutdown);
	let raised = Settings {
		trap_name: "BENCH".into(),
		max_sessions: 5,
		min_score: 0.6,
	};
	client.inject_envelope(&Envelope::from_message(identifiers::SETTINGS_SET, &raised).unwrap());
	assert_eq!(expect(&client, identifiers::SETTINGS).await.parse::<Settings>().unwrap().min_score, 0.6);
	assert_eq!(settings.current().min_score, 0.6);

	client.inject_envelope(&Envelope::from_message(identifiers::DETECTION_STATE_SET, &State { state: true }).unwrap());
	client.inject_envelope(&Envelope::from_message(identifiers::PREVIEW_STATE_SET, &State { state: true }).unwrap());

	// Preview frames prove the capture loop kept cycling with detection on.
	let mut frames = 0;
	let mut seen = Vec::new();
	while frames < 5 {
		let envelope = client.next_sent_within(Duration::from_secs(5)).await.expect("device went quiet");
		if envelope.identifier() == "bench.frame" {
			frames += 1;
		} else {
			seen.push(envelope.identifier().to_string());
		}
	}
	assert!(!seen.iter().any(|id| id == identifiers::DETECTION || id == identifiers::SESSION_NEW), "unexpected {seen:?}");

	let sessions: Vec<_> = std::fs::read_dir(tmp.path().join("sessions")).unwrap().collect();
	assert!(sessions.is_empty());

	shutdown.cancel();
	running.await.unwrap().unwrap();
}

#[tokio::test]
async fn settings_survive_restart() {
	let tmp = TempDir::new().unwrap();
	{
		let app = TrapApp::build(config(&tmp), Box::new(BenchCamera), Box::new(OneSubject)).await.unwrap();
		app.settings()
			.set(Settings {
				trap_name: "BENCH".into(),
				max_sessions: 3,
				min_score: 0.6,
			})
			.unwrap();
	}

	let app = TrapApp::build(config(&tmp), Box::new(BenchCamera), Box::new(OneSubject)).await.unwrap();
	assert_eq!(app.settings().current().max_sessions, 3);
	assert_eq!(app.settings().current().min_score, 0.6);
}
