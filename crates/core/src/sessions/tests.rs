use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use trap_protocol::{Detection, DetectionLost, Envelope, SessionDetails, SessionRef, Settings, identifiers};
use trap_runtime::mux::OUTBOUND_TOPIC;
use trap_runtime::{Bus, Multiplexer, Subscription};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::events::{Channels, DetectionEvent, STORAGE_FAULT_TOPIC, SessionEvent, StorageFault};
use crate::settings::SettingsStore;

struct Harness {
	tmp: TempDir,
	bus: Bus,
	cache: SessionCache,
	outbound: Subscription<Envelope>,
	faults: Subscription<StorageFault>,
}

impl Harness {
	fn new(max_sessions: u32) -> Self {
		let tmp = TempDir::new().unwrap();
		let settings = SettingsStore::open(
			tmp.path().join("configuration"),
			Settings {
				trap_name: "TRAP".into(),
				max_sessions,
				min_score: 0.5,
			},
		)
		.unwrap();
		let bus = Bus::new();
		let publisher = Multiplexer::new(&bus).unwrap().publisher();
		let outbound = bus.topic::<Envelope>(OUTBOUND_TOPIC).unwrap().subscribe();
		let faults_topic = bus.topic::<StorageFault>(STORAGE_FAULT_TOPIC).unwrap();
		let faults = faults_topic.subscribe();
		let storage = SessionStorage::new(tmp.path().join("sessions"));
		let cache = SessionCache::new(storage, Arc::new(settings), publisher, faults_topic);
		Self {
			tmp,
			bus,
			cache,
			outbound,
			faults,
		}
	}

	fn sessions_root(&self) -> std::path::PathBuf {
		self.tmp.path().join("sessions")
	}

	fn sent(&mut self) -> Vec<Envelope> {
		std::iter::from_fn(|| self.outbound.try_recv()).collect()
	}
}

fn sid(raw: &str) -> SessionId {
	SessionId::parse(raw).unwrap()
}

fn sighting(session: &SessionId, track_id: i64, score: f32, at: i64, image: &[u8]) -> DetectionEvent {
	DetectionEvent {
		record: DetectionRecord {
			session: session.clone(),
			track_id,
			created: at,
			updated: at,
			score,
			class: 3,
			width: 64,
			height: 48,
		},
		image: Arc::new(image.to_vec()),
	}
}

fn identifiers_of(envelopes: &[Envelope]) -> Vec<&str> {
	envelopes.iter().map(Envelope::identifier).collect()
}

#[tokio::test]
async fn new_detection_is_persisted_and_announced() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let session = sid("20240101000000");
	h.cache.open_session(session.clone()).await.unwrap();
	h.sent();

	let outcome = h.cache.record_detection(&sighting(&session, 7, 0.8, 100, b"first")).await.unwrap();
	assert_eq!(outcome, DetectionOutcome::New);

	let storage = h.cache.storage().clone();
	assert_eq!(std::fs::read(storage.image_path(&session, 7)).unwrap(), b"first");
	assert!(storage.metadata_path(&session, 7).exists());

	let sent = h.sent();
	assert_eq!(identifiers_of(&sent), vec![identifiers::DETECTION, identifiers::SESSION_DETAILS]);
	let detection = sent[0].parse::<Detection>().unwrap();
	assert_eq!((detection.track_id, detection.image.as_slice()), (7, b"first".as_slice()));
	assert_eq!(
		sent[1].parse::<SessionDetails>().unwrap(),
		SessionDetails {
			session: "20240101000000".into(),
			detections: 1,
		}
	);
}

#[tokio::test]
async fn best_shot_keeps_higher_score_when_it_arrives_first() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let session = sid("20240101000000");
	h.cache.open_session(session.clone()).await.unwrap();

	h.cache.record_detection(&sighting(&session, 7, 0.9, 100, b"sharp")).await.unwrap();
	let outcome = h.cache.record_detection(&sighting(&session, 7, 0.8, 105, b"blurry")).await.unwrap();
	assert_eq!(outcome, DetectionOutcome::Refreshed);

	let record = h.cache.detection(&session, 7).unwrap();
	assert_eq!((record.score, record.created, record.updated), (0.9, 100, 105));
	let detections = h.cache.detections(&session).await.unwrap();
	assert_eq!(detections[0].1, b"sharp");
}

#[tokio::test]
async fn best_shot_replaces_image_when_higher_score_arrives_later() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let session = sid("20240101000000");
	h.cache.open_session(session.clone()).await.unwrap();

	h.cache.record_detection(&sighting(&session, 7, 0.8, 100, b"blurry")).await.unwrap();
	h.sent();
	let outcome = h.cache.record_detection(&sighting(&session, 7, 0.9, 105, b"sharp")).await.unwrap();
	assert_eq!(outcome, DetectionOutcome::Improved);
	assert!(h.sent().is_empty());

	let detections = h.cache.detections(&session).await.unwrap();
	assert_eq!(detections.len(), 1);
	assert_eq!((detections[0].0.score, detections[0].0.updated), (0.9, 105));
	assert_eq!(detections[0].1, b"sharp");

	// metadata file carries the merged record
	let storage = h.cache.storage().clone();
	let on_disk = storage.read_metadata(&session).await.unwrap();
	assert_eq!(on_disk, vec![detections[0].0.clone()]);
}

#[tokio::test]
async fn retention_evicts_oldest_session() {
	let mut h = Harness::new(2);
	h.cache.init().await.unwrap();
	let (a, b, c) = (sid("20240101000000"), sid("20240101000100"), sid("20240101000200"));

	h.cache.open_session(a.clone()).await.unwrap();
	h.cache.record_detection(&sighting(&a, 1, 0.7, 1, b"a")).await.unwrap();
	h.cache.open_session(b.clone()).await.unwrap();
	h.sent();
	h.cache.open_session(c.clone()).await.unwrap();

	let sessions: Vec<_> = h.cache.sessions().into_iter().map(|(id, _)| id).collect();
	assert_eq!(sessions, vec![b, c.clone()]);
	assert!(!h.sessions_root().join(a.as_str()).exists());
	assert_eq!(h.cache.current_session(), Some(&c));

	let sent = h.sent();
	assert_eq!(identifiers_of(&sent), vec![identifiers::SESSION_NEW, identifiers::SESSION_DELETE]);
	assert_eq!(sent[1].parse::<SessionRef>().unwrap().session, a.as_str());
}

#[tokio::test]
async fn retention_follows_current_settings() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	for raw in ["20240101000000", "20240101000100", "20240101000200"] {
		h.cache.open_session(sid(raw)).await.unwrap();
	}
	h.cache
		.settings
		.set(Settings {
			trap_name: "TRAP".into(),
			max_sessions: 1,
			min_score: 0.5,
		})
		.unwrap();

	let evicted = h.cache.sweep().await.unwrap();
	assert_eq!(evicted, vec![sid("20240101000000"), sid("20240101000100")]);
	assert_eq!(h.cache.sessions().len(), 1);
}

#[tokio::test]
async fn init_replays_sessions_and_skips_corrupt_metadata() {
	let mut h = Harness::new(5);
	let storage = SessionStorage::new(h.sessions_root());
	storage.ensure_root().await.unwrap();

	let older = sid("20240101000000");
	let newer = sid("20240102000000");
	for session in [&older, &newer] {
		storage.create_session(session).await.unwrap();
	}
	for (track_id, score) in [(1, 0.6), (2, 0.7)] {
		let event = sighting(&older, track_id, score, 10, b"img");
		storage.write_detection(&event.record, Some(event.image.as_slice()), None).await.unwrap();
	}
	std::fs::write(storage.metadata_path(&older, 3), "{ truncated").unwrap();
	std::fs::create_dir(h.sessions_root().join("lost+found")).unwrap();

	let newest = h.cache.init().await.unwrap();
	assert_eq!(newest, Some(newer.clone()));
	assert_eq!(h.cache.sessions(), vec![(older.clone(), 2), (newer, 0)]);
	assert_eq!(h.cache.current_session(), None);
	assert!(h.sent().is_empty());

	let tracks: Vec<_> = h.cache.detections(&older).await.unwrap().into_iter().map(|(record, _)| record.track_id).collect();
	assert_eq!(tracks, vec![2, 1]);
}

#[tokio::test]
async fn detections_are_listed_newest_first() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let session = sid("20240101000000");
	h.cache.open_session(session.clone()).await.unwrap();
	for track_id in [5, 2, 9] {
		h.cache.record_detection(&sighting(&session, track_id, 0.7, track_id, b"x")).await.unwrap();
	}
	h.cache.record_detection(&sighting(&session, 2, 0.9, 50, b"y")).await.unwrap();

	let tracks: Vec<_> = h.cache.detections(&session).await.unwrap().into_iter().map(|(record, _)| record.track_id).collect();
	assert_eq!(tracks, vec![9, 2, 5]);
}

#[tokio::test]
async fn missing_image_is_an_error() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let session = sid("20240101000000");
	h.cache.open_session(session.clone()).await.unwrap();
	h.cache.record_detection(&sighting(&session, 4, 0.7, 1, b"x")).await.unwrap();
	std::fs::remove_file(h.cache.storage().image_path(&session, 4)).unwrap();

	let err = h.cache.detections(&session).await.unwrap_err();
	assert!(matches!(err, Error::MissingImage { track_id: 4, .. }));
}

#[tokio::test]
async fn write_failure_drops_detection_and_raises_fault() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let session = sid("20240101000000");
	h.cache.open_session(session.clone()).await.unwrap();
	std::fs::remove_dir_all(h.sessions_root().join(session.as_str())).unwrap();

	h.cache.on_detection(sighting(&session, 8, 0.7, 1, b"x")).await;

	assert_eq!(h.cache.lost_detections(), 1);
	assert!(h.cache.detection(&session, 8).is_none());
	let fault = h.faults.try_recv().unwrap();
	assert_eq!((fault.session, fault.track_id), (session, 8));
}

#[tokio::test]
async fn failed_improvement_keeps_the_previous_best_shot() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let session = sid("20240101000000");
	h.cache.open_session(session.clone()).await.unwrap();
	h.cache.record_detection(&sighting(&session, 7, 0.4, 100, b"first")).await.unwrap();

	let storage = h.cache.storage().clone();
	let metadata = storage.metadata_path(&session, 7);
	std::fs::remove_file(&metadata).unwrap();
	std::fs::create_dir(&metadata).unwrap();

	h.cache.on_detection(sighting(&session, 7, 0.9, 105, b"second")).await;
	assert_eq!(h.cache.lost_detections(), 1);
	assert!(h.faults.try_recv().is_some());
	assert_eq!(h.cache.detection(&session, 7).unwrap().score, 0.4);
	assert_eq!(std::fs::read(storage.image_path(&session, 7)).unwrap(), b"first");

	std::fs::remove_dir(&metadata).unwrap();
	let outcome = h.cache.record_detection(&sighting(&session, 7, 0.3, 110, b"third")).await.unwrap();
	assert_eq!(outcome, DetectionOutcome::Refreshed);
	assert_eq!(std::fs::read(storage.image_path(&session, 7)).unwrap(), b"first");

	let images: Vec<_> = std::fs::read_dir(storage.image_path(&session, 7).parent().unwrap())
		.unwrap()
		.map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
		.collect();
	assert_eq!(images, vec!["7.jpg"]);
}

#[tokio::test]
async fn detection_for_unknown_session_is_lost() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	h.cache.on_detection(sighting(&sid("20240101000000"), 1, 0.7, 1, b"x")).await;

	assert_eq!(h.cache.lost_detections(), 1);
	assert!(h.faults.try_recv().unwrap().reason.contains("unknown session"));
}

#[tokio::test]
async fn lost_detection_is_reported_to_the_client() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let faults = h.bus.topic::<StorageFault>(STORAGE_FAULT_TOPIC).unwrap();
	let publisher = Multiplexer::new(&h.bus).unwrap().publisher();
	let cancel = CancellationToken::new();
	let reporter = spawn_fault_reporter(&faults, publisher, cancel.clone());

	h.cache.on_detection(sighting(&sid("20240101000000"), 3, 0.7, 1, b"x")).await;

	let envelope = tokio::time::timeout(Duration::from_secs(1), h.outbound.recv()).await.unwrap().unwrap();
	assert_eq!(envelope.identifier(), identifiers::DETECTION_LOST);
	let lost = envelope.parse::<DetectionLost>().unwrap();
	assert_eq!((lost.session.as_str(), lost.track_id), ("20240101000000", 3));
	assert!(lost.reason.contains("unknown session"));

	cancel.cancel();
	reporter.await.unwrap();
}

#[tokio::test]
async fn sessions_request_lists_ascending() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	for raw in ["20240101000200", "20240101000000"] {
		std::fs::create_dir_all(h.sessions_root().join(raw)).unwrap();
	}
	h.cache.init().await.unwrap();

	h.cache.handle_request(&Envelope::empty(identifiers::SESSIONS)).await.unwrap();
	let sessions: Vec<_> = h.sent().iter().map(|env| env.parse::<SessionDetails>().unwrap().session).collect();
	assert_eq!(sessions, vec!["20240101000000", "20240101000200"]);
}

#[tokio::test]
async fn detections_request_for_unknown_session_fails() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let request = Envelope::from_message(identifiers::SESSION_DETECTIONS, &SessionRef { session: "20991231000000".into() }).unwrap();
	assert!(matches!(h.cache.handle_request(&request).await, Err(Error::UnknownSession(_))));
	assert!(h.sent().is_empty());
}

#[tokio::test]
async fn task_applies_open_before_detections() {
	let mut h = Harness::new(5);
	h.cache.init().await.unwrap();
	let channels = Channels::new(&h.bus, 2).unwrap();
	let requests = h.bus.topic::<Envelope>("sessions.requests").unwrap();
	let cancel = CancellationToken::new();

	let Harness { cache, mut outbound, .. } = h;
	let task = cache.spawn(&channels, &requests, cancel.clone());

	let session = sid("20240101000000");
	channels.sessions.publish(SessionEvent::Opened(session.clone()));
	channels.detections.publish(sighting(&session, 1, 0.9, 1, b"x"));

	let mut seen = Vec::new();
	while seen.len() < 3 {
		let envelope = tokio::time::timeout(Duration::from_secs(2), outbound.recv()).await.unwrap().unwrap();
		seen.push(envelope.identifier().to_string());
	}
	assert_eq!(seen, vec![identifiers::SESSION_NEW, identifiers::DETECTION, identifiers::SESSION_DETAILS]);

	cancel.cancel();
	task.await.unwrap();
}

#[tokio::test]
async fn summarize_reads_from_disk() {
	let tmp = TempDir::new().unwrap();
	let storage = SessionStorage::new(tmp.path());
	let session = sid("20240101000000");
	storage.create_session(&session).await.unwrap();
	let event = sighting(&session, 1, 0.7, 1, b"x");
	storage.write_metadata(&event.record).await.unwrap();

	assert_eq!(summarize(&storage).await.unwrap(), vec![(session, 1)]);
}
