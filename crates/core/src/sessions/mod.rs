//! Session and detection cache.
//!
//! One task owns the cache and is the only writer of both the on-disk session
//! directories and the in-memory index; it consumes session lifecycle and
//! detection events from the capture workflow and answers client queries.
//! Images are never kept in memory: queries read them back from disk.

mod id;
mod record;
mod storage;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trap_protocol::{DetectionLost, Envelope, SessionDetails, SessionRef, identifiers};
use trap_runtime::{Publisher, Topic};

pub use id::{SessionId, SessionIdGenerator};
pub use record::DetectionRecord;
pub use storage::SessionStorage;

use crate::error::{Error, Result};
use crate::events::{Channels, DetectionEvent, SessionEvent, StorageFault};
use crate::settings::SettingsStore;

/// What a detection event did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionOutcome {
	/// First sighting of the track in its session.
	New,
	/// Higher score; the stored best shot was replaced.
	Improved,
	/// Only `updated` moved.
	Refreshed,
}

#[derive(Debug, Default)]
struct SessionEntry {
	order: Vec<i64>,
	records: HashMap<i64, DetectionRecord>,
}

impl SessionEntry {
	fn insert(&mut self, record: DetectionRecord) {
		let track_id = record.track_id;
		if self.records.insert(track_id, record).is_none() {
			self.order.push(track_id);
		}
	}

	fn len(&self) -> usize {
		self.order.len()
	}
}

pub struct SessionCache {
	storage: SessionStorage,
	settings: Arc<SettingsStore>,
	publisher: Publisher,
	faults: Topic<StorageFault>,
	index: BTreeMap<SessionId, SessionEntry>,
	current: Option<SessionId>,
	lost_detections: u64,
}

impl SessionCache {
	pub fn new(storage: SessionStorage, settings: Arc<SettingsStore>, publisher: Publisher, faults: Topic<StorageFault>) -> Self {
		Self {
			storage,
			settings,
			publisher,
			faults,
			index: BTreeMap::new(),
			current: None,
			lost_detections: 0,
		}
	}

	/// Rebuilds the index from disk. Returns the newest session found.
	///
	/// Replayed sessions are historical; none of them becomes current.
	pub async fn init(&mut self) -> Result<Option<SessionId>> {
		self.storage.ensure_root().await?;
		self.index.clear();
		self.current = None;

		for session in self.storage.list_sessions().await? {
			let mut entry = SessionEntry::default();
			match self.storage.read_metadata(&session).await {
				Ok(records) => records.into_iter().for_each(|record| entry.insert(record)),
				Err(err) => error!(target: "trap.sessions", %session, error = %err, "cannot replay session metadata"),
			}
			debug!(target: "trap.sessions", %session, detections = entry.len(), "session replayed");
			self.index.insert(session, entry);
		}

		info!(target: "trap.sessions", root = %self.storage.root().display(), sessions = self.index.len(), "session cache rebuilt");
		Ok(self.index.keys().next_back().cloned())
	}

	pub fn storage(&self) -> &SessionStorage {
		&self.storage
	}

	pub fn current_session(&self) -> Option<&SessionId> {
		self.current.as_ref()
	}

	/// Detections that could not be persisted since startup.
	pub fn lost_detections(&self) -> u64 {
		self.lost_detections
	}

	pub fn detection(&self, session: &SessionId, track_id: i64) -> Option<&DetectionRecord> {
		self.index.get(session)?.records.get(&track_id)
	}

	/// `(session, detection count)` pairs, oldest session first.
	pub fn sessions(&self) -> Vec<(SessionId, usize)> {
		self.index.iter().map(|(id, entry)| (id.clone(), entry.len())).collect()
	}

	/// Detections of `session`, most recently added first, each with its stored image.
	pub async fn detections(&self, session: &SessionId) -> Result<Vec<(DetectionRecord, Vec<u8>)>> {
		let entry = self.index.get(session).ok_or_else(|| Error::UnknownSession(session.to_string()))?;
		let mut detections = Vec::with_capacity(entry.len());
		for track_id in entry.order.iter().rev() {
			let Some(record) = entry.records.get(track_id) else {
				continue;
			};
			let image = self.storage.read_image(session, *track_id).await?;
			detections.push((record.clone(), image));
		}
		Ok(detections)
	}

	/// Creates the session on disk, makes it current, then enforces retention.
	pub async fn open_session(&mut self, session: SessionId) -> Result<()> {
		self.storage.create_session(&session).await?;
		self.index.insert(session.clone(), SessionEntry::default());
		self.current = Some(session.clone());
		info!(target: "trap.sessions", %session, "session opened");
		self.publisher.send(identifiers::SESSION_NEW, &SessionRef { session: session.to_string() });

		self.sweep().await?;
		Ok(())
	}

	/// Ends the current session. Its files and index entry stay until evicted.
	pub fn close_session(&mut self, session: &SessionId) {
		if self.current.as_ref() == Some(session) {
			self.current = None;
			info!(target: "trap.sessions", %session, "session closed");
		} else {
			debug!(target: "trap.sessions", %session, "close for a session that is not current");
		}
	}

	/// Applies the best-shot rule to one detection and persists the result.
	pub async fn record_detection(&mut self, event: &DetectionEvent) -> Result<DetectionOutcome> {
		let incoming = &event.record;
		let session = &incoming.session;
		let entry = self.index.get(session).ok_or_else(|| Error::UnknownSession(session.to_string()))?;

		match entry.records.get(&incoming.track_id) {
			None => {
				self.storage.write_detection(incoming, Some(event.image.as_slice()), None).await?;

				let entry = self.index.get_mut(session).ok_or_else(|| Error::UnknownSession(session.to_string()))?;
				entry.insert(incoming.clone());
				let detections = entry.len() as u32;

				debug!(target: "trap.sessions", %session, track_id = incoming.track_id, score = incoming.score, "new detection");
				self.publisher.send(identifiers::DETECTION, &incoming.to_message(event.image.to_vec()));
				self.publisher.send(
					identifiers::SESSION_DETAILS,
					&SessionDetails {
						session: session.to_string(),
						detections,
					},
				);
				Ok(DetectionOutcome::New)
			}
			Some(stored) => {
				let mut merged = stored.clone();
				let improved = merged.merge(incoming);
				let image = improved.then_some(event.image.as_slice());
				self.storage.write_detection(&merged, image, Some(stored)).await?;

				debug!(target: "trap.sessions", %session, track_id = merged.track_id, score = merged.score, improved, "detection updated");
				if let Some(entry) = self.index.get_mut(session) {
					entry.insert(merged);
				}
				Ok(if improved { DetectionOutcome::Improved } else { DetectionOutcome::Refreshed })
			}
		}
	}

	/// Deletes the oldest sessions so that at most `max_sessions` remain on disk.
	///
	/// Returns the evicted ids, oldest first. A session that cannot be deleted
	/// is logged and kept; the next sweep tries again.
	pub async fn sweep(&mut self) -> Result<Vec<SessionId>> {
		let cap = self.settings.current().max_sessions.max(1) as usize;
		let on_disk = self.storage.list_sessions().await?;
		if on_disk.len() < cap {
			return Ok(Vec::new());
		}

		let excess = on_disk.len() - cap;
		let mut evicted = Vec::with_capacity(excess);
		for session in on_disk.into_iter().take(excess) {
			if let Err(err) = self.storage.delete_session(&session).await {
				error!(target: "trap.sessions", %session, error = %err, "failed to evict session");
				continue;
			}
			self.index.remove(&session);
			if self.current.as_ref() == Some(&session) {
				self.current = None;
			}
			info!(target: "trap.sessions", %session, cap, "session evicted");
			self.publisher.send(identifiers::SESSION_DELETE, &SessionRef { session: session.to_string() });
			evicted.push(session);
		}
		Ok(evicted)
	}

	async fn on_session_event(&mut self, event: SessionEvent) {
		match event {
			SessionEvent::Opened(session) => {
				if let Err(err) = self.open_session(session.clone()).await {
					error!(target: "trap.sessions", %session, error = %err, "failed to open session");
				}
			}
			SessionEvent::Closed(session) => self.close_session(&session),
		}
	}

	/// Records `event`; a failure drops the detection and raises a storage fault.
	pub async fn on_detection(&mut self, event: DetectionEvent) {
		if let Err(err) = self.record_detection(&event).await {
			self.lost_detections += 1;
			warn!(
				target: "trap.sessions",
				session = %event.record.session,
				track_id = event.record.track_id,
				lost = self.lost_detections,
				error = %err,
				"detection lost"
			);
			self.faults.publish(StorageFault {
				session: event.record.session.clone(),
				track_id: event.record.track_id,
				reason: err.to_string(),
			});
		}
	}

	/// Answers `sessions` and `session.detections`.
	pub async fn handle_request(&self, request: &Envelope) -> Result<()> {
		match request.identifier() {
			identifiers::SESSIONS => {
				for (session, detections) in self.sessions() {
					self.publisher.send(
						identifiers::SESSION_DETAILS,
						&SessionDetails {
							session: session.to_string(),
							detections: detections as u32,
						},
					);
				}
			}
			identifiers::SESSION_DETECTIONS => {
				let SessionRef { session } = request.parse::<SessionRef>()?;
				let session = SessionId::parse(&session).ok_or(Error::UnknownSession(session))?;
				for (record, image) in self.detections(&session).await? {
					self.publisher.send(identifiers::DETECTION, &record.to_message(image));
				}
			}
			other => warn!(target: "trap.sessions", identifier = other, "unexpected sessions request"),
		}
		Ok(())
	}

	/// Moves the cache onto its own task.
	///
	/// Subscriptions are taken before this returns, so events published after
	/// the call are never missed.
	pub fn spawn(mut self, channels: &Channels, requests: &Topic<Envelope>, cancel: CancellationToken) -> JoinHandle<()> {
		let mut sessions = channels.sessions.subscribe();
		let mut detections = channels.detections.subscribe();
		let mut requests = requests.subscribe();

		tokio::spawn(async move {
			loop {
				// Session events win ties: an Opened is always published before
				// the detections that reference it.
				tokio::select! {
					biased;
					_ = cancel.cancelled() => break,
					Some(event) = sessions.recv() => self.on_session_event(event).await,
					Some(event) = detections.recv() => self.on_detection(event).await,
					Some(request) = requests.recv() => {
						match self.handle_request(&request).await {
							Ok(()) => {}
							Err(err @ Error::MissingImage { .. }) => {
								error!(target: "trap.sessions", identifier = request.identifier(), error = %err, "session store is inconsistent");
							}
							Err(err) => warn!(target: "trap.sessions", identifier = request.identifier(), error = %err, "request failed"),
						}
					}
					else => break,
				}
			}
			debug!(target: "trap.sessions", lost = self.lost_detections, "session cache stopped");
		})
	}
}

/// Tells the client about every detection the cache failed to store.
pub fn spawn_fault_reporter(faults: &Topic<StorageFault>, publisher: Publisher, cancel: CancellationToken) -> JoinHandle<()> {
	faults.spawn_handler(cancel, move |fault: StorageFault| {
		publisher.send(
			identifiers::DETECTION_LOST,
			&DetectionLost {
				session: fault.session.to_string(),
				track_id: fault.track_id,
				reason: fault.reason,
			},
		);
		async { Ok::<(), Error>(()) }
	})
}

/// `(session, detection count)` for every session under `storage`, read
/// straight from disk.
pub async fn summarize(storage: &SessionStorage) -> Result<Vec<(SessionId, usize)>> {
	let mut summary = Vec::new();
	for session in storage.list_sessions().await? {
		let count = storage.read_metadata(&session).await?.len();
		summary.push((session, count));
	}
	Ok(summary)
}
