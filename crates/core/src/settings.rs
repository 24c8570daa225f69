//! Durable operator settings.
//!
//! A single JSON document at `<settings_path>/settings.db`. Writes go to a
//! temporary file in the same directory which is then renamed over the old
//! one, so a crash leaves either the previous or the new document, never a
//! partial one. Consumers call [`SettingsStore::current`] at the point of use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trap_protocol::{Envelope, Settings, identifiers};
use trap_runtime::{Publisher, Topic};

use crate::error::{Error, Result};

pub const SETTINGS_FILE: &str = "settings.db";

pub struct SettingsStore {
	path: PathBuf,
	current: RwLock<Settings>,
}

impl SettingsStore {
	/// Loads the stored settings from `dir`, creating the directory if needed.
	///
	/// When nothing is stored, or the stored document is unreadable, `defaults`
	/// are persisted and used.
	pub fn open(dir: impl AsRef<Path>, defaults: Settings) -> Result<Self> {
		let dir = dir.as_ref();
		std::fs::create_dir_all(dir)?;
		let path = dir.join(SETTINGS_FILE);

		let settings = match Self::read(&path) {
			Ok(Some(stored)) => {
				debug!(target: "trap.settings", path = %path.display(), "settings loaded");
				normalize(stored)
			}
			Ok(None) => {
				info!(target: "trap.settings", path = %path.display(), "no stored settings; writing defaults");
				Self::persist(&path, &defaults)?;
				defaults
			}
			Err(err) => {
				warn!(target: "trap.settings", path = %path.display(), error = %err, "stored settings unreadable; restoring defaults");
				Self::persist(&path, &defaults)?;
				defaults
			}
		};

		Ok(Self {
			path,
			current: RwLock::new(settings),
		})
	}

	/// Reads the document at `path`; `Ok(None)` when it does not exist.
	pub fn read(path: &Path) -> Result<Option<Settings>> {
		let bytes = match std::fs::read(path) {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};
		serde_json::from_slice(&bytes)
			.map(Some)
			.map_err(|err| Error::Settings(format!("invalid {}: {err}", path.display())))
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn current(&self) -> Settings {
		self.current.read().clone()
	}

	/// Normalizes and persists `settings`, returning the snapshot actually stored.
	pub fn set(&self, settings: Settings) -> Result<Settings> {
		let mut current = self.current.write();
		Self::persist(&self.path, &normalize(settings))?;
		let stored = Self::read(&self.path)?.ok_or_else(|| Error::Settings(format!("{} vanished after write", self.path.display())))?;
		*current = stored.clone();
		Ok(stored)
	}

	fn persist(path: &Path, settings: &Settings) -> Result<()> {
		let dir = path.parent().unwrap_or_else(|| Path::new("."));
		let mut tmp = NamedTempFile::new_in(dir)?;
		serde_json::to_writer_pretty(tmp.as_file_mut(), settings)?;
		tmp.as_file_mut().sync_all()?;
		tmp.persist(path).map_err(|err| Error::Io(err.error))?;
		Ok(())
	}
}

/// Keeps values inside their usable range: at least one retained session
/// and a score threshold within `[0, 1]`.
pub fn normalize(mut settings: Settings) -> Settings {
	settings.max_sessions = settings.max_sessions.max(1);
	settings.min_score = if settings.min_score.is_nan() {
		Settings::default().min_score
	} else {
		settings.min_score.clamp(0.0, 1.0)
	};
	settings
}

pub fn handle_request(store: &SettingsStore, request: &Envelope, publisher: &Publisher) -> Result<()> {
	match request.identifier() {
		identifiers::SETTINGS_GET => publisher.send(identifiers::SETTINGS, &store.current()),
		identifiers::SETTINGS_SET => {
			let stored = store.set(request.parse()?)?;
			info!(target: "trap.settings", trap_name = %stored.trap_name, max_sessions = stored.max_sessions, min_score = stored.min_score, "settings updated");
			publisher.send(identifiers::SETTINGS, &stored);
		}
		other => warn!(target: "trap.settings", identifier = other, "unexpected settings request"),
	}
	Ok(())
}

/// Serves `settings.get` / `settings.set` from `requests` until `cancel` fires.
pub fn spawn_service(store: Arc<SettingsStore>, requests: &Topic<Envelope>, publisher: Publisher, cancel: CancellationToken) -> JoinHandle<()> {
	requests.spawn_handler(cancel, move |request| {
		let store = Arc::clone(&store);
		let publisher = publisher.clone();
		async move { handle_request(&store, &request, &publisher) }
	})
}
