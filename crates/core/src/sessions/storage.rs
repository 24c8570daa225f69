//! On-disk layout of the session cache.
//!
//! ```text
//! <root>/<session>/images/<track_id>.jpg
//! <root>/<session>/metadata/<track_id>.json
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{error, warn};

use super::{DetectionRecord, SessionId};
use crate::error::{Error, Result};

const IMAGES_DIR: &str = "images";
const METADATA_DIR: &str = "metadata";
const STAGED_EXTENSION: &str = "jpg.partial";

#[derive(Debug, Clone)]
pub struct SessionStorage {
	root: PathBuf,
}

impl SessionStorage {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn session_dir(&self, session: &SessionId) -> PathBuf {
		self.root.join(session.as_str())
	}

	pub fn image_path(&self, session: &SessionId, track_id: i64) -> PathBuf {
		self.session_dir(session).join(IMAGES_DIR).join(format!("{track_id}.jpg"))
	}

	pub fn metadata_path(&self, session: &SessionId, track_id: i64) -> PathBuf {
		self.session_dir(session).join(METADATA_DIR).join(format!("{track_id}.json"))
	}

	pub async fn ensure_root(&self) -> Result<()> {
		fs::create_dir_all(&self.root).await?;
		Ok(())
	}

	/// Creates the session directory and its two subdirectories.
	pub async fn create_session(&self, session: &SessionId) -> Result<()> {
		let dir = self.session_dir(session);
		fs::create_dir(&dir).await?;
		fs::create_dir(dir.join(IMAGES_DIR)).await?;
		fs::create_dir(dir.join(METADATA_DIR)).await?;
		Ok(())
	}

	/// Valid session directories, oldest first.
	///
	/// Entries that are not directories or whose name is not a session id are
	/// skipped with a warning and never count toward retention.
	pub async fn list_sessions(&self) -> Result<Vec<SessionId>> {
		let mut sessions = Vec::new();
		let mut entries = fs::read_dir(&self.root).await?;
		while let Some(entry) = entries.next_entry().await? {
			let name = entry.file_name();
			let name = name.to_string_lossy();
			if !entry.file_type().await?.is_dir() {
				continue;
			}
			match SessionId::parse(&name) {
				Some(id) => sessions.push(id),
				None => warn!(target: "trap.sessions", entry = %name, "ignoring directory that is not a session"),
			}
		}
		sessions.sort();
		Ok(sessions)
	}

	/// All readable metadata records of `session`, in file name order.
	///
	/// Unreadable or corrupt files are logged and skipped.
	pub async fn read_metadata(&self, session: &SessionId) -> Result<Vec<DetectionRecord>> {
		let dir = self.session_dir(session).join(METADATA_DIR);
		let mut entries = match fs::read_dir(&dir).await {
			Ok(entries) => entries,
			Err(err) if err.kind() == ErrorKind::NotFound => {
				warn!(target: "trap.sessions", %session, "session has no metadata directory");
				return Ok(Vec::new());
			}
			Err(err) => return Err(err.into()),
		};

		let mut paths = Vec::new();
		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();
			if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
				paths.push(path);
			}
		}
		paths.sort();

		let mut records = Vec::new();
		for path in paths {
			let parsed = match fs::read(&path).await {
				Ok(bytes) => serde_json::from_slice::<DetectionRecord>(&bytes).map_err(Error::from),
				Err(err) => Err(err.into()),
			};
			match parsed {
				Ok(record) if record.session == *session => records.push(record),
				Ok(record) => {
					warn!(target: "trap.sessions", path = %path.display(), owner = %record.session, "metadata belongs to another session; skipped");
				}
				Err(err) => error!(target: "trap.sessions", path = %path.display(), error = %err, "corrupt metadata skipped"),
			}
		}
		Ok(records)
	}

	pub async fn write_metadata(&self, record: &DetectionRecord) -> Result<()> {
		let json = serde_json::to_vec_pretty(record)?;
		fs::write(self.metadata_path(&record.session, record.track_id), json).await?;
		Ok(())
	}

	/// Writes `record` and, with `jpeg`, its image as one unit.
	///
	/// The image is staged beside its final name and moved into place only
	/// after the metadata is on disk. On failure the previous pair is left as
	/// it was: `previous` is the record the metadata file held before, or
	/// `None` for a first sighting.
	pub async fn write_detection(&self, record: &DetectionRecord, jpeg: Option<&[u8]>, previous: Option<&DetectionRecord>) -> Result<()> {
		let Some(jpeg) = jpeg else {
			return self.write_metadata(record).await;
		};

		let image = self.image_path(&record.session, record.track_id);
		let staged = image.with_extension(STAGED_EXTENSION);
		if let Err(err) = fs::write(&staged, jpeg).await {
			discard(&staged).await;
			return Err(err.into());
		}
		if let Err(err) = self.write_metadata(record).await {
			discard(&staged).await;
			self.restore_metadata(record, previous).await;
			return Err(err);
		}
		if let Err(err) = fs::rename(&staged, &image).await {
			discard(&staged).await;
			self.restore_metadata(record, previous).await;
			return Err(err.into());
		}
		Ok(())
	}

	async fn restore_metadata(&self, record: &DetectionRecord, previous: Option<&DetectionRecord>) {
		let restored = match previous {
			Some(previous) => self.write_metadata(previous).await,
			None => match fs::remove_file(self.metadata_path(&record.session, record.track_id)).await {
				Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
				_ => Ok(()),
			},
		};
		if let Err(err) = restored {
			error!(target: "trap.sessions", session = %record.session, track_id = record.track_id, error = %err, "cannot restore metadata");
		}
	}

	pub async fn read_image(&self, session: &SessionId, track_id: i64) -> Result<Vec<u8>> {
		match fs::read(self.image_path(session, track_id)).await {
			Ok(bytes) => Ok(bytes),
			Err(err) if err.kind() == ErrorKind::NotFound => Err(Error::MissingImage {
				session: session.to_string(),
				track_id,
			}),
			Err(err) => Err(err.into()),
		}
	}

	/// Removes the files of `session`, then its directories.
	pub async fn delete_session(&self, session: &SessionId) -> Result<()> {
		let dir = self.session_dir(session);
		for sub in [IMAGES_DIR, METADATA_DIR] {
			let sub = dir.join(sub);
			let mut entries = match fs::read_dir(&sub).await {
				Ok(entries) => entries,
				Err(err) if err.kind() == ErrorKind::NotFound => continue,
				Err(err) => return Err(err.into()),
			};
			while let Some(entry) = entries.next_entry().await? {
				fs::remove_file(entry.path()).await?;
			}
			fs::remove_dir(&sub).await?;
		}
		fs::remove_dir(&dir).await?;
		Ok(())
	}
}

async fn discard(path: &Path) {
	match fs::remove_file(path).await {
		Err(err) if err.kind() != ErrorKind::NotFound => {
			warn!(target: "trap.sessions", path = %path.display(), error = %err, "cannot remove staged image");
		}
		_ => {}
	}
}
