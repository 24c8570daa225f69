use serde::{Deserialize, Serialize};

use super::SessionId;

/// Persisted metadata of one tracked subject within a session.
///
/// `score`, `class`, `width`, and `height` describe the stored best-shot
/// image; `updated` moves on every sighting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
	pub session: SessionId,
	pub track_id: i64,
	pub created: i64,
	pub updated: i64,
	pub score: f32,
	pub class: i32,
	pub width: u32,
	pub height: u32,
}

impl DetectionRecord {
	/// Folds a new sighting of the same track into this record.
	///
	/// Returns `true` when the sighting scored strictly higher and its image
	/// must replace the stored one. `created` never changes.
	pub fn merge(&mut self, sighting: &DetectionRecord) -> bool {
		self.updated = sighting.updated;
		if sighting.score > self.score {
			self.score = sighting.score;
			self.class = sighting.class;
			self.width = sighting.width;
			self.height = sighting.height;
			true
		} else {
			false
		}
	}

	pub fn to_message(&self, image: Vec<u8>) -> trap_protocol::Detection {
		trap_protocol::Detection {
			session: self.session.to_string(),
			track_id: self.track_id,
			created: self.created,
			updated: self.updated,
			score: self.score,
			class: self.class,
			width: self.width,
			height: self.height,
			image,
		}
	}
}
