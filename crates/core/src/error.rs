use thiserror::Error;

/// Errors produced by the device core.
#[derive(Debug, Error)]
pub enum Error {
	#[error("storage error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("settings error: {0}")]
	Settings(String),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("camera error: {0}")]
	Camera(String),

	#[error("inference error: {0}")]
	Inference(String),

	#[error("image error: {0}")]
	Image(#[from] image::ImageError),

	/// Metadata and image are written together, so a catalogued detection
	/// without its image means the store was tampered with or corrupted.
	#[error("image missing for detection {track_id} in session {session}")]
	MissingImage { session: String, track_id: i64 },

	#[error("unknown session: {0}")]
	UnknownSession(String),

	#[error(transparent)]
	Runtime(#[from] trap_runtime::Error),

	#[error(transparent)]
	Decode(#[from] trap_protocol::DecodeError),
}

pub type Result<T> = std::result::Result<T, Error>;
