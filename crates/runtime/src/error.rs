use thiserror::Error;
use trap_protocol::DecodeError;

/// Errors raised by the runtime plumbing.
#[derive(Debug, Error)]
pub enum Error {
	#[error("transport error: {0}")]
	Transport(String),

	#[error("connection closed")]
	ConnectionClosed,

	#[error(transparent)]
	Decode(#[from] DecodeError),

	#[error("failed to encode '{identifier}': {source}")]
	Encode {
		identifier: String,
		#[source]
		source: serde_json::Error,
	},

	#[error("channel '{name}' is already registered with a different item type")]
	ChannelType { name: String },

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
