//! The outer protocol wrapper and its codec.
//!
//! One envelope is one transport frame:
//!
//! ```json
//! { "identifier": "settings.set", "payload": "eyJ0cmFwX25hbWUiOiJvYWsifQ==" }
//! ```
//!
//! The payload is opaque at this level; [`Envelope::parse`] decodes it into the
//! message type registered for the identifier.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to turn received bytes into an envelope or a typed payload.
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("malformed envelope: {0}")]
	Envelope(#[source] serde_json::Error),

	#[error("malformed payload for '{identifier}': {source}")]
	Payload {
		identifier: String,
		#[source]
		source: serde_json::Error,
	},
}

/// Identifier plus opaque payload. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
	identifier: String,
	#[serde(with = "crate::bytes", default)]
	payload: Vec<u8>,
}

impl Envelope {
	/// Wraps an already-encoded payload.
	pub fn new(identifier: impl Into<String>, payload: Vec<u8>) -> Self {
		Self {
			identifier: identifier.into(),
			payload,
		}
	}

	/// Builds an envelope with an empty payload (plain requests such as `settings.get`).
	pub fn empty(identifier: impl Into<String>) -> Self {
		Self::new(identifier, Vec::new())
	}

	/// Serializes `message` as the payload.
	pub fn from_message<M: Serialize>(identifier: impl Into<String>, message: &M) -> Result<Self, serde_json::Error> {
		Ok(Self::new(identifier, serde_json::to_vec(message)?))
	}

	pub fn identifier(&self) -> &str {
		&self.identifier
	}

	pub fn payload(&self) -> &[u8] {
		&self.payload
	}

	/// Decodes the payload as `M`.
	pub fn parse<M: DeserializeOwned>(&self) -> Result<M, DecodeError> {
		serde_json::from_slice(&self.payload).map_err(|source| DecodeError::Payload {
			identifier: self.identifier.clone(),
			source,
		})
	}

	/// Encodes the envelope into a single transport frame.
	pub fn encode(&self) -> Vec<u8> {
		// A struct of a String and a base64 string cannot fail to serialize.
		serde_json::to_vec(self).unwrap_or_default()
	}

	/// Decodes one transport frame.
	pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
		serde_json::from_slice(frame).map_err(DecodeError::Envelope)
	}
}
