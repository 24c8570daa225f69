//! Wire types for the trap device protocol.
//!
//! Every message exchanged with the remote client travels inside an
//! [`Envelope`]: a string identifier plus an opaque payload. This crate owns
//! the envelope codec, the identifier catalog, and the serde shapes of the
//! payloads carried under each identifier.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond serialization/deserialization
//! * Stable: Changes only when the wire protocol changes
//!
//! String identifiers stop at this crate's boundary. Components inside the
//! device talk through typed channels in `trap-runtime`.

mod bytes;
pub mod envelope;
pub mod identifiers;
pub mod messages;

pub use envelope::{DecodeError, Envelope};
pub use identifiers::CameraIdentifiers;
pub use messages::*;
