//! In-process event plumbing for the trap device.
//!
//! * [`bus`]: named topics (multicast, publish-order delivery) and queues
//!   (bounded FIFO with serialized consumers), created on first use.
//! * [`transport`]: frame-level duplex links (websocket, in-memory fake).
//! * [`mux`]: the connection multiplexer that binds the single active link to
//!   bus topics by envelope identifier.
//! * [`server`]: websocket accept loop feeding the multiplexer.

pub mod bus;
pub mod error;
pub mod mux;
pub mod server;
pub mod transport;

pub use bus::{Bus, Queue, Subscription, Topic};
pub use error::{Error, Result};
pub use mux::{Multiplexer, Publisher};
pub use server::WebSocketServer;
pub use transport::{FrameSink, FrameSource, TransportParts};
