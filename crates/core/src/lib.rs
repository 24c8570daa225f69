//! Coordination core of the trap field device.
//!
//! Independently running components meet on the event bus from
//! `trap-runtime`:
//!
//! * [`settings`]: durable operator settings, atomically rewritten.
//! * [`sessions`]: on-disk session/detection cache with best-shot retention
//!   and a bounded number of sessions.
//! * [`camera`]: camera capability plus the control command queue drained
//!   once per capture cycle.
//! * [`detector`]: detection capability and the worker thread it runs on.
//! * [`workflow`]: the capture loop producing session and detection events.
//! * [`app`]: composition root wiring it all to the connection multiplexer.

pub mod app;
pub mod camera;
pub mod config;
pub mod detector;
pub mod error;
pub mod events;
pub mod render;
pub mod sessions;
pub mod settings;
pub mod workflow;

pub use app::TrapApp;
pub use config::Configuration;
pub use error::{Error, Result};
pub use settings::SettingsStore;
