//! Camera capability.
//!
//! A camera yields paired frames (full resolution plus a low-resolution
//! companion) and accepts hardware-level controls. Everything above it works
//! with the protocol's autofocus vocabulary; [`control`] owns the mapping.

pub mod control;
pub mod synthetic;

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Serialize};

pub use control::{CameraCommand, CameraControl};
pub use synthetic::SyntheticCamera;

use crate::config::CameraKind;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
	pub width: u32,
	pub height: u32,
}

impl Size {
	pub const fn new(width: u32, height: u32) -> Self {
		Self { width, height }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
	pub main: Size,
	pub lores: Size,
}

/// Hardware autofocus mode values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AfMode {
	Manual = 0,
	Auto = 1,
	Continuous = 2,
}

/// Hardware autofocus state values as reported in frame metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AfState {
	Idle = 0,
	Scanning = 1,
	Focused = 2,
	Failed = 3,
}

impl TryFrom<i32> for AfState {
	type Error = i32;

	fn try_from(raw: i32) -> std::result::Result<Self, i32> {
		match raw {
			0 => Ok(Self::Idle),
			1 => Ok(Self::Scanning),
			2 => Ok(Self::Focused),
			3 => Ok(Self::Failed),
			other => Err(other),
		}
	}
}

/// A single hardware control write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Control {
	AfMode(AfMode),
	LensPosition(f32),
	AutofocusCycle,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetadata {
	/// Raw [`AfState`] value.
	pub af_state: i32,
	pub lens_position: f32,
}

pub struct CapturedFrame {
	pub main: RgbImage,
	pub lores: RgbImage,
	pub metadata: FrameMetadata,
}

#[async_trait]
pub trait Camera: Send {
	fn name(&self) -> &str;

	/// Applies stream sizes. Called once before the first capture.
	fn configure(&mut self, config: &StreamConfig) -> Result<()>;

	/// Waits for the next paired frame.
	async fn capture_next(&mut self) -> Result<CapturedFrame>;

	fn apply_controls(&mut self, control: Control) -> Result<()>;
}

pub fn create_camera(kind: CameraKind) -> Box<dyn Camera> {
	match kind {
		CameraKind::Synthetic => Box::new(SyntheticCamera::new()),
	}
}
