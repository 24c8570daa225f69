//! Detection capability.
//!
//! Detectors are synchronous and may be slow, so they run on a dedicated OS
//! thread behind [`InferenceWorker`]; the capture loop awaits each result.

mod worker;

use image::RgbImage;

pub use worker::InferenceWorker;

use crate::config::DetectorKind;
use crate::error::Result;

/// Axis-aligned box in pixel coordinates of the image it was found in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
	pub x0: f32,
	pub y0: f32,
	pub x1: f32,
	pub y1: f32,
}

impl BoundingBox {
	pub const fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
		Self { x0, y0, x1, y1 }
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
	pub bbox: BoundingBox,
	/// Tracker identity; detections the tracker has not assigned yet carry none.
	pub track_id: Option<i64>,
	pub score: f32,
	pub class: i32,
}

pub trait Detector: Send + 'static {
	fn name(&self) -> &str;

	fn infer(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;
}

/// Detector that never finds anything.
pub struct NullDetector;

impl Detector for NullDetector {
	fn name(&self) -> &str {
		"none"
	}

	fn infer(&mut self, _image: &RgbImage) -> Result<Vec<Detection>> {
		Ok(Vec::new())
	}
}

pub fn create_detector(kind: DetectorKind) -> Box<dyn Detector> {
	match kind {
		DetectorKind::None => Box::new(NullDetector),
	}
}
