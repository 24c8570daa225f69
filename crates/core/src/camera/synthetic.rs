//! Hardware-free camera.
//!
//! Renders a drifting gradient with a bright square crossing it, paced at
//! roughly ten frames per second, and simulates autofocus scans so the focus
//! controls can be exercised end to end.

use std::time::Duration;

use async_trait::async_trait;
use image::{Rgb, RgbImage};

use super::{AfMode, AfState, Camera, CapturedFrame, Control, FrameMetadata, Size, StreamConfig};
use crate::error::{Error, Result};

const FRAME_INTERVAL: Duration = Duration::from_millis(100);
const SCAN_FRAMES: u32 = 5;

pub struct SyntheticCamera {
	config: StreamConfig,
	interval: Duration,
	frame: u64,
	mode: AfMode,
	af_state: AfState,
	scan_remaining: u32,
	lens_position: f32,
}

impl Default for SyntheticCamera {
	fn default() -> Self {
		Self::new()
	}
}

impl SyntheticCamera {
	pub fn new() -> Self {
		Self {
			config: StreamConfig {
				main: Size::new(640, 480),
				lores: Size::new(320, 320),
			},
			interval: FRAME_INTERVAL,
			frame: 0,
			mode: AfMode::Continuous,
			af_state: AfState::Scanning,
			scan_remaining: SCAN_FRAMES,
			lens_position: 1.0,
		}
	}

	pub fn with_interval(mut self, interval: Duration) -> Self {
		self.interval = interval;
		self
	}

	fn start_scan(&mut self) {
		self.af_state = AfState::Scanning;
		self.scan_remaining = SCAN_FRAMES;
	}

	fn advance_focus(&mut self) {
		if self.af_state != AfState::Scanning {
			return;
		}
		self.scan_remaining = self.scan_remaining.saturating_sub(1);
		if self.scan_remaining == 0 {
			self.af_state = AfState::Focused;
			self.lens_position = 2.0 + (self.frame % 7) as f32 * 0.25;
		}
	}

	fn render(&self, size: Size) -> RgbImage {
		let width = size.width.max(1);
		let height = size.height.max(1);
		let shift = (self.frame * 4 % u64::from(width)) as u32;
		let side = (width.min(height) / 5).max(1);
		let span = width.saturating_sub(side).max(1);
		let square_x = (self.frame * 4 % u64::from(span)) as u32;
		let square_y = height.saturating_sub(side) / 2;

		RgbImage::from_fn(size.width, size.height, |x, y| {
			if (square_x..square_x + side).contains(&x) && (square_y..square_y + side).contains(&y) {
				return Rgb([250, 240, 60]);
			}
			let r = ((x + shift) % width * 255 / width) as u8;
			let g = (y * 255 / height) as u8;
			Rgb([r, g, 96])
		})
	}
}

#[async_trait]
impl Camera for SyntheticCamera {
	fn name(&self) -> &str {
		"synthetic"
	}

	fn configure(&mut self, config: &StreamConfig) -> Result<()> {
		for size in [config.main, config.lores] {
			if size.width == 0 || size.height == 0 {
				return Err(Error::Camera(format!("unsupported stream size {}x{}", size.width, size.height)));
			}
		}
		self.config = *config;
		Ok(())
	}

	async fn capture_next(&mut self) -> Result<CapturedFrame> {
		tokio::time::sleep(self.interval).await;
		self.frame += 1;
		self.advance_focus();

		Ok(CapturedFrame {
			main: self.render(self.config.main),
			lores: self.render(self.config.lores),
			metadata: FrameMetadata {
				af_state: self.af_state as i32,
				lens_position: self.lens_position,
			},
		})
	}

	fn apply_controls(&mut self, control: Control) -> Result<()> {
		match control {
			Control::AfMode(mode) => {
				self.mode = mode;
				match mode {
					AfMode::Manual => self.af_state = AfState::Idle,
					AfMode::Continuous => self.start_scan(),
					AfMode::Auto => self.af_state = AfState::Idle,
				}
			}
			Control::LensPosition(position) => {
				if self.mode != AfMode::Manual {
					return Err(Error::Camera("lens position requires manual focus".into()));
				}
				if !(0.0..=15.0).contains(&position) {
					return Err(Error::Camera(format!("lens position {position} out of range")));
				}
				self.lens_position = position;
			}
			Control::AutofocusCycle => {
				if self.mode != AfMode::Auto {
					return Err(Error::Camera("autofocus cycle requires triggered focus".into()));
				}
				self.start_scan();
			}
		}
		Ok(())
	}
}
