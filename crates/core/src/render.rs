//! Image helpers for best-shot crops and preview frames.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};

use crate::camera::Size;
use crate::detector::BoundingBox;
use crate::error::Result;

const BOX_COLOR: Rgb<u8> = Rgb([255, 32, 32]);
const BOX_THICKNESS: u32 = 2;

/// Rescales a box found in an image of size `from` to an image of size `to`.
pub fn scale_box(bbox: &BoundingBox, from: Size, to: Size) -> BoundingBox {
	let sx = to.width as f32 / from.width.max(1) as f32;
	let sy = to.height as f32 / from.height.max(1) as f32;
	BoundingBox::new(bbox.x0 * sx, bbox.y0 * sy, bbox.x1 * sx, bbox.y1 * sy)
}

/// Pixel rectangle `(x, y, width, height)` of `bbox` clamped to `bounds`.
///
/// `None` when nothing of the box lies inside the image.
pub fn clamp_box(bbox: &BoundingBox, bounds: Size) -> Option<(u32, u32, u32, u32)> {
	let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
	let (x0, x1) = (clamp(bbox.x0.min(bbox.x1), bounds.width), clamp(bbox.x0.max(bbox.x1), bounds.width));
	let (y0, y1) = (clamp(bbox.y0.min(bbox.y1), bounds.height), clamp(bbox.y0.max(bbox.y1), bounds.height));
	(x1 > x0 && y1 > y0).then(|| (x0, y0, x1 - x0, y1 - y0))
}

pub fn crop(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
	let (x, y, width, height) = clamp_box(bbox, Size::new(image.width(), image.height()))?;
	Some(image::imageops::crop_imm(image, x, y, width, height).to_image())
}

/// Draws rectangle outlines for `boxes` in place.
pub fn draw_boxes<'a>(image: &mut RgbImage, boxes: impl IntoIterator<Item = &'a BoundingBox>) {
	let bounds = Size::new(image.width(), image.height());
	for bbox in boxes {
		let Some((x, y, width, height)) = clamp_box(bbox, bounds) else {
			continue;
		};
		let thickness = BOX_THICKNESS.min(width).min(height);
		for dy in 0..height {
			for dx in 0..width {
				let edge = dx < thickness || dy < thickness || dx >= width - thickness || dy >= height - thickness;
				if edge {
					image.put_pixel(x + dx, y + dy, BOX_COLOR);
				}
			}
		}
	}
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
	let mut buf = Cursor::new(Vec::new());
	JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
	Ok(buf.into_inner())
}
