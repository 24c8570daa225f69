//! Startup configuration.
//!
//! Loaded once from a JSON file before any task starts. Every key is optional;
//! a missing file means "all defaults". A file that exists but cannot be read
//! or parsed is a fatal startup error.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::camera::Size;
use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_FILE: &str = "configuration/config.json";

/// Which camera capability to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
	#[default]
	Synthetic,
}

/// Which detection capability to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
	#[default]
	None,
}

impl FromStr for CameraKind {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"synthetic" => Ok(Self::Synthetic),
			other => Err(Error::Config(format!("unknown camera '{other}' (expected: synthetic)"))),
		}
	}
}

impl fmt::Display for CameraKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Synthetic => f.write_str("synthetic"),
		}
	}
}

impl FromStr for DetectorKind {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		match s {
			"none" => Ok(Self::None),
			other => Err(Error::Config(format!("unknown detector '{other}' (expected: none)"))),
		}
	}
}

impl fmt::Display for DetectorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::None => f.write_str("none"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
	/// Device name; seeds the default trap name.
	pub node_name: String,
	pub camera: CameraKind,
	pub detector: DetectorKind,
	/// Directory holding `settings.db`.
	pub settings_path: PathBuf,
	/// Root of the session directories.
	pub sessions_path: PathBuf,
	pub listen_address: String,
	pub websocket_port: u16,
	/// Preview frames buffered between the capture loop and the link.
	pub preview_queue_depth: usize,
	/// Full-resolution stream, used for best-shot crops.
	pub main_size: Size,
	/// Low-resolution stream fed to the detector and the preview.
	pub lores_size: Size,
	pub jpeg_quality: u8,
	/// Start with detection enabled instead of waiting for the client.
	pub detect_on_start: bool,
}

impl Default for Configuration {
	fn default() -> Self {
		Self {
			node_name: default_node_name(),
			camera: CameraKind::default(),
			detector: DetectorKind::default(),
			settings_path: PathBuf::from("./configuration"),
			sessions_path: PathBuf::from("./sessions"),
			listen_address: "0.0.0.0".to_string(),
			websocket_port: 8096,
			preview_queue_depth: 2,
			main_size: Size::new(2028, 1520),
			lores_size: Size::new(320, 320),
			jpeg_quality: 85,
			detect_on_start: false,
		}
	}
}

impl Configuration {
	/// Loads `path`, falling back to defaults when the file does not exist.
	pub fn load(path: &Path) -> Result<Self> {
		let content = match std::fs::read_to_string(path) {
			Ok(content) => content,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
			Err(err) => return Err(Error::Config(format!("cannot read {}: {err}", path.display()))),
		};
		let config: Self = serde_json::from_str(&content).map_err(|err| Error::Config(format!("invalid {}: {err}", path.display())))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		for (name, size) in [("main_size", self.main_size), ("lores_size", self.lores_size)] {
			if size.width == 0 || size.height == 0 {
				return Err(Error::Config(format!("{name} must be non-empty")));
			}
		}
		if !(1..=100).contains(&self.jpeg_quality) {
			return Err(Error::Config("jpeg_quality must be between 1 and 100".to_string()));
		}
		Ok(())
	}

	pub fn listen_addr(&self) -> String {
		format!("{}:{}", self.listen_address, self.websocket_port)
	}
}

fn default_node_name() -> String {
	std::env::var("HOSTNAME")
		.ok()
		.or_else(|| std::fs::read_to_string("/etc/hostname").ok())
		.map(|name| name.trim().to_uppercase())
		.filter(|name| !name.is_empty())
		.unwrap_or_else(|| "TRAP".to_string())
}
