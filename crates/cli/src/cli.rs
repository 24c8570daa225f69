use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use trap::config::{CameraKind, Configuration, DEFAULT_CONFIG_FILE, DetectorKind};

#[derive(Parser, Debug)]
#[command(name = "trap")]
#[command(about = "Camera trap: detect and record subjects, serve sessions to a client")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug, -vvv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Configuration file (JSON); missing means defaults
	#[arg(short, long, global = true, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
	pub config: PathBuf,

	/// Override the sessions directory
	#[arg(long, global = true, value_name = "DIR")]
	pub sessions_path: Option<PathBuf>,

	/// Override the settings directory
	#[arg(long, global = true, value_name = "DIR")]
	pub settings_path: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
	/// Start the device (default)
	Run(RunArgs),

	/// List cached sessions and their detection counts
	#[command(alias = "ls")]
	Sessions,
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct RunArgs {
	/// Websocket port
	#[arg(short, long)]
	pub port: Option<u16>,

	/// Address to listen on
	#[arg(long, value_name = "ADDR")]
	pub listen: Option<String>,

	/// Camera to drive (synthetic)
	#[arg(long)]
	pub camera: Option<CameraKind>,

	/// Detector to run (none)
	#[arg(long)]
	pub detector: Option<DetectorKind>,

	/// Enable detection at startup instead of waiting for the client
	#[arg(long)]
	pub detect: bool,
}

impl Cli {
	pub fn command(&self) -> Commands {
		self.command.clone().unwrap_or_else(|| Commands::Run(RunArgs::default()))
	}

	/// Loads the configuration file and applies the global path overrides.
	pub fn configuration(&self) -> trap::Result<Configuration> {
		let mut config = Configuration::load(&self.config)?;
		if let Some(path) = &self.sessions_path {
			config.sessions_path = path.clone();
		}
		if let Some(path) = &self.settings_path {
			config.settings_path = path.clone();
		}
		Ok(config)
	}
}

impl RunArgs {
	pub fn apply(&self, config: &mut Configuration) {
		if let Some(port) = self.port {
			config.websocket_port = port;
		}
		if let Some(listen) = &self.listen {
			config.listen_address = listen.clone();
		}
		if let Some(camera) = self.camera {
			config.camera = camera;
		}
		if let Some(detector) = self.detector {
			config.detector = detector;
		}
		if self.detect {
			config.detect_on_start = true;
		}
	}
}
