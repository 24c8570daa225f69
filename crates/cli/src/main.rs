use clap::Parser;
use trap_cli::{cli::Cli, commands, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	if let Err(err) = commands::dispatch(cli).await {
		let chain = format!("{err:#}");
		error!(target: "trap.app", error = %chain, "command failed");
		std::process::exit(1);
	}
}
