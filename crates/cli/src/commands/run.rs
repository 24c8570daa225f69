use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trap::app::{TrapApp, bind_server};
use trap::config::Configuration;

/// Runs the device until Ctrl-C.
pub async fn run(config: Configuration) -> anyhow::Result<()> {
	let server = bind_server(&config).await.with_context(|| format!("cannot listen on {}", config.listen_addr()))?;
	let app = TrapApp::from_config(config).await.context("startup failed")?;

	let shutdown = CancellationToken::new();
	{
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			match tokio::signal::ctrl_c().await {
				Ok(()) => info!(target: "trap.app", "interrupt received; shutting down"),
				Err(err) => warn!(target: "trap.app", error = %err, "cannot listen for interrupt; shutting down"),
			}
			shutdown.cancel();
		});
	}

	app.run(Some(server), shutdown).await?;
	Ok(())
}
