mod run;
mod sessions;

pub use run::run;
pub use sessions::{format_summary, sessions};

use crate::cli::{Cli, Commands};

pub async fn dispatch(cli: Cli) -> anyhow::Result<()> {
	let mut config = cli.configuration()?;
	match cli.command() {
		Commands::Run(args) => {
			args.apply(&mut config);
			run(config).await
		}
		Commands::Sessions => sessions(&config).await,
	}
}
