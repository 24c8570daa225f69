use trap::config::Configuration;
use trap::sessions::{SessionId, SessionStorage, summarize};

/// Prints every cached session with its detection count, oldest first.
pub async fn sessions(config: &Configuration) -> anyhow::Result<()> {
	let storage = SessionStorage::new(&config.sessions_path);
	if !storage.root().exists() {
		return Ok(());
	}
	for line in format_summary(&summarize(&storage).await?) {
		println!("{line}");
	}
	Ok(())
}

pub fn format_summary(summary: &[(SessionId, usize)]) -> Vec<String> {
	summary.iter().map(|(session, detections)| format!("{session}\t{detections}")).collect()
}
