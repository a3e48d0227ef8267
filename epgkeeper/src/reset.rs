use std::sync::Arc;

use epgkeeper_core::database::SqliteDatabase;
use epgkeeper_core::epg::EpgContainer;
use epgkeeper_core::jobs::JobQueue;
use epgkeeper_core::provider::Providers;
use epgkeeper_core::*;

#[derive(clap::Args)]
pub struct CommandLine {
    /// Delete persisted data without confirmation.
    #[arg(short, long)]
    force: bool,
}

pub async fn main(config: Arc<config::Config>, cl: &CommandLine) {
    if config.database.path.is_none() {
        tracing::warn!("No database file specified, nothing to reset");
        return;
    }
    if !cl.force {
        tracing::warn!("Specify --force to delete all persisted data");
        return;
    }

    let jobs = Arc::new(JobQueue::new());
    let database = Arc::new(SqliteDatabase::new(config.database.path.clone()));
    let container = EpgContainer::new(config, database, Providers::default(), jobs.clone());
    match container.reset().await {
        Ok(()) => tracing::info!("Reset done"),
        Err(err) => tracing::error!(%err, "Failed to reset"),
    }
    jobs.stop().await;
}
