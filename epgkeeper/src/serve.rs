use std::sync::Arc;

use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use epgkeeper_core::database::SqliteDatabase;
use epgkeeper_core::epg::EpgContainer;
use epgkeeper_core::epg::RegisterEmitter;
use epgkeeper_core::events::*;
use epgkeeper_core::jobs::JobQueue;
use epgkeeper_core::models::EpgChannelData;
use epgkeeper_core::provider::EpgSink;
use epgkeeper_core::provider::ProviderWatcher;
use epgkeeper_core::provider::Providers;
use epgkeeper_core::*;

pub async fn main(config: Arc<config::Config>) {
    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(err), _) | (_, Err(err)) => {
            tracing::error!(%err, "Failed to install signal handlers");
            return;
        }
    };

    let jobs = Arc::new(JobQueue::new());
    let container = start(config.clone(), jobs.clone()).await;
    let token = CancellationToken::new();
    let mut watchers = watch_providers(&config, &container, &token);

    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received");
        }
    }

    tracing::info!("Stopping...");
    token.cancel();
    while watchers.join_next().await.is_some() {}
    container.stop().await;
    jobs.stop().await;
}

async fn start(config: Arc<config::Config>, jobs: Arc<JobQueue>) -> Arc<EpgContainer> {
    let database = Arc::new(SqliteDatabase::new(config.database.path.clone()));
    let providers = Providers::from_config(&config);
    let container = Arc::new(EpgContainer::new(config.clone(), database, providers, jobs));

    container.register_emitter(RegisterEmitter::TablesChanged(Emitter::from_fn(
        |msg: EpgTablesChanged| {
            tracing::info!(tables = ?msg.table_ids, "Tables changed");
        },
    )));
    container.register_emitter(RegisterEmitter::ActiveItemChanged(Emitter::from_fn(
        |msg: EpgActiveItemChanged| {
            tracing::info!(tables = ?msg.table_ids, "Active items changed");
        },
    )));
    container.register_emitter(RegisterEmitter::UpdateProgress(Emitter::from_fn(
        |msg: EpgUpdateProgress| {
            tracing::info!(
                current = msg.current,
                total = msg.total,
                table = %msg.table_name,
                "Updating..."
            );
        },
    )));
    container.register_emitter(RegisterEmitter::UpdateFinished(Emitter::from_fn(
        |msg: EpgUpdateFinished| {
            tracing::info!(interrupted = msg.interrupted, "Update finished");
        },
    )));
    container.register_emitter(RegisterEmitter::PersistFailed(Emitter::from_fn(
        |msg: EpgPersistFailed| {
            tracing::error!(epg.id = %msg.table_id, reason = %msg.reason, "Failed to persist");
        },
    )));

    container.start(false).await;

    for provider in config.providers.iter().filter(|config| !config.disabled) {
        for channel in provider.channels.iter() {
            let epg_id = channel.epg_id.unwrap_or(-1).into();
            let data = EpgChannelData::new(provider.client_id, channel.uid, &channel.name);
            let table = container
                .create_channel_epg(epg_id, &provider.name, Some(data))
                .await;
            tracing::info!(epg.id = %table.id(), channel = %channel.name, "Ready");
        }
    }

    container
}

// Providers push changes through their watch commands.
fn watch_providers(
    config: &config::Config,
    container: &Arc<EpgContainer>,
    token: &CancellationToken,
) -> JoinSet<()> {
    let mut watchers = JoinSet::new();
    for provider in config.providers.iter().filter(|config| !config.disabled) {
        let sink: Arc<dyn EpgSink> = container.clone();
        if let Some(watcher) = ProviderWatcher::new(provider.clone(), sink) {
            watchers.spawn(watcher.run(token.clone()));
        }
    }
    watchers
}
