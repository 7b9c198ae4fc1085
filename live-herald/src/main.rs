use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use live_herald::config::AppConfig;
use live_herald::logging;
use live_herald::monitor::{StreamEventBroadcaster, TwitchPoller};
use live_herald::notifier::{NotifierDeps, StreamNotifier};
use live_herald::store::SqliteStateStore;
use live_herald::transport::{DiscordClient, LogPresenceSink};
use live_herald::utils::http_client::install_rustls_provider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()
        .await
        .context("failed to load configuration")?;

    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;
    install_rustls_provider();

    let store = Arc::new(
        SqliteStateStore::connect(&config.database_url)
            .await
            .context("failed to open state database")?,
    );

    let discord = Arc::new(DiscordClient::new(config.discord.clone()));
    if let Err(e) = discord.connect().await {
        // Discovery retries the connection on every pass.
        warn!(error = %e, "Discord connection not ready yet");
    }

    let broadcaster = StreamEventBroadcaster::new();
    let notifier = Arc::new(StreamNotifier::new(
        config.notifier.clone(),
        config.discord.destination_query(),
        config.mentions.clone(),
        NotifierDeps {
            store: store.clone(),
            transport: discord.clone(),
            directory: discord.clone(),
            roles: discord.clone(),
            presence: Arc::new(LogPresenceSink),
        },
    ));
    notifier.start(broadcaster.subscribe());

    let cancellation_token = CancellationToken::new();
    let log_cleanup = logging_config.start_retention_cleanup(cancellation_token.child_token());
    let poller = Arc::new(TwitchPoller::new(config.twitch.clone(), broadcaster.clone()));
    let poller_task = poller.spawn(cancellation_token.child_token());

    info!(
        channels = config.twitch.channels.len(),
        announce_channel = %config.discord.announce_channel,
        "live-herald started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    cancellation_token.cancel();
    let _ = tokio::join!(poller_task, log_cleanup);
    notifier.stop().await;

    let stats = notifier.stats();
    info!(
        passes = stats.passes,
        created = stats.created,
        edited = stats.edited,
        retired = stats.retired,
        "live-herald stopped"
    );
    store.close().await;

    Ok(())
}
