use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use facrelay::chat::{ChatHandle, ChatSocket, ConnectionState};
use facrelay::commands::CommandRouter;
use facrelay::config::Config;
use facrelay::discord::{PurgeScheduler, RestClient, Webhook};
use facrelay::relay::banker::BankerQueue;
use facrelay::relay::dedup::DedupCache;
use facrelay::relay::dispatch::{CommandDispatch, Dispatcher, Outbound};
use facrelay::relay::queue::{DeliveryQueue, spawn_drain};
use facrelay::relay::stats::RelayStats;
use facrelay::server::{self, AppState};
use facrelay::shutdown::TaskRegistry;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "facrelay", version, about)]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, default_value = "facrelay.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).await?;
    info!(config = %args.config, room = %config.chat.room_id, "Starting facrelay");

    let registry = TaskRegistry::new();
    let token = registry.token();

    let stats = Arc::new(RelayStats::new());
    let dedup = Arc::new(Mutex::new(
        DedupCache::load(&config.relay.snapshot_path, config.relay.dedup_capacity).await,
    ));
    let webhook = Arc::new(Webhook::from_config(&config));
    let queue = Arc::new(DeliveryQueue::new(
        dedup.clone(),
        stats.clone(),
        config.relay.log_duplicates,
    ));

    let (inbound_tx, mut inbound_rx) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let (terminal_tx, mut terminal_rx) = mpsc::channel(1);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

    let chat = ChatHandle::new(
        outbound_tx,
        config.chat.room_id.clone(),
        config.relay.chat_prefix(),
    );

    let router: Option<Arc<dyn CommandDispatch>> = if config.relay.allow_chat_interaction {
        let banker = config.discord.banker.enabled.then(|| {
            Arc::new(BankerQueue::new(
                config.discord.banker.cooldown(),
                registry.child_token(),
            ))
        });
        Some(Arc::new(CommandRouter::new(
            chat.clone(),
            webhook.clone(),
            banker,
            config.discord.banker.mention.clone(),
            stats.clone(),
            queue.clone(),
            config.commands.admins.clone(),
            token.clone(),
        )))
    } else {
        None
    };

    let dispatcher = Arc::new(Dispatcher::new(
        router,
        webhook.clone() as Arc<dyn Outbound>,
        config.relay.archive,
        config.relay.chat_prefix(),
        stats.clone(),
    ));

    // Connection task.
    let socket = ChatSocket::new(
        &config,
        inbound_tx,
        outbound_rx,
        state_tx,
        stats.clone(),
        token.clone(),
        terminal_tx,
    );
    registry
        .register("chat-socket", tokio::spawn(socket.run()))
        .await;

    // Ingest pump: socket channel into the delivery queue.
    {
        let queue = queue.clone();
        let token = token.clone();
        registry
            .register(
                "ingest",
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = inbound_rx.recv() => {
                                match msg {
                                    Some(msg) => { queue.ingest(msg).await; }
                                    None => break,
                                }
                            }
                            _ = token.cancelled() => break,
                        }
                    }
                }),
            )
            .await;
    }

    registry
        .register(
            "queue-drain",
            spawn_drain(
                queue.clone(),
                dispatcher.clone(),
                config.relay.queue_delay(),
                token.clone(),
            ),
        )
        .await;

    // Connect notice, re-announced on each reconnect transition.
    {
        let webhook = webhook.clone();
        let mut state_rx = state_rx.clone();
        let token = token.clone();
        registry
            .register(
                "connect-notice",
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            changed = state_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                                if *state_rx.borrow_and_update() == ConnectionState::Open {
                                    webhook.notice_connected().await;
                                }
                            }
                            _ = token.cancelled() => break,
                        }
                    }
                }),
            )
            .await;
    }

    // Channel purge, if the bot-token REST surface is configured.
    if config.discord.purge.interval_hours > 0
        && !config.discord.bot_token.is_empty()
        && !config.discord.channel_id.is_empty()
    {
        let api = Arc::new(RestClient::new(config.discord.bot_token.clone()));
        let scheduler = Arc::new(PurgeScheduler::new(
            api,
            config.discord.channel_id.clone(),
            config.discord.purge.clone(),
        ));
        registry
            .register("purge", scheduler.spawn(token.clone()))
            .await;
    } else {
        info!("Channel purge disabled");
    }

    if config.server.enabled {
        let state = AppState {
            stats: stats.clone(),
            connection: state_rx,
            queue: queue.clone(),
            dispatcher: dispatcher.clone(),
        };
        let server_config = config.server.clone();
        let token = token.clone();
        registry
            .register(
                "debug-listener",
                tokio::spawn(async move {
                    if let Err(e) = server::serve(&server_config, state, token).await {
                        error!(error = %e, "Debug listener failed");
                    }
                }),
            )
            .await;
    }

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = signal::ctrl_c() => info!("Interrupt received, shutting down"),
        _ = sigterm.recv() => info!("Termination signal received, shutting down"),
        signal = terminal_rx.recv() => match signal {
            Some(()) => error!("Chat socket is gone and the retry budget is exhausted, shutting down"),
            None => info!("Chat socket task ended, shutting down"),
        },
        _ = token.cancelled() => info!("Shutdown requested from chat"),
    }

    webhook.notice_disconnected().await;
    if let Err(e) = dedup.lock().await.save(&config.relay.snapshot_path).await {
        warn!(error = %e, "Failed to write dedup snapshot");
    }

    // A second interrupt skips the grace period.
    tokio::select! {
        _ = registry.shutdown(SHUTDOWN_GRACE) => info!("Shutdown complete"),
        _ = signal::ctrl_c() => warn!("Second interrupt, exiting immediately"),
    }

    Ok(())
}
