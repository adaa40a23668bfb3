use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use ticket_dispatch::broker::{Broker, MemoryBroker, RedisBroker};
use ticket_dispatch::bus::MessageBus;
use ticket_dispatch::channels::{
    Channel, ChannelManager, CliChannel, JobNotifier, TelegramChannel,
};
use ticket_dispatch::config::{BrokerKind, DispatcherConfig};
use ticket_dispatch::conversation::ConversationStore;
use ticket_dispatch::handler::{FixHandler, Router};
use ticket_dispatch::intent::{IntentClassifier, IntentEngine, ProjectResolver, RigClassifier};
use ticket_dispatch::listener::BusListener;
use ticket_dispatch::spawner::create_spawner;
use ticket_dispatch::tickets::{GitHubTicketSource, TicketSources};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatcherConfig::from_env().context("invalid configuration")?;

    eprintln!("🎫 ticket-dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Projects: {}", config.project_names().join(", "));

    // ── Broker ──────────────────────────────────────────────────────────
    let broker: Arc<dyn Broker> = match config.broker {
        BrokerKind::Redis => {
            let broker = RedisBroker::connect(&config.redis_url)
                .await
                .context("failed to connect to Redis")?;
            eprintln!("   Broker: redis");
            Arc::new(broker)
        }
        BrokerKind::Memory => {
            eprintln!("   Broker: in-memory (workers cannot connect)");
            Arc::new(MemoryBroker::new())
        }
    };

    let bus = MessageBus::new(Arc::clone(&broker), config.bus.clone());
    let store = ConversationStore::new(
        Arc::clone(&broker),
        config.bus.key_ttl,
        config.bus.clarification_ttl,
    );

    // ── Spawner ─────────────────────────────────────────────────────────
    let spawner = match create_spawner(config.spawner, config.worker.clone()).await {
        Ok(spawner) => {
            eprintln!("   Spawner: {}", spawner.backend());
            Some(spawner)
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker spawner unavailable; fix requests disabled");
            eprintln!("   Spawner: unavailable ({e})");
            None
        }
    };

    // ── Channels ────────────────────────────────────────────────────────
    let mut channels = ChannelManager::new();
    channels.add(Box::new(CliChannel::new()));
    if let Some(telegram) = &config.telegram {
        let channel =
            TelegramChannel::new(telegram.bot_token.clone(), telegram.allowed_users.clone());
        if let Err(e) = channel.health_check().await {
            tracing::warn!(error = %e, "Telegram health check failed");
        }
        channels.add(Box::new(channel));
    }
    eprintln!("   Channels: {}", channels.names().join(", "));
    let channels = Arc::new(channels);

    // ── Listener ────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let notifier: Arc<dyn JobNotifier> = channels.clone();
    let listener = BusListener::new(bus.clone(), store.clone(), notifier, shutdown.clone());
    let sweep_handle = listener.spawn_sweep_task(config.sweep_interval);

    // ── Intent resolution ───────────────────────────────────────────────
    let mut tickets = TicketSources::new();
    match &config.github_token {
        Some(token) => {
            for project in &config.projects {
                tickets.add(Arc::new(GitHubTicketSource::new(project, token.clone())));
            }
        }
        None => eprintln!("   Tickets: GITHUB_TOKEN not set; project lookup disabled"),
    }

    let classifier: Option<Arc<dyn IntentClassifier>> = match &config.classifier {
        Some(classifier_config) => match RigClassifier::new(classifier_config) {
            Ok(classifier) => Some(Arc::new(classifier)),
            Err(e) => {
                tracing::warn!(error = %e, "Classifier unavailable; patterns only");
                None
            }
        },
        None => None,
    };
    eprintln!(
        "   Classifier: {}",
        if classifier.is_some() { "enabled" } else { "disabled" }
    );

    let engine = IntentEngine::new(
        ProjectResolver::new(config.project_names(), tickets.clone()),
        classifier,
    );
    let fix = match spawner {
        Some(spawner) => FixHandler::new(spawner, store.clone(), listener.clone()),
        None => FixHandler::disabled(store.clone(), listener.clone()),
    };
    let router = Router::new(engine, fix, store, bus, tickets);

    // ── Run ─────────────────────────────────────────────────────────────
    let messages = channels
        .start_all()
        .await
        .context("no chat channel could be started")?;
    eprintln!("   Type a message and press Enter. Ctrl-C to exit.\n");

    tokio::select! {
        _ = router.run(messages, channels.clone(), shutdown.clone()) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
            tracing::info!("Shutting down");
        }
    }

    shutdown.cancel();
    listener.shutdown().await;
    let _ = sweep_handle.await;
    channels.shutdown_all().await;

    Ok(())
}
