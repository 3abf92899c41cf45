use autorule_server::{
    config::ServerConfig,
    listeners,
    routes::{AppState, router},
};
use autorule_workflow::nats::{NatsConnection, NatsEventStore, NatsOutbox};
use autorule_workflow::{
    ActionRegistryBuilder, Catalog, Engine, EventStore, InMemoryEventStore, InMemoryOutbox,
    InMemoryRuleStore, Outbox,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,autorule=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    let catalog = Arc::new(Catalog::embedded().expect("failed to load catalog"));

    let nats = match config.nats.clone() {
        Some(nats_config) => Some(
            NatsConnection::connect(nats_config)
                .await
                .expect("failed to connect to NATS"),
        ),
        None => {
            tracing::warn!("NATS not configured; run journals and outbound messages stay in memory");
            None
        }
    };

    let (events, outbox): (Arc<dyn EventStore>, Arc<dyn Outbox>) = match &nats {
        Some(connection) => (
            Arc::new(NatsEventStore::new(connection.clone())),
            Arc::new(NatsOutbox::new(connection.clone())),
        ),
        None => (
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryOutbox::new()),
        ),
    };

    let registry = Arc::new(
        ActionRegistryBuilder::with_builtins(outbox)
            .build(&catalog)
            .expect("failed to build action registry"),
    );

    let rules = Arc::new(InMemoryRuleStore::new(catalog.clone(), registry.clone()));
    if let Some(path) = &config.rules_path {
        let json = std::fs::read_to_string(path).expect("failed to read rules file");
        let count = rules
            .load_json(&json)
            .await
            .expect("failed to load rules");
        tracing::info!(count, %path, "Loaded rules");
    }

    let engine = Engine::new(catalog, registry, rules, events, config.engine);

    if let Some(connection) = nats {
        tokio::spawn(listeners::completion_listener(
            connection.client.clone(),
            connection.config.completion_subject.clone(),
            engine.clone(),
        ));
        tokio::spawn(listeners::event_listener(
            connection.client.clone(),
            connection.config.events_subject.clone(),
            engine.clone(),
        ));
    }

    let app = router(AppState::new(engine));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}
