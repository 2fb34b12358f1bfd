use std::sync::Arc;

use exchange_client::{
    api,
    config::{AppConfig, Cli},
    logging, relay,
    state::AppState,
};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let config = match AppConfig::load(Cli::parse_normalized()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    if let Err(e) = logging::init(config.log_file.as_deref()) {
        eprintln!("Error: cannot open log file: {}", e);
        std::process::exit(2);
    }

    tracing::info!(
        "Starting exchange client as {} (broker {})",
        config.profile,
        config.broker.url
    );

    let broker = match config.broker.build_client() {
        Ok(broker) => broker,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(2);
        }
    };

    let names = |destinations: Vec<exchange_client::broker::Destination>| {
        destinations
            .into_iter()
            .map(|d| d.name)
            .collect::<Vec<_>>()
            .join(", ")
    };
    tracing::info!(
        "{} consumes [{}], produces [{}] via {} client",
        config.bindings.client_id,
        names(config.bindings.consumed()),
        names(config.bindings.produced()),
        broker.name()
    );

    if let Err(e) = broker.connect().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }

    let state = Arc::new(AppState::new(broker.clone(), config.bindings.clone()));

    if let Err(e) = relay::start_relays(&state).await {
        tracing::error!("Failed to subscribe to broker destinations: {}", e);
        broker.close().await;
        std::process::exit(1);
    }

    let app = api::router(state);

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Cannot listen on {}: {}", config.bind_addr, e);
            broker.close().await;
            std::process::exit(1);
        }
    };
    tracing::info!("Listening on http://{}", config.bind_addr);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down");
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("Server error: {}", e);
    }

    broker.close().await;
}
