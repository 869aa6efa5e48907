use std::sync::Arc;

use reconnect::{
    broker::{Broker, LocalBroker, RelayBroker},
    config::{BrokerKind, Config},
    db, AppState, ShutdownSignal,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,reconnect=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);
    let db_pool = db::connect(&config.database_url, config.db_max_connections).await?;
    tracing::info!(database = %config.database_url, "database ready");

    let (shutdown_tx, shutdown) = ShutdownSignal::channel();

    let broker: Arc<dyn Broker> = match config.broker {
        BrokerKind::Local => Arc::new(LocalBroker::new()),
        BrokerKind::Relay => {
            let relay = Arc::new(RelayBroker::new(db_pool.clone()).await?);
            relay.spawn_pump(config.relay_poll_interval, config.relay_retention, shutdown.clone());
            tracing::info!(node = %relay.node_id(), "relaying room events through the database");
            relay
        }
    };

    let state = AppState {
        db_pool: db_pool.clone(),
        broker,
        config: config.clone(),
        shutdown,
    };
    let app = reconnect::app(state)?;

    let addr = config.server_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    db_pool.close().await;
    Ok(())
}
