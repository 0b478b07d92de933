//! Coordinator process: config → store → bus → recovery → consumers +
//! reprocessor + health endpoint, with graceful drain on ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use partnerflow_api::{AppState, router};
use partnerflow_events::MessageBus;
use partnerflow_infra::{
    Config, InMemorySagaLogStore, PostgresSagaLogStore, Reprocessor, SagaCoordinator, SagaLogStore,
};

const REPROCESS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    partnerflow_observability::init();
    let config = Config::from_env();

    let store: Arc<dyn SagaLogStore> = match &config.saga_log_dsn {
        Some(dsn) => {
            let pool = sqlx::PgPool::connect(dsn).await?;
            let store = PostgresSagaLogStore::new(pool);
            store.ensure_schema().await?;
            info!("saga log store ready (postgres)");
            Arc::new(store)
        }
        None => {
            warn!("no SAGA_LOG_DSN configured, falling back to the in-memory store");
            Arc::new(InMemorySagaLogStore::new())
        }
    };

    let bus = connect_bus(&config)?;

    let coordinator = Arc::new(SagaCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        config.lease_timeout,
    ));
    let recovered = coordinator.recover().await?;
    info!(recovered, "in-flight saga recovery complete");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = coordinator.spawn_consumers(shutdown_rx.clone()).await?;
    handles.push(
        Reprocessor::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            REPROCESS_INTERVAL,
            config.max_attempts,
        )
        .spawn(shutdown_rx),
    );

    let app = router(AppState {
        bus,
        store,
    });
    let listener = tokio::net::TcpListener::bind(&config.health_addr).await?;
    info!(addr = %config.health_addr, "health endpoint listening");
    let health_server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!(error = %err, "health server exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining consumers");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    health_server.abort();
    info!("coordinator stopped");

    Ok(())
}

#[cfg(feature = "redis")]
fn connect_bus(config: &Config) -> anyhow::Result<Arc<dyn MessageBus>> {
    use partnerflow_infra::bus::RedisStreamsBus;

    let bus = RedisStreamsBus::new(&config.broker_url, None)?;
    info!(broker = %config.broker_url, "message bus ready (redis streams)");
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "redis"))]
fn connect_bus(_config: &Config) -> anyhow::Result<Arc<dyn MessageBus>> {
    warn!("built without the redis feature, using the in-memory bus");
    Ok(Arc::new(partnerflow_events::InMemoryBus::new()))
}
