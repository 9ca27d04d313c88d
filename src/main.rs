use std::sync::Arc;

use popstream::broker::Broker;
use popstream::cluster::{self, InProcessCluster};
use popstream::config::{Settings, StoreKind, load_config};
use popstream::persistence::{MemoryStore, SledStore, Store};
use popstream::transport::LocalTransport;
use popstream::transport::websocket::start_websocket_server;
use popstream::utils::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    logging::init(&config.logging.level);

    if let Err(e) = run_server(config).await {
        error!("Server failed: {}", e);
    }
}

async fn run_server(config: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let limits = config.broker.store_limits();
    let store: Arc<dyn Store> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new(limits)),
        StoreKind::Sled => Arc::new(SledStore::open(
            &config.store.path,
            limits,
            config.store.fsync,
        )?),
    };
    info!(store = store.name(), "store opened");

    let transport = Arc::new(LocalTransport::new());
    let broker = if config.cluster.enabled {
        let broker =
            Broker::new_clustered(config.delivery.clone(), store, transport.clone())?;
        let log = InProcessCluster::new();
        cluster::join(&log, &broker, &config.cluster)?;
        log.set_leader(&config.cluster.node_id)?;
        info!(node = %config.cluster.node_id, "replication enabled");
        broker
    } else {
        Broker::new(config.delivery.clone(), store, transport.clone())?
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tokio::select! {
        res = start_websocket_server(&addr, broker.clone(), transport, config.broker.max_connections) => {
            if let Err(e) = res {
                error!("WebSocket server exited: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.shutdown().await;
    Ok(())
}
