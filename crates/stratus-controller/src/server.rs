use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::ControllerConfig;
use crate::coordinator::Coordinator;
use crate::datastore::{DataStore, JsonPersistence, MemoryPersistence, Persistence};
use crate::extip::PoolManager;
use crate::ledger::QuotaLedger;
use crate::netalloc::NetworkAllocator;
use crate::stats::UsageCollector;
use crate::transport::{TcpBus, Transport, dispatch_loop};

/// Run the controller: restore state, connect the bus, pump events until
/// ctrl-c, then cancel pending CNCI timers.
pub async fn serve(config: ControllerConfig) -> Result<()> {
    let persistence: Arc<dyn Persistence> = if config.controller.datastore_path.is_empty() {
        Arc::new(MemoryPersistence)
    } else {
        Arc::new(JsonPersistence::new(&config.controller.datastore_path))
    };
    let store = Arc::new(DataStore::new(persistence));
    store
        .restore()
        .await
        .with_context(|| "Failed to restore datastore snapshot")?;

    let (bus, inbound) = TcpBus::connect(&config.controller.bus_address)
        .await
        .with_context(|| "Failed to connect to the message bus")?;

    let coordinator = Coordinator::new(
        store,
        Arc::new(QuotaLedger::new()),
        Arc::new(NetworkAllocator::new()),
        Arc::new(PoolManager::new()),
        Arc::new(UsageCollector::new()),
        Arc::new(Transport::new(bus)),
        &config,
    );

    let pump = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            dispatch_loop(coordinator, inbound).await;
        })
    };

    info!("Controller running");
    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for ctrl-c")?;

    info!("Shutdown signal received");
    coordinator.shutdown().await;
    pump.abort();
    Ok(())
}
