use std::sync::Arc;

use canvas_sync::{
    Coordinator, DurableStore, EphemeralStore, MemoryDatabase, MemoryKv, RocksDatabase, RocksKv,
    StoreConfig, SyncConfig, SyncServer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SyncConfig::from_env()?;

    let (db, kv): (Arc<dyn DurableStore>, Arc<dyn EphemeralStore>) = match &config.server.storage_path {
        Some(path) => {
            let db = RocksDatabase::open(StoreConfig { path: path.join("db"), ..StoreConfig::default() })?;
            let kv = RocksKv::open(StoreConfig { path: path.join("kv"), ..StoreConfig::default() })?;
            log::info!("Using RocksDB storage at {}", path.display());
            (Arc::new(db), Arc::new(kv))
        }
        None => {
            log::warn!("CANVAS_STORAGE_PATH not set, state is kept in memory only");
            (Arc::new(MemoryDatabase::new()), Arc::new(MemoryKv::new()))
        }
    };

    let coordinator = Arc::new(Coordinator::new(config.clone(), db, kv));
    coordinator.start();

    let server = SyncServer::new(config.server.clone(), coordinator.clone());
    let listener = server.bind().await?;
    let serving = tokio::spawn(async move { server.serve(listener).await });

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown signal received");

    let grace = config.server.shutdown_grace;
    match tokio::time::timeout(grace, coordinator.shutdown()).await {
        Ok(report) if !report.is_clean() => {
            log::warn!(
                "Shutdown left {} failed and {} corrupt staged objects",
                report.failed.len(),
                report.corrupt.len()
            );
        }
        Ok(_) => {}
        Err(_) => {
            log::error!("Graceful shutdown exceeded {grace:?}, forcing exit");
            std::process::exit(1);
        }
    }

    match serving.await {
        Ok(Err(e)) => log::error!("Listener failed: {e}"),
        Err(e) => log::error!("Listener task failed: {e}"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
