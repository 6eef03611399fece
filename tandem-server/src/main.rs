//! Tandem sync server binary.
//!
//! Configuration comes from the environment (see `ServerConfig::from_env`).
//! `TANDEM_TOKENS=token=user,...` enables token auth; without it every
//! connection is accepted. Logging follows `RUST_LOG`, default `info`.

use std::sync::Arc;

use tandem_collab::{
    AllowAnonymous, Authenticator, MemoryStore, Persistence, ServerConfig, StaticTokens, SyncServer,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn authenticator() -> Arc<dyn Authenticator> {
    match std::env::var("TANDEM_TOKENS") {
        Ok(spec) if !spec.trim().is_empty() => {
            let tokens = StaticTokens::parse(&spec);
            log::info!("Token auth enabled for {} tokens", tokens.len());
            Arc::new(tokens)
        }
        _ => {
            log::warn!("TANDEM_TOKENS not set, accepting anonymous connections");
            Arc::new(AllowAnonymous)
        }
    }
}

#[cfg(feature = "rocksdb")]
fn persistence(config: &ServerConfig) -> Result<Arc<dyn Persistence>, BoxError> {
    use tandem_collab::{RocksConfig, RocksStore};

    match &config.data_dir {
        Some(dir) => {
            log::info!("Persisting documents to {}", dir.display());
            Ok(Arc::new(RocksStore::open(RocksConfig::new(dir))?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

#[cfg(not(feature = "rocksdb"))]
fn persistence(config: &ServerConfig) -> Result<Arc<dyn Persistence>, BoxError> {
    if config.data_dir.is_some() {
        log::warn!("TANDEM_DATA_DIR ignored: built without the rocksdb feature");
    }
    Ok(Arc::new(MemoryStore::new()))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    let store = persistence(&config)?;
    let server = SyncServer::new(config, authenticator(), store);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutdown requested");
        }
    }
    server.shutdown().await?;
    Ok(())
}
