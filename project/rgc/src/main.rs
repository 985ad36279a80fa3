use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;
use rgc::api::MemoryStore;
use rgc::cli::{Cli, Commands};
use rgc::controllers::GarbageCollector;
use rgc::protocol::config::{Config, load_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::init();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config)?;
            handle_start_command(cfg).await?;
        }
        Commands::Gen { sub } => sub.handle()?,
    }

    Ok(())
}

async fn handle_start_command(cfg: Config) -> anyhow::Result<()> {
    let store = Arc::new(init_store(&cfg).await?);
    let events = store.subscribe().await;

    let gc = Arc::new(GarbageCollector::new(store, &cfg.gc));
    let token = gc.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "rgc::main", "received Ctrl-C, shutting down");
        }
        token.cancel();
    });

    info!(
        target: "rgc::main",
        "garbage collector started with {} worker(s)",
        cfg.gc.workers
    );
    gc.run(events).await
}

async fn init_store(cfg: &Config) -> anyhow::Result<MemoryStore> {
    match &cfg.seed {
        Some(path) => {
            let store = MemoryStore::from_manifest(path)
                .await
                .with_context(|| format!("Failed to seed store from {}", path.display()))?;
            info!(
                target: "rgc::main",
                "seeded store with {} object(s)",
                store.list().await.len()
            );
            Ok(store)
        }
        None => Ok(MemoryStore::new()),
    }
}
