use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use prometheus_client::registry::Registry;
use tagwatch::config::Configuration;
use tagwatch::scheduler::{Scheduler, Shutdown};
use tagwatch::store::Store;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Opt {
    #[clap(short, long, value_parser)]
    pub config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let options = Opt::parse();
    let config = Configuration::load(Configuration::figment(options.config))?;

    if let Some(parent) = config.db.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("unable to create store directory {parent:?}"))?;
    }
    let store = Store::open(&config.db.path)?;
    store.migrate()?;
    let store = Arc::new(store);
    info!(path = ?config.db.path, manifests = store.len(), "store opened");

    let mut registry = Registry::with_prefix("tagwatch");
    let scheduler = Scheduler::new(&config, store.clone(), &mut registry)?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<Shutdown>(1);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(err) => error!("unable to listen for shutdown signal: {err}"),
        }
        // also shut down if the signal handler itself failed
        let _ = shutdown_tx.send(Shutdown);
    });

    scheduler.run(shutdown_rx).await?;

    store.close()?;
    Ok(())
}
