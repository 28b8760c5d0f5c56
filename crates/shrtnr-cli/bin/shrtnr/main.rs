mod cli;
mod commands;

use crate::cli::CLI;
use clap::Parser;
use shrtnr_storage::open_store;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CLI::parse();
    init_tracing(config.json_logs);

    info!(
        storage_backend = %config.storage,
        base_url = %config.base_url,
        "starting shrtnr"
    );

    let store = open_store(config.store_config()?).await?;

    let outcome = commands::run(
        store.as_ref(),
        config.command,
        &config.base_url,
        &mut std::io::stdout(),
    )
    .await;

    // Shut down even after a failed command so queued deletes are flushed.
    if let Err(e) = store.shutdown().await {
        error!(error = %e, "store shutdown failed");
    }

    outcome
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
