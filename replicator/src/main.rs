//! Replicator binary.
//!
//! Loads the configuration, initializes tracing and runs a consumer that publishes the rows
//! inserted into one table to the configured sink until SIGINT or SIGTERM.

use config::load_config;
use config::shared::{ReplicatorConfig, ReplicatorConfigWithoutSecrets};
use telemetry::init_tracing;
use tracing::{error, info};

use crate::core::start_replicator_with_config;
use crate::error::{ReplicatorError, ReplicatorResult};

mod core;
mod error;

fn main() -> ReplicatorResult<()> {
    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME")).map_err(ReplicatorError::config)?;

    let replicator_config = load_config::<ReplicatorConfig>().map_err(ReplicatorError::config)?;

    match serde_json::to_string(&ReplicatorConfigWithoutSecrets::from(replicator_config.clone())) {
        Ok(config) => info!(%config, "replicator config loaded"),
        Err(err) => error!(error = %err, "failed to serialize replicator config"),
    }

    // Both aws-lc-rs and ring may be compiled in, so the provider has to be picked explicitly.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        info!("a rustls crypto provider was already installed");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))?;

    Ok(())
}

async fn async_main(replicator_config: ReplicatorConfig) -> ReplicatorResult<()> {
    if let Err(err) = start_replicator_with_config(replicator_config).await {
        error!("{err}");

        return Err(err);
    }

    Ok(())
}
