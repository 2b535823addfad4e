//! Chunkline loopback entry point.
//!
//! Usage: `chunkline-loopback <file> [config.toml]`

mod app;
mod config;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args_os().skip(1);
    let Some(file) = args.next().map(PathBuf::from) else {
        anyhow::bail!("usage: chunkline-loopback <file> [config.toml]");
    };
    let config_path = args.next().map(PathBuf::from);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting chunkline loopback");

    let config = config::Config::load(config_path.as_deref())?;
    tracing::info!(
        chunk_size = config.transfer.chunk_size,
        loss_rate = config.loss_rate,
        encrypt = config.encrypt,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, &file))?;

    tracing::info!("loopback finished");
    Ok(())
}
