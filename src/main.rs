use anyhow::Result;
use clap::Parser;
use quayside::{
    cli::{Cli, Commands},
    config::RegistryConfig,
    serve,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            host,
            port,
            disable_delete,
            auto_mount_discovery,
            no_referrer_filtering,
        } => {
            let mut config = RegistryConfig::from_env();
            if disable_delete {
                config.enable_delete = false;
            }
            if auto_mount_discovery {
                config.auto_mount_discovery = true;
            }
            if no_referrer_filtering {
                config.filter_referrers = false;
            }
            serve::run_server(config, host, port).await
        }
    }
}
