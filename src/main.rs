use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use mbpfand::{
    application::Application,
    cli::Cli,
    config::ConfigManager,
    logging::{init_log, into_daemon},
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.daemonize {
        into_daemon()?;
    }
    init_log(cli.daemonize, cli.log_level())?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    info!("mbpfand {} starting", env!("CARGO_PKG_VERSION"));

    let config_manager = ConfigManager::load(cli.config.clone()).await;

    Application::builder()
        .with_config_manager(config_manager)
        .with_device_paths(cli.device_paths())
        .with_pid_file(&cli.pid_file)
        .build()?
        .run()
        .await
}
