use anyhow::Result;
use clap::Parser;

use logredirect_core::config::RedirectConfig;
use logredirect_daemon::cli::DaemonCli;
use logredirect_daemon::logging;
use logredirect_daemon::orchestrator::Orchestrator;
use logredirect_daemon::provider::validation_report;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DaemonCli::parse();

    // File, then environment, then command line.
    let mut config = RedirectConfig::from_file(&cli.config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to load config: {}", e))?;
    config.apply_env_overrides();
    cli.apply_overrides(&mut config);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("config validation failed: {}", e))?;

    if cli.validate {
        print!("{}", validation_report(&cli.config, &config.snapshot()));
        return Ok(());
    }

    logging::init_tracing(&config.general)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "logredirect starting");

    let orchestrator = Orchestrator::build_from_config(config, &cli.config)?;
    orchestrator.run().await?;

    tracing::info!("logredirect shut down");
    Ok(())
}
