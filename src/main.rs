use std::fs::File;

use anyhow::{Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use ecfand::{application::Application, cli::Cli, config::ConfigManager};
use log::LevelFilter;
use syslog::{BasicLogger, Facility, Formatter3164};

const DAEMON_LOG: &str = "/var/tmp/ecfand.log";

fn init_log(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "ecfand".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|_| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn into_daemon() -> Result<()> {
    File::create(DAEMON_LOG)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_log(cli.log_level)?;
    if cli.daemonize {
        into_daemon()?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config_manager = ConfigManager::load(cli.config).await?;

    Application::builder()
        .with_config_manager(config_manager)
        .with_read_only(cli.read_only)
        .with_driver(cli.driver)
        .build()
        .await?
        .run()
        .await
}
