use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// Fan control daemon for notebooks driven through the embedded controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path (default: $ECFAND_CONFIG, then ~/.config/ecfand/config.yml, then /etc/ecfand/config.yml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Read temperatures and fan registers but never write to the EC
    #[arg(long = "read-only")]
    pub read_only: bool,

    /// Force an EC driver by name (dev_port, ec_sys, acpi_ec)
    #[arg(long = "driver")]
    pub driver: Option<String>,

    /// Maximum level sent to syslog
    #[arg(short = 'l', long = "log-level", default_value = "info")]
    pub log_level: LevelFilter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["ecfand"]);
        assert_eq!(cli.config, None);
        assert!(!cli.daemonize);
        assert!(!cli.read_only);
        assert_eq!(cli.driver, None);
        assert_eq!(cli.log_level, LevelFilter::Info);
    }

    #[test]
    fn all_flags() {
        let cli = Cli::parse_from([
            "ecfand",
            "-c",
            "/tmp/fans.yml",
            "-d",
            "--read-only",
            "--driver",
            "ec_sys",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/fans.yml")));
        assert!(cli.daemonize);
        assert!(cli.read_only);
        assert_eq!(cli.driver.as_deref(), Some("ec_sys"));
        assert_eq!(cli.log_level, LevelFilter::Debug);
    }
}
