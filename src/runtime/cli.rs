use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::conf::conf_serde::level as serde_level;

#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(name = "ctmon", version, about, long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g., "ctmon.yaml").
    #[arg(short, long, value_name = "FILE", env = "CTMON_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Consume conntrack events from this network namespace
    /// (e.g., "/proc/1/ns/net"). Defaults to the current namespace.
    #[arg(short, long, value_name = "PATH", env = "CTMON_NETNS_PATH")]
    #[serde(skip)]
    pub netns: Option<PathBuf>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        env = "CTMON_LOG_LEVEL",
        default_value = "info"
    )]
    #[serde(with = "serde_level")]
    pub log_level: Level,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser as _;
    use figment::Jail;
    use tracing::Level;

    use super::Cli;

    #[test]
    fn parses_long_flags() {
        Jail::expect_with(|_| {
            let args = [
                "ctmon",
                "--config",
                "/path/to/conf.yaml",
                "--netns",
                "/proc/1/ns/net",
                "--log-level",
                "warn",
            ];
            let cli = Cli::parse_from(args);
            assert_eq!(cli.config, Some(PathBuf::from("/path/to/conf.yaml")));
            assert_eq!(cli.netns, Some(PathBuf::from("/proc/1/ns/net")));
            assert_eq!(cli.log_level, Level::WARN);

            Ok(())
        });
    }

    #[test]
    fn parses_from_env_when_no_args() {
        Jail::expect_with(|jail| {
            jail.set_env("CTMON_CONFIG_PATH", "/tmp/ctmon.yaml");
            jail.set_env("CTMON_NETNS_PATH", "/proc/1/ns/net");
            jail.set_env("CTMON_LOG_LEVEL", "debug");

            let cli = Cli::parse_from(["ctmon"]);
            assert_eq!(cli.config, Some(PathBuf::from("/tmp/ctmon.yaml")));
            assert_eq!(cli.netns, Some(PathBuf::from("/proc/1/ns/net")));
            assert_eq!(cli.log_level, Level::DEBUG);

            Ok(())
        });
    }

    #[test]
    fn default_log_level_is_info() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["ctmon"]);
            assert_eq!(cli.log_level, Level::INFO);

            Ok(())
        });
    }

    #[test]
    fn default_netns_is_current() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["ctmon"]);
            assert_eq!(cli.netns, None);

            Ok(())
        });
    }
}
