use std::{
    error::Error,
    fmt,
    path::{Path, PathBuf},
};

use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::cli::Cli;

/// Settings for the conntrack consumer itself.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConntrackConf {
    /// Path to the network namespace to consume events from, e.g.
    /// `/proc/1/ns/net` for the root namespace. When unset the consumer
    /// stays in the namespace it was started in.
    pub netns_path: Option<PathBuf>,

    /// Kernel receive buffer size requested for the netlink socket.
    /// Larger buffers absorb bigger bursts before the kernel reports an
    /// overrun and the consumer starts throttling.
    /// - Default: 1 MiB
    #[serde(default = "defaults::receive_buffer_size")]
    pub receive_buffer_size: usize,

    /// Ceiling on messages processed per second. Sustained throughput
    /// above it re-creates the socket with a lower sampling rate.
    /// - Default: 1000
    #[serde(default = "defaults::max_messages_per_second")]
    pub max_messages_per_second: u64,

    /// Capacity of each event output channel. When full, the worker
    /// blocks and stops draining the kernel socket (backpressure).
    /// - Default: 100
    #[serde(default = "defaults::output_channel_capacity")]
    pub output_channel_capacity: usize,

    /// Dump the existing conntrack table once at startup, before
    /// streaming new-connection events.
    /// - Default: true
    #[serde(default = "defaults::dump_on_start")]
    pub dump_on_start: bool,
}

impl Default for ConntrackConf {
    fn default() -> Self {
        Self {
            netns_path: None,
            receive_buffer_size: defaults::receive_buffer_size(),
            max_messages_per_second: defaults::max_messages_per_second(),
            output_channel_capacity: defaults::output_channel_capacity(),
            dump_on_start: defaults::dump_on_start(),
        }
    }
}

/// Application configuration, merged from defaults, an optional YAML file
/// and the CLI (in that order of precedence, last wins).
#[derive(Debug, Deserialize, Serialize)]
pub struct Conf {
    /// Where the configuration was loaded from. Managed internally, never
    /// read from the file itself.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// The logging level for the application.
    #[serde(with = "conf_serde::level")]
    pub log_level: Level,

    #[serde(default)]
    pub conntrack: ConntrackConf,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            config_path: None,
            log_level: Level::INFO,
            conntrack: ConntrackConf::default(),
        }
    }
}

impl Conf {
    /// Build the configuration from the parsed CLI: start from defaults,
    /// layer the YAML file when one is given, then layer the CLI values
    /// on top. The `--netns` flag maps into `conntrack.netns_path`.
    pub fn new(cli: Cli) -> Result<(Self, Cli), ConfError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path_to_store = if let Some(config_path) = &cli.config {
            validate_config_path(config_path)?;
            figment = figment.merge(Yaml::file(config_path));
            Some(config_path.clone())
        } else {
            None
        };

        figment = figment.merge(Serialized::defaults(&cli));

        let mut conf: Conf = figment.extract()?;
        conf.config_path = config_path_to_store;
        if let Some(netns) = &cli.netns {
            conf.conntrack.netns_path = Some(netns.clone());
        }

        Ok((conf, cli))
    }
}

/// Validates that the given path points to an existing file with a
/// supported extension.
fn validate_config_path(path: &Path) -> Result<(), ConfError> {
    if !path.is_file() {
        if path.exists() {
            return Err(ConfError::InvalidConfigPath(
                path.to_string_lossy().into_owned(),
            ));
        }
        return Err(ConfError::NoConfigFile);
    }

    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        Some(ext) => Err(ConfError::InvalidExtension(ext.to_string())),
        None => Err(ConfError::InvalidExtension("none".to_string())),
    }
}

#[derive(Debug)]
pub enum ConfError {
    /// The specified configuration file does not exist.
    NoConfigFile,
    /// The path exists but is not a file (e.g., it's a directory).
    InvalidConfigPath(String),
    /// The file has an unsupported extension.
    InvalidExtension(String),
    /// Failed to extract configuration data.
    Extraction(Box<figment::Error>),
}

impl fmt::Display for ConfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfError::NoConfigFile => write!(f, "no config file provided"),
            ConfError::InvalidConfigPath(p) => write!(f, "path '{p}' is not a valid file"),
            ConfError::InvalidExtension(ext) => {
                write!(f, "invalid file extension '.{ext}', expected 'yaml' or 'yml'")
            }
            ConfError::Extraction(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl Error for ConfError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfError::Extraction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<figment::Error> for ConfError {
    fn from(e: figment::Error) -> Self {
        ConfError::Extraction(Box::from(e))
    }
}

pub mod conf_serde {
    pub mod level {
        use serde::{self, Deserialize, Deserializer, Serializer};
        use tracing::Level;

        pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(level.as_str())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse::<Level>().map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser as _;
    use figment::Jail;
    use tracing::Level;

    use super::{Conf, ConfError};
    use crate::runtime::cli::Cli;

    #[test]
    fn defaults_without_config_file() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["ctmon"]);
            let (conf, _cli) = Conf::new(cli).expect("default config must load");

            assert_eq!(conf.log_level, Level::INFO);
            assert_eq!(conf.conntrack.netns_path, None);
            assert_eq!(conf.conntrack.receive_buffer_size, 1024 * 1024);
            assert_eq!(conf.conntrack.max_messages_per_second, 1000);
            assert_eq!(conf.conntrack.output_channel_capacity, 100);
            assert!(conf.conntrack.dump_on_start);

            Ok(())
        });
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "ctmon.yaml",
                concat!(
                    "log_level: info\n",
                    "conntrack:\n",
                    "  netns_path: /proc/1/ns/net\n",
                    "  max_messages_per_second: 500\n",
                    "  dump_on_start: false\n",
                ),
            )?;

            let cli = Cli::parse_from(["ctmon", "--config", "ctmon.yaml"]);
            let (conf, _cli) = Conf::new(cli).expect("yaml config must load");

            assert_eq!(
                conf.conntrack.netns_path.as_deref(),
                Some(std::path::Path::new("/proc/1/ns/net"))
            );
            assert_eq!(conf.conntrack.max_messages_per_second, 500);
            assert!(!conf.conntrack.dump_on_start);
            // Untouched fields keep their defaults.
            assert_eq!(conf.conntrack.output_channel_capacity, 100);

            Ok(())
        });
    }

    #[test]
    fn cli_netns_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "ctmon.yaml",
                concat!(
                    "log_level: info\n",
                    "conntrack:\n",
                    "  netns_path: /proc/1/ns/net\n",
                ),
            )?;

            let cli = Cli::parse_from([
                "ctmon",
                "--config",
                "ctmon.yaml",
                "--netns",
                "/var/run/netns/blue",
            ]);
            let (conf, _cli) = Conf::new(cli).expect("config must load");

            assert_eq!(
                conf.conntrack.netns_path.as_deref(),
                Some(std::path::Path::new("/var/run/netns/blue"))
            );

            Ok(())
        });
    }

    #[test]
    fn missing_config_file_is_an_error() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["ctmon", "--config", "absent.yaml"]);
            assert!(matches!(Conf::new(cli), Err(ConfError::NoConfigFile)));

            Ok(())
        });
    }

    #[test]
    fn unsupported_extension_is_an_error() {
        Jail::expect_with(|jail| {
            jail.create_file("ctmon.toml", "log_level = 'info'")?;

            let cli = Cli::parse_from(["ctmon", "--config", "ctmon.toml"]);
            assert!(matches!(
                Conf::new(cli),
                Err(ConfError::InvalidExtension(ext)) if ext == "toml"
            ));

            Ok(())
        });
    }
}

mod defaults {
    pub fn receive_buffer_size() -> usize {
        1024 * 1024
    }

    pub fn max_messages_per_second() -> u64 {
        1000
    }

    pub fn output_channel_capacity() -> usize {
        100
    }

    pub fn dump_on_start() -> bool {
        true
    }
}
