//! Configuration module for the gateway. Handles loading the configuration
//! from file and validating the parts that can fail at startup, so a broken
//! routing table or proxy URL never surfaces mid-delivery.
//!
//! Configuration is read once and is immutable afterwards; changes are
//! applied by restarting the process. The file location is the first program
//! argument when given, else the `CONFIG_FILE` environment variable, else
//! `./config.toml`.
//!
//! # Configuration
//!
//! ```toml
//! [server]
//! listen_address = "0.0.0.0:6543"
//! # auth_token = "…"
//!
//! [logging]
//! level = "info"
//! # directory = "/var/log/alerthub"
//! # file = "alerthub.log"
//! # rotation = "daily"
//!
//! templates_dir = "./templates"
//! proxy = "socks5://127.0.0.1:1080"
//! proxy_enabled = false
//!
//! [channels.chat_default]
//! type = "chat"
//! bot_token = "123456:secret"
//! chat_id = "-1001234"
//! template = "chat_default.tmpl"
//! image_enabled = true
//!
//! [[routing]]
//! match = { _source = "prometheus" }
//! send_to = [ "chat_default" ]
//!
//! [prometheus_image]
//! enabled = true
//! prometheus_url = "http://prometheus:9090"
//!
//! [jenkins_dedup]
//! ttl_seconds = 900
//! ```

use crate::prelude::*;

use crate::channels::Channel;
use crate::dedup::{DedupCache, DedupConfig};
use crate::graph::ImageConfig;
use crate::routing::{Router, Rule, RuleError};

/// Known error types that can be returned when loading configuration
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error - file couldn't be (fully) read for whatever reason.
    Io(std::io::Error),
    /// Parsing error - provided configuration file is not valid TOML
    Parse(toml::de::Error),
    /// A routing rule failed validation.
    Rule(RuleError),
    /// The dedup alertname pattern is not a valid regex.
    Dedup(regex::Error),
    /// A routing rule names a channel that is not configured.
    UnknownChannel {
        #[allow(missing_docs)]
        rule: usize,
        #[allow(missing_docs)]
        channel: String,
    },
}

impl StdError for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e)
    }
}

impl From<RuleError> for ConfigError {
    fn from(e: RuleError) -> Self {
        Self::Rule(e)
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use ConfigError::{Dedup, Io, Parse, Rule, UnknownChannel};
        match self {
            Io(e) => write!(fmt, "IO error: {e}"),
            Parse(e) => write!(fmt, "parsing error: {e}"),
            Rule(e) => write!(fmt, "routing error: {e}"),
            Dedup(e) => write!(fmt, "dedup pattern error: {e}"),
            UnknownChannel { rule, channel } => {
                write!(fmt, "rule {rule} sends to unknown channel {channel:?}")
            }
        }
    }
}

/// HTTP front door settings.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    /// address:port pair for the webhook listener to bind to
    #[serde(default = "listen_address")]
    pub listen_address: String,
    /// When set, `POST /webhook` requires this bearer token.
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn listen_address() -> String {
    "0.0.0.0:6543".s()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: listen_address(),
            auth_token: None,
        }
    }
}

/// Log output settings.
#[derive(Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    /// Default tracing filter directive; `RUST_LOG` overrides it.
    #[serde(default = "log_level")]
    pub level: String,
    /// When set together with `file`, logs rotate in this directory instead
    /// of going to stderr.
    #[serde(default)]
    pub directory: Option<String>,
    /// Log file name prefix.
    #[serde(default)]
    pub file: Option<String>,
    /// One of `daily`, `hourly`, `never`.
    #[serde(default = "rotation")]
    pub rotation: String,
}

fn log_level() -> String {
    "info".s()
}

fn rotation() -> String {
    "daily".s()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: log_level(),
            directory: None,
            file: None,
            rotation: rotation(),
        }
    }
}

fn templates_dir() -> String {
    "./templates".s()
}

/// Object holding the gateway configuration.
#[allow(missing_docs)]
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Flat directory the template names resolve in.
    #[serde(default = "templates_dir")]
    pub templates_dir: String,
    /// Delivery endpoints by channel id.
    #[serde(default)]
    pub channels: HashMap<String, Channel>,
    /// Ordered routing table.
    #[serde(default)]
    pub routing: Vec<Rule>,
    /// Trend-graph settings for alerts originating from prometheus.
    #[serde(default)]
    pub prometheus_image: ImageConfig,
    /// Trend-graph settings for alerts originating from grafana.
    #[serde(default)]
    pub grafana_image: ImageConfig,
    /// Build-system alert suppression window.
    #[serde(default)]
    pub jenkins_dedup: DedupConfig,
    /// Global outbound proxy URL.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub proxy_enabled: bool,
}

impl TryFrom<String> for Config {
    type Error = ConfigError;
    fn try_from(path: String) -> Result<Self, Self::Error> {
        let config_content = fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Creates a new Configuration object using the path provided
    ///
    /// # Errors
    /// Will return error if configuration cannot be read, parsed, or
    /// validated.
    pub fn new(path: String) -> anyhow::Result<Self> {
        Ok(path.try_into()?)
    }

    /// Resolve the configuration file location: argv[1], then the
    /// `CONFIG_FILE` environment variable, then `./config.toml`.
    #[must_use]
    pub fn locate() -> String {
        std::env::args()
            .nth(1)
            .or_else(|| std::env::var("CONFIG_FILE").ok())
            .unwrap_or_else(|| "./config.toml".s())
    }

    /// Everything that can be rejected before serving: rule patterns, the
    /// dedup pattern, and channel references.
    fn validate(&self) -> Result<(), ConfigError> {
        Router::compile(&self.routing)?;
        DedupCache::new(&self.jenkins_dedup).map_err(ConfigError::Dedup)?;

        for (index, rule) in self.routing.iter().enumerate() {
            for id in &rule.send_to {
                if !self.channels.contains_key(id) {
                    return Err(ConfigError::UnknownChannel {
                        rule: index,
                        channel: id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}
