//! Daemon configuration.
//!
//! The configuration file is RON, found through `ATTEST_CONFIG`, then
//! `./attest.config.ron`, then `/etc/attest/attest.config.ron`.

use std::{fmt, net::IpAddr, path::PathBuf, str::FromStr};

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::ConfigError;

/// A listener address: `inet:PORT@HOST` or `unix:PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ConnectionSpec {
    Inet { port: u16, host: String },
    Unix { path: PathBuf },
}

impl FromStr for ConnectionSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidConnection {
            spec: s.to_string(),
            reason: reason.to_string(),
        };

        if let Some(rest) = s.strip_prefix("inet:") {
            let (port, host) = rest
                .split_once('@')
                .ok_or_else(|| invalid("expected inet:PORT@HOST"))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| invalid("port is not a number"))?;
            if host.is_empty() {
                return Err(invalid("host is empty"));
            }
            Ok(Self::Inet {
                port,
                host: host.to_string(),
            })
        } else if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(invalid("path is empty"));
            }
            Ok(Self::Unix {
                path: PathBuf::from(path),
            })
        } else {
            Err(invalid("expected an inet: or unix: prefix"))
        }
    }
}

impl TryFrom<String> for ConnectionSpec {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet { port, host } => write!(f, "inet:{port}@{host}"),
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

/// One additional named listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub connection: ConnectionSpec,
    /// Octal mode mask applied while binding a UNIX socket.
    #[serde(default)]
    pub umask: Option<u32>,
}

/// Which protocol engine drives the data listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrontendProtocol {
    #[default]
    Milter,
    Smtp,
}

/// Worker pool sizing, directly following the prefork knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_min_children")]
    pub min_children: usize,
    #[serde(default = "default_max_children")]
    pub max_children: usize,
    #[serde(default = "default_min_spare_children")]
    pub min_spare_children: usize,
    #[serde(default = "default_max_spare_children")]
    pub max_spare_children: usize,
    #[serde(default = "default_max_requests_per_child")]
    pub max_requests_per_child: u64,
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: u32,
}

const fn default_min_children() -> usize {
    20
}

const fn default_max_children() -> usize {
    100
}

const fn default_min_spare_children() -> usize {
    10
}

const fn default_max_spare_children() -> usize {
    20
}

const fn default_max_requests_per_child() -> u64 {
    200
}

const fn default_listen_backlog() -> u32 {
    20
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_children: default_min_children(),
            max_children: default_max_children(),
            min_spare_children: default_min_spare_children(),
            max_spare_children: default_max_spare_children(),
            max_requests_per_child: default_max_requests_per_child(),
            listen_backlog: default_listen_backlog(),
        }
    }
}

/// Session deadlines. Exceeding the per-query DNS deadline converts a
/// handler's outcome to temperror; exceeding the command or message
/// deadline ends the session.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_command_secs")]
    pub command_secs: u64,
    #[serde(default = "default_message_secs")]
    pub message_secs: u64,
    #[serde(default = "default_dns_secs")]
    pub dns_secs: u64,
}

const fn default_command_secs() -> u64 {
    300
}

const fn default_message_secs() -> u64 {
    600
}

const fn default_dns_secs() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: default_command_secs(),
            message_secs: default_message_secs(),
            dns_secs: default_dns_secs(),
        }
    }
}

/// DKIM handler options. `check_dkim = 1` emits a `dkim=none` fragment
/// for unsigned mail, `check_dkim = 2` stays silent about it.
#[derive(Debug, Clone, Deserialize)]
pub struct DkimOptions {
    #[serde(default = "default_check_dkim")]
    pub check_dkim: u8,
}

const fn default_check_dkim() -> u8 {
    1
}

impl Default for DkimOptions {
    fn default() -> Self {
        Self {
            check_dkim: default_check_dkim(),
        }
    }
}

/// Per-handler option subtrees. Every handler has a section with
/// defaults so an empty config activates sensible behavior.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandlerOptions {
    #[serde(default)]
    pub dkim: DkimOptions,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Hostname used as the server-id of the assembled
    /// `Authentication-Results` header and in SMTP banners.
    pub hostname: String,

    /// Ordered list of handler names to activate. Unknown names are
    /// fatal at worker startup.
    #[serde(default = "default_load_handlers")]
    pub load_handlers: Vec<String>,

    /// Primary data listener. Required.
    pub connection: ConnectionSpec,

    /// Additional named listeners.
    #[serde(default)]
    pub connections: Vec<ListenerConfig>,

    /// Metrics sideband listener.
    #[serde(default)]
    pub metric_connection: Option<ConnectionSpec>,

    /// Deprecated aliases for `metric_connection`.
    #[serde(default)]
    pub metric_port: Option<u16>,
    #[serde(default)]
    pub metric_host: Option<String>,

    #[serde(default)]
    pub protocol: FrontendProtocol,

    /// SMTP front-end relay target, `host:port`. Required when
    /// `protocol` is `smtp`.
    #[serde(default)]
    pub upstream: Option<String>,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub handlers: HandlerOptions,

    /// Clients inside these networks are the machine's own.
    #[serde(default)]
    pub local_networks: Vec<IpNet>,

    /// Clients inside these networks are operator-trusted relays.
    #[serde(default)]
    pub trusted_networks: Vec<IpNet>,

    #[serde(default)]
    pub error_log: Option<PathBuf>,

    #[serde(default)]
    pub runas: Option<String>,
    #[serde(default)]
    pub rungroup: Option<String>,
    #[serde(default)]
    pub chroot: Option<PathBuf>,

    #[serde(default)]
    pub debug: bool,
}

fn default_load_handlers() -> Vec<String> {
    [
        "trusted-ip",
        "iprev",
        "ptr",
        "spf",
        "dkim",
        "adsp",
        "dmarc",
        "arc",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Config {
    /// Locate the configuration file: `ATTEST_CONFIG`, then the current
    /// directory, then the system-wide path.
    pub fn find_file() -> Result<PathBuf, ConfigError> {
        if let Ok(env_path) = std::env::var("ATTEST_CONFIG") {
            let path = PathBuf::from(env_path);
            if path.exists() {
                return Ok(path);
            }
            return Err(ConfigError::NotFound);
        }

        ["./attest.config.ron", "/etc/attest/attest.config.ron"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or(ConfigError::NotFound)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self =
            ron::from_str(&contents).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The effective metrics listener, folding in the deprecated
    /// `metric_port`/`metric_host` aliases.
    #[must_use]
    pub fn metric_connection(&self) -> Option<ConnectionSpec> {
        if let Some(spec) = &self.metric_connection {
            return Some(spec.clone());
        }

        self.metric_port.map(|port| {
            tracing::warn!("metric_port/metric_host are deprecated; use metric_connection");
            ConnectionSpec::Inet {
                port,
                host: self
                    .metric_host
                    .clone()
                    .unwrap_or_else(|| "localhost".to_string()),
            }
        })
    }

    /// All data listener specs, primary first.
    #[must_use]
    pub fn data_connections(&self) -> Vec<ListenerConfig> {
        let mut listeners = vec![ListenerConfig {
            connection: self.connection.clone(),
            umask: None,
        }];
        listeners.extend(self.connections.iter().cloned());
        listeners
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.is_empty() {
            return Err(ConfigError::MissingField("hostname"));
        }

        if let Some(metric) = self.metric_connection() {
            if self
                .data_connections()
                .iter()
                .any(|listener| listener.connection == metric)
            {
                return Err(ConfigError::MetricPortCollision(metric.to_string()));
            }
        }

        if self.protocol == FrontendProtocol::Smtp && self.upstream.is_none() {
            return Err(ConfigError::MissingField("upstream"));
        }

        let workers = &self.workers;
        if workers.min_children == 0 || workers.max_children < workers.min_children {
            return Err(ConfigError::Invalid {
                field: "workers".to_string(),
                reason: "need 0 < min_children <= max_children".to_string(),
            });
        }

        Ok(())
    }

    /// Whether `ip` falls inside the configured local networks.
    #[must_use]
    pub fn is_local(&self, ip: IpAddr) -> bool {
        self.local_networks.iter().any(|net| net.contains(&ip))
    }

    /// Whether `ip` falls inside the configured trusted networks.
    #[must_use]
    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.trusted_networks.iter().any(|net| net.contains(&ip))
    }
}
