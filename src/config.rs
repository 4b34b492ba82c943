use crate::error::Error;
use ::config::Config;
use std::time::Duration;

/// Default upper bound for a declared receive frame length.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
/// Default number of readiness events fetched per wait.
pub const DEFAULT_POLL_CAPACITY: usize = 1024;
/// Default bound on how long a connection may stay in the connecting state.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

/// Tunables shared by every selector implementation.
///
/// # Configuration Keys
///
/// - `max_frame_size`: largest accepted receive frame in bytes
/// - `poll_capacity`: readiness events fetched per wait
/// - `connect_timeout_ms`: how long a connection may stay connecting
/// - `tcp_nodelay`: disable Nagle's algorithm on outbound sockets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorSettings {
    pub max_frame_size: usize,
    pub poll_capacity: usize,
    pub connect_timeout: Duration,
    pub tcp_nodelay: bool,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            poll_capacity: DEFAULT_POLL_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tcp_nodelay: true,
        }
    }
}

impl SelectorSettings {
    /// Reads settings from the top level of `config`.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        Self::from_config_named(config, "")
    }

    /// Reads settings with configuration namespacing.
    ///
    /// Lookup order for every key is `{name}.{key}`, then `{key}`, then the
    /// built-in default. A key that is present but has the wrong type is an
    /// error rather than silently falling back.
    pub fn from_config_named(config: &Config, name: &str) -> Result<Self, Error> {
        let defaults = Self::default();

        let max_frame_size = or_default(
            get_namespaced_usize(config, name, "max_frame_size"),
            defaults.max_frame_size,
        )?;
        let poll_capacity = or_default(
            get_namespaced_usize(config, name, "poll_capacity"),
            defaults.poll_capacity,
        )?;
        let connect_timeout = or_default(
            get_namespaced_u64(config, name, "connect_timeout_ms").map(Duration::from_millis),
            defaults.connect_timeout,
        )?;
        let tcp_nodelay = or_default(
            get_namespaced_bool(config, name, "tcp_nodelay"),
            defaults.tcp_nodelay,
        )?;

        Ok(Self {
            max_frame_size,
            poll_capacity: poll_capacity.max(1),
            connect_timeout,
            tcp_nodelay,
        })
    }
}

fn or_default<T>(value: Result<T, config::ConfigError>, default: T) -> Result<T, Error> {
    match value {
        Ok(value) => Ok(value),
        Err(config::ConfigError::NotFound(_)) => Ok(default),
        Err(err) => Err(err.into()),
    }
}
