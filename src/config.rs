use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{FetchError, Result};
use crate::models::{EndpointAddress, RotationPolicy};
use crate::proxy::selection::SelectionStrategy;
use crate::proxy::transport::{CircuitStickiness, RetryConfig};

/// Application configuration loaded from environment variables
///
/// Loaded once at start and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Local Tor instances
    pub tor: TorConfig,
    /// When circuits are rotated
    pub rotation: RotationPolicy,
    /// Endpoint assignment
    pub pool: PoolConfig,
    /// Task timeouts and retry budget
    pub fetch: FetchConfig,
    /// Pre-flight checks
    pub health: HealthConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct TorConfig {
    /// Host running every instance (default: 127.0.0.1)
    pub host: String,
    /// Run against several instances instead of one
    pub multi_instance: bool,
    /// Instances in multi-instance mode
    pub instance_count: usize,
    /// SOCKS port of the first instance
    pub socks_start_port: u16,
    /// Control port of the first instance
    pub control_start_port: u16,
    /// Control port password
    pub control_password: Option<String>,
    /// Control port cookie file
    pub cookie_path: Option<PathBuf>,
    /// Deadline for one control-channel exchange
    pub control_timeout: Duration,
    /// Consecutive rotation failures before an endpoint is dead
    pub dead_after: u32,
    /// Pause after a new identity while the circuit is built
    pub settle_delay: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Load-balancing policy (round_robin, random, least_connections)
    pub selection_strategy: SelectionStrategy,
    /// Endpoint choice for retries of one task
    pub stickiness: CircuitStickiness,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Hard timeout of a search task
    pub search_timeout: Duration,
    /// Hard timeout of a scrape task
    pub scrape_timeout: Duration,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Deadline of one attempt; unset splits the task timeout evenly
    /// across its attempts
    pub attempt_timeout: Option<Duration>,
    /// Default attempt budget per task
    pub max_attempts: u32,
    /// Backoff between attempts
    pub retry: RetryConfig,
    /// Worker pool size for scraping
    pub scrape_workers: usize,
    /// Scraped text is truncated to this many characters
    pub scrape_max_chars: usize,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// `host:port` reached through each SOCKS port; `None` checks the TCP port only
    pub probe_target: Option<(String, u16)>,
    /// Timeout of each probe
    pub timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_target: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            multi_instance: false,
            instance_count: 3,
            socks_start_port: 9050,
            control_start_port: 9051,
            control_password: None,
            cookie_path: None,
            control_timeout: Duration::from_secs(10),
            dead_after: 3,
            settle_delay: Duration::from_secs(2),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            search_timeout: Duration::from_secs(20),
            scrape_timeout: Duration::from_secs(45),
            connect_timeout: Duration::from_secs(10),
            attempt_timeout: None,
            max_attempts: 3,
            retry: RetryConfig::default(),
            scrape_workers: 5,
            scrape_max_chars: 1200,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            tor: TorConfig {
                host: get_env_or("TOR_HOST", "127.0.0.1"),
                multi_instance: parse_bool("TOR_MULTI_INSTANCE", "false")?,
                instance_count: parse_env("TOR_INSTANCE_COUNT", "3")?,
                socks_start_port: parse_env("TOR_INSTANCE_START_PORT", "9050")?,
                control_start_port: parse_env("TOR_CONTROL_PORT", "9051")?,
                control_password: get_env_opt("TOR_CONTROL_PASSWORD"),
                cookie_path: get_env_opt("TOR_COOKIE_PATH").map(PathBuf::from),
                control_timeout: Duration::from_secs(parse_env("CONTROL_TIMEOUT", "10")?),
                dead_after: parse_env("TOR_DEAD_AFTER", "3")?,
                settle_delay: Duration::from_millis(parse_env("TOR_ROTATE_SETTLE_MS", "2000")?),
            },
            rotation: RotationPolicy {
                interval: parse_env("TOR_ROTATE_INTERVAL", "5")?,
                rotate_on_error: parse_bool("TOR_ROTATE_ON_ERROR", "true")?,
            },
            pool: PoolConfig {
                selection_strategy: {
                    let raw = get_env_or("POOL_SELECTION_STRATEGY", "round_robin");
                    SelectionStrategy::from_str(&raw).ok_or_else(|| {
                        FetchError::InvalidConfig(format!(
                            "POOL_SELECTION_STRATEGY has unsupported value: {}",
                            raw
                        ))
                    })?
                },
                stickiness: {
                    let raw = get_env_or("CIRCUIT_STICKINESS", "sticky");
                    CircuitStickiness::from_str(&raw).ok_or_else(|| {
                        FetchError::InvalidConfig(format!(
                            "CIRCUIT_STICKINESS must be sticky or reacquire, got: {}",
                            raw
                        ))
                    })?
                },
            },
            fetch: FetchConfig {
                search_timeout: Duration::from_secs(parse_env("SEARCH_TIMEOUT", "20")?),
                scrape_timeout: Duration::from_secs(parse_env("SCRAPE_TIMEOUT", "45")?),
                connect_timeout: Duration::from_secs(parse_env("CONNECT_TIMEOUT", "10")?),
                attempt_timeout: get_env_opt("ATTEMPT_TIMEOUT")
                    .map(|_| parse_env("ATTEMPT_TIMEOUT", "0").map(Duration::from_secs))
                    .transpose()?,
                max_attempts: parse_env("FETCH_MAX_ATTEMPTS", "3")?,
                retry: RetryConfig {
                    base: Duration::from_millis(parse_env("BACKOFF_BASE_MS", "500")?),
                    cap: Duration::from_millis(parse_env("BACKOFF_CAP_MS", "8000")?),
                },
                scrape_workers: parse_env("SCRAPE_WORKERS", "5")?,
                scrape_max_chars: parse_env("SCRAPE_MAX_CHARS", "1200")?,
            },
            health: HealthConfig {
                probe_target: parse_probe_target(&get_env_or(
                    "HEALTH_PROBE_TARGET",
                    "check.torproject.org:80",
                ))?,
                timeout: Duration::from_secs(parse_env("HEALTH_TIMEOUT", "10")?),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot produce a working pool
    pub fn validate(&self) -> Result<()> {
        if self.tor.multi_instance && self.tor.instance_count == 0 {
            return Err(FetchError::InvalidConfig(
                "TOR_INSTANCE_COUNT must be at least 1".into(),
            ));
        }
        if self.rotation.interval == 0 {
            return Err(FetchError::InvalidConfig(
                "TOR_ROTATE_INTERVAL must be at least 1".into(),
            ));
        }
        if self.tor.dead_after == 0 {
            return Err(FetchError::InvalidConfig(
                "TOR_DEAD_AFTER must be at least 1".into(),
            ));
        }
        if self.fetch.max_attempts == 0 {
            return Err(FetchError::InvalidConfig(
                "FETCH_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.fetch.attempt_timeout == Some(Duration::ZERO) {
            return Err(FetchError::InvalidConfig(
                "ATTEMPT_TIMEOUT must be at least 1".into(),
            ));
        }
        if self.fetch.retry.base > self.fetch.retry.cap {
            return Err(FetchError::InvalidConfig(
                "BACKOFF_BASE_MS must not exceed BACKOFF_CAP_MS".into(),
            ));
        }
        if self.fetch.scrape_workers == 0 {
            return Err(FetchError::InvalidConfig(
                "SCRAPE_WORKERS must be at least 1".into(),
            ));
        }

        self.tor.port_layout().map(|_| ())
    }
}

impl TorConfig {
    pub fn instances(&self) -> usize {
        if self.multi_instance {
            self.instance_count
        } else {
            1
        }
    }

    /// `(socks, control)` port pairs, interleaved in steps of two
    fn port_layout(&self) -> Result<Vec<(u16, u16)>> {
        let mut seen = HashSet::new();
        let mut layout = Vec::with_capacity(self.instances());

        for i in 0..self.instances() {
            let step = u16::try_from(i * 2).ok();
            let socks = step.and_then(|s| self.socks_start_port.checked_add(s));
            let control = step.and_then(|s| self.control_start_port.checked_add(s));

            let (Some(socks), Some(control)) = (socks, control) else {
                return Err(FetchError::InvalidConfig(format!(
                    "instance {} has a port beyond 65535",
                    i
                )));
            };

            for port in [socks, control] {
                if !seen.insert(port) {
                    return Err(FetchError::InvalidConfig(format!(
                        "port {} is used twice by the instance layout",
                        port
                    )));
                }
            }
            layout.push((socks, control));
        }

        Ok(layout)
    }

    /// Addresses of every configured instance
    pub fn endpoints(&self) -> Vec<EndpointAddress> {
        self.port_layout()
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(id, (socks, control))| EndpointAddress::new(id, &self.host, socks, control))
            .collect()
    }
}

fn parse_probe_target(raw: &str) -> Result<Option<(String, u16)>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    // Use URL parsing to properly handle bracketed IPv6 like "[::1]:80".
    let url = url::Url::parse(&format!("http://{}", raw)).map_err(|e| {
        FetchError::InvalidConfig(format!("HEALTH_PROBE_TARGET '{}' is invalid: {}", raw, e))
    })?;

    let host = url.host_str().ok_or_else(|| {
        FetchError::InvalidConfig(format!("HEALTH_PROBE_TARGET '{}' has no host", raw))
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    Ok(Some((host.to_string(), url.port().unwrap_or(80))))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| FetchError::InvalidConfig(format!("{} must be a valid number", key)))
}

fn parse_bool(key: &str, default: &str) -> Result<bool> {
    match get_env_or(key, default).trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(FetchError::InvalidConfig(format!(
            "{} must be true or false, got: {}",
            key, other
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Get a non-empty environment variable
fn get_env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "TOR_HOST",
        "TOR_MULTI_INSTANCE",
        "TOR_INSTANCE_COUNT",
        "TOR_INSTANCE_START_PORT",
        "TOR_CONTROL_PORT",
        "TOR_CONTROL_PASSWORD",
        "TOR_COOKIE_PATH",
        "TOR_ROTATE_INTERVAL",
        "TOR_ROTATE_ON_ERROR",
        "TOR_DEAD_AFTER",
        "TOR_ROTATE_SETTLE_MS",
        "POOL_SELECTION_STRATEGY",
        "CIRCUIT_STICKINESS",
        "SEARCH_TIMEOUT",
        "SCRAPE_TIMEOUT",
        "CONNECT_TIMEOUT",
        "ATTEMPT_TIMEOUT",
        "CONTROL_TIMEOUT",
        "FETCH_MAX_ATTEMPTS",
        "BACKOFF_BASE_MS",
        "BACKOFF_CAP_MS",
        "SCRAPE_WORKERS",
        "SCRAPE_MAX_CHARS",
        "HEALTH_PROBE_TARGET",
        "HEALTH_TIMEOUT",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.tor.host, "127.0.0.1");
        assert!(!config.tor.multi_instance);
        assert_eq!(config.tor.instances(), 1);
        assert!(config.tor.control_password.is_none());
        assert_eq!(config.rotation, RotationPolicy::default());
        assert_eq!(config.pool.selection_strategy, SelectionStrategy::RoundRobin);
        assert_eq!(config.pool.stickiness, CircuitStickiness::Sticky);
        assert_eq!(config.fetch.search_timeout, Duration::from_secs(20));
        assert_eq!(config.fetch.scrape_timeout, Duration::from_secs(45));
        assert_eq!(config.fetch.attempt_timeout, None);
        assert_eq!(config.fetch.retry.base, Duration::from_millis(500));
        assert_eq!(config.fetch.scrape_max_chars, 1200);
        assert_eq!(
            config.health.probe_target,
            Some(("check.torproject.org".to_string(), 80))
        );
        assert_eq!(config.log.format, "pretty");

        let endpoints = config.tor.endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].socks_address, "127.0.0.1:9050");
        assert_eq!(endpoints[0].control_address, "127.0.0.1:9051");
    }

    #[test]
    fn test_config_multi_instance_layout() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("TOR_MULTI_INSTANCE", "true");
        env::set_var("TOR_INSTANCE_COUNT", "3");
        env::set_var("TOR_CONTROL_PASSWORD", "hunter2");
        env::set_var("POOL_SELECTION_STRATEGY", "least_connections");
        env::set_var("CIRCUIT_STICKINESS", "reacquire");
        env::set_var("ATTEMPT_TIMEOUT", "12");

        let config = Config::from_env().unwrap();
        assert_eq!(config.fetch.attempt_timeout, Some(Duration::from_secs(12)));

        let endpoints = config.tor.endpoints();
        let ports: Vec<(&str, &str)> = endpoints
            .iter()
            .map(|e| (e.socks_address.as_str(), e.control_address.as_str()))
            .collect();
        assert_eq!(
            ports,
            vec![
                ("127.0.0.1:9050", "127.0.0.1:9051"),
                ("127.0.0.1:9052", "127.0.0.1:9053"),
                ("127.0.0.1:9054", "127.0.0.1:9055"),
            ]
        );
        assert_eq!(config.tor.control_password.as_deref(), Some("hunter2"));
        assert_eq!(
            config.pool.selection_strategy,
            SelectionStrategy::LeastConnections
        );
        assert_eq!(config.pool.stickiness, CircuitStickiness::Reacquire);
    }

    #[test]
    fn test_config_rejects_colliding_ports() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("TOR_MULTI_INSTANCE", "true");
        env::set_var("TOR_INSTANCE_COUNT", "2");
        env::set_var("TOR_INSTANCE_START_PORT", "9050");
        env::set_var("TOR_CONTROL_PORT", "9052");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, FetchError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_invalid_values() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        for (key, value) in [
            ("TOR_INSTANCE_START_PORT", "not-a-port"),
            ("TOR_ROTATE_INTERVAL", "0"),
            ("TOR_ROTATE_ON_ERROR", "maybe"),
            ("POOL_SELECTION_STRATEGY", "time_based"),
            ("BACKOFF_BASE_MS", "10000"),
            ("ATTEMPT_TIMEOUT", "0"),
            ("ATTEMPT_TIMEOUT", "soon"),
        ] {
            env::set_var(key, value);
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, FetchError::InvalidConfig(_)), "{}", key);
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tor.endpoints().len(), 1);
        assert_eq!(config.health.probe_target, None);
    }

    #[test]
    fn test_probe_target_parsing() {
        assert_eq!(parse_probe_target("").unwrap(), None);
        assert_eq!(
            parse_probe_target("[::1]:8080").unwrap(),
            Some(("::1".to_string(), 8080))
        );
        assert_eq!(
            parse_probe_target("example.com").unwrap(),
            Some(("example.com".to_string(), 80))
        );
    }
}
