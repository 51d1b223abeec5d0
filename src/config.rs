use crate::error::{Result, SpmError};
use crate::models::{ConnectionInfo, ConnectionOverride, SocksAuth};
use crate::proxy::transport::ListenerConfig;
use crate::registry::{RegistryOptions, DEFAULT_KEY_PREFIX};
use crate::services::SupervisorConfig;
use std::env;
use std::time::Duration;
use url::Url;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Resolved tunnel connections, in configuration order
    pub connections: Vec<ConnectionInfo>,
    /// SOCKS listener configuration
    pub listener: ListenerConfig,
    /// Registry configuration
    pub registry: RegistryConfig,
    /// Reconnect and refresh timing
    pub supervisor: SupervisorTiming,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registry location (redis:// or memory://)
    pub url: String,
    /// Prefix for every registry key
    pub prefix: String,
    /// Listener record TTL
    pub listener_ttl: Duration,
    /// Score increment for a penalized connection, in milliseconds
    pub penalty_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SupervisorTiming {
    /// Listener record refresh period (default: 9s)
    pub refresh_interval: Duration,
    /// First reopen delay (default: 15s)
    pub reconnect_delay: Duration,
    /// Reopen delay cap (default: 300s)
    pub max_reconnect_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let registry = RegistryConfig {
            url: parse_registry_url()?,
            prefix: get_env_or("SPM_KEY_PREFIX", DEFAULT_KEY_PREFIX),
            listener_ttl: Duration::from_secs(parse_number("SPM_LISTENER_TTL", "10")?),
            penalty_ms: parse_number("SPM_PENALTY_MS", "600000")?,
        };
        if registry.prefix.is_empty() {
            return Err(SpmError::InvalidConfig(
                "SPM_KEY_PREFIX must not be empty".into(),
            ));
        }
        if registry.listener_ttl.is_zero() {
            return Err(SpmError::InvalidConfig(
                "SPM_LISTENER_TTL must be at least 1 second".into(),
            ));
        }

        let supervisor = SupervisorTiming {
            refresh_interval: Duration::from_secs(parse_number("SPM_REFRESH_INTERVAL", "9")?),
            reconnect_delay: Duration::from_secs(parse_number("SPM_RECONNECT_DELAY", "15")?),
            max_reconnect_delay: Duration::from_secs(parse_number(
                "SPM_MAX_RECONNECT_DELAY",
                "300",
            )?),
        };
        if supervisor.refresh_interval.is_zero()
            || supervisor.refresh_interval >= registry.listener_ttl
        {
            return Err(SpmError::InvalidConfig(
                "SPM_REFRESH_INTERVAL must be non-zero and less than SPM_LISTENER_TTL".into(),
            ));
        }
        if supervisor.reconnect_delay.is_zero() {
            return Err(SpmError::InvalidConfig(
                "SPM_RECONNECT_DELAY must be at least 1 second".into(),
            ));
        }
        if supervisor.max_reconnect_delay < supervisor.reconnect_delay {
            return Err(SpmError::InvalidConfig(
                "SPM_MAX_RECONNECT_DELAY must not be less than SPM_RECONNECT_DELAY".into(),
            ));
        }

        let connections = parse_connections()?;

        let listen_port = match env::var("SPM_LISTEN_PORT") {
            Ok(raw) if !raw.trim().is_empty() => Some(raw.trim().parse::<u16>().map_err(|_| {
                SpmError::InvalidConfig("SPM_LISTEN_PORT must be a valid port number".into())
            })?),
            _ => None,
        };
        if listen_port.is_some() && connections.len() > 1 {
            return Err(SpmError::InvalidConfig(format!(
                "SPM_LISTEN_PORT can only be used with one connection, got {}",
                connections.len()
            )));
        }

        Ok(Config {
            connections,
            listener: ListenerConfig {
                host: get_env_or("SPM_LISTEN_HOST", "127.0.0.1"),
                port: listen_port,
                auth: parse_socks_auth()?,
            },
            registry,
            supervisor,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "json"),
            },
        })
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            prefix: self.registry.prefix.clone(),
            listener_ttl: self.registry.listener_ttl,
            penalty_ms: self.registry.penalty_ms,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            listener: self.listener.clone(),
            reconnect_delay: self.supervisor.reconnect_delay,
            max_reconnect_delay: self.supervisor.max_reconnect_delay,
            refresh_interval: self.supervisor.refresh_interval,
        }
    }
}

fn parse_connections() -> Result<Vec<ConnectionInfo>> {
    let raw = env::var("SPM_CONNECTIONS")
        .map_err(|_| SpmError::MissingEnvVar("SPM_CONNECTIONS".into()))?;
    let entries: Vec<ConnectionOverride> = serde_json::from_str(&raw).map_err(|e| {
        SpmError::InvalidConfig(format!("SPM_CONNECTIONS must be a JSON array of connections: {}", e))
    })?;
    if entries.is_empty() {
        return Err(SpmError::InvalidConfig(
            "SPM_CONNECTIONS must name at least one connection".into(),
        ));
    }

    let defaults_raw = get_env_or("SPM_CONNECTION_DEFAULTS", "{}");
    let defaults: ConnectionOverride = serde_json::from_str(&defaults_raw).map_err(|e| {
        SpmError::InvalidConfig(format!("SPM_CONNECTION_DEFAULTS must be a JSON object: {}", e))
    })?;

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let config = defaults.layer(entry).resolve().map_err(|e| match e {
                SpmError::InvalidConfig(reason) => {
                    SpmError::InvalidConfig(format!("SPM_CONNECTIONS[{}]: {}", index, reason))
                }
                other => other,
            })?;
            ConnectionInfo::new(config)
        })
        .collect()
}

fn parse_socks_auth() -> Result<Option<SocksAuth>> {
    let username = env::var("SPM_SOCKS_USERNAME").unwrap_or_default();
    let password = env::var("SPM_SOCKS_PASSWORD").unwrap_or_default();

    match (username.is_empty(), password.is_empty()) {
        (true, true) => Ok(None),
        (false, false) => {
            // RFC 1929 length fields are a single byte
            if username.len() > 255 || password.len() > 255 {
                return Err(SpmError::InvalidConfig(
                    "SPM_SOCKS_USERNAME and SPM_SOCKS_PASSWORD must be at most 255 bytes".into(),
                ));
            }
            Ok(Some(SocksAuth { username, password }))
        }
        _ => Err(SpmError::InvalidConfig(
            "SPM_SOCKS_USERNAME and SPM_SOCKS_PASSWORD must be set together".into(),
        )),
    }
}

fn parse_registry_url() -> Result<String> {
    let raw = get_env_or("REDIS_URL", "redis://127.0.0.1:6379");
    let raw = raw.trim();

    let url = Url::parse(raw)
        .map_err(|e| SpmError::InvalidConfig(format!("REDIS_URL must be a valid URL: {}", e)))?;

    match url.scheme() {
        "redis" => {
            if url.host_str().is_none() {
                return Err(SpmError::InvalidConfig("REDIS_URL must include a host".into()));
            }
        }
        "memory" => {}
        other => {
            return Err(SpmError::InvalidConfig(format!(
                "REDIS_URL has unsupported scheme: {}",
                other
            )))
        }
    }

    Ok(raw.to_string())
}

fn parse_number<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| SpmError::InvalidConfig(format!("{} must be a valid number", key)))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SshAuth;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "SPM_CONNECTIONS",
        "SPM_CONNECTION_DEFAULTS",
        "SPM_LISTEN_HOST",
        "SPM_LISTEN_PORT",
        "SPM_SOCKS_USERNAME",
        "SPM_SOCKS_PASSWORD",
        "REDIS_URL",
        "SPM_KEY_PREFIX",
        "SPM_LISTENER_TTL",
        "SPM_REFRESH_INTERVAL",
        "SPM_PENALTY_MS",
        "SPM_RECONNECT_DELAY",
        "SPM_MAX_RECONNECT_DELAY",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    const ONE_CONNECTION: &str =
        r#"[{"host": "jump-1.example", "username": "tunnel", "password": "secret"}]"#;

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
        env::set_var("SPM_CONNECTIONS", ONE_CONNECTION);

        let config = Config::from_env().unwrap();

        assert_eq!(config.connections.len(), 1);
        let connection = &config.connections[0].config;
        assert_eq!(connection.host, "jump-1.example");
        assert_eq!(connection.port, 22);
        assert_eq!(connection.timeout_secs, 10);

        assert_eq!(config.listener.host, "127.0.0.1");
        assert_eq!(config.listener.port, None);
        assert!(config.listener.auth.is_none());

        assert_eq!(config.registry.url, "redis://127.0.0.1:6379");
        assert_eq!(config.registry.prefix, "spm");
        assert_eq!(config.registry.listener_ttl, Duration::from_secs(10));
        assert_eq!(config.registry.penalty_ms, 600_000);

        assert_eq!(config.supervisor.refresh_interval, Duration::from_secs(9));
        assert_eq!(config.supervisor.reconnect_delay, Duration::from_secs(15));
        assert_eq!(config.supervisor.max_reconnect_delay, Duration::from_secs(300));

        assert_eq!(config.log.level, "info");
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var(
            "SPM_CONNECTIONS",
            r#"[
                {"host": "jump-1.example"},
                {"host": "jump-2.example", "port": 2222, "private_key_path": "/keys/id_ed25519"}
            ]"#,
        );
        env::set_var(
            "SPM_CONNECTION_DEFAULTS",
            r#"{"username": "tunnel", "password": "secret", "timeout_secs": 5}"#,
        );
        env::set_var("SPM_LISTEN_HOST", "0.0.0.0");
        env::set_var("SPM_SOCKS_USERNAME", "scraper");
        env::set_var("SPM_SOCKS_PASSWORD", "hunter2");
        env::set_var("REDIS_URL", "memory://");
        env::set_var("SPM_KEY_PREFIX", "pool-eu");
        env::set_var("SPM_LISTENER_TTL", "30");
        env::set_var("SPM_REFRESH_INTERVAL", "20");
        env::set_var("SPM_PENALTY_MS", "60000");
        env::set_var("LOG_FORMAT", "pretty");

        let config = Config::from_env().unwrap();

        assert_eq!(config.connections.len(), 2);
        let first = &config.connections[0].config;
        assert_eq!(first.username, "tunnel");
        assert_eq!(first.timeout_secs, 5);
        assert!(matches!(first.auth, SshAuth::Password { .. }));

        let second = &config.connections[1].config;
        assert_eq!(second.port, 2222);
        assert!(matches!(second.auth, SshAuth::KeyFile { .. }));

        assert_eq!(config.listener.host, "0.0.0.0");
        assert_eq!(
            config.listener.auth,
            Some(SocksAuth {
                username: "scraper".into(),
                password: "hunter2".into(),
            })
        );

        let options = config.registry_options();
        assert_eq!(options.prefix, "pool-eu");
        assert_eq!(options.listener_ttl, Duration::from_secs(30));
        assert_eq!(options.penalty_ms, 60_000);
        assert_eq!(config.registry.url, "memory://");

        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.refresh_interval, Duration::from_secs(20));
        assert_eq!(supervisor.listener, config.listener);
        assert_eq!(config.log.format, "pretty");
    }

    #[test]
    fn test_config_requires_connections() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, SpmError::MissingEnvVar(ref key) if key == "SPM_CONNECTIONS"));

        env::set_var("SPM_CONNECTIONS", "[]");
        assert!(matches!(
            Config::from_env(),
            Err(SpmError::InvalidConfig(_))
        ));

        env::set_var("SPM_CONNECTIONS", "{not json");
        assert!(matches!(
            Config::from_env(),
            Err(SpmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_incomplete_connection() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
        env::set_var(
            "SPM_CONNECTIONS",
            r#"[{"host": "jump-1.example", "username": "tunnel"}]"#,
        );

        match Config::from_env() {
            Err(SpmError::InvalidConfig(reason)) => {
                assert!(reason.starts_with("SPM_CONNECTIONS[0]"), "{}", reason)
            }
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_config_rejects_refresh_not_below_ttl() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
        env::set_var("SPM_CONNECTIONS", ONE_CONNECTION);
        env::set_var("SPM_LISTENER_TTL", "10");
        env::set_var("SPM_REFRESH_INTERVAL", "10");

        assert!(matches!(
            Config::from_env(),
            Err(SpmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_zero_reconnect_delay() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
        env::set_var("SPM_CONNECTIONS", ONE_CONNECTION);
        env::set_var("SPM_RECONNECT_DELAY", "0");

        assert!(matches!(
            Config::from_env(),
            Err(SpmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_half_socks_auth() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
        env::set_var("SPM_CONNECTIONS", ONE_CONNECTION);
        env::set_var("SPM_SOCKS_USERNAME", "scraper");

        assert!(matches!(
            Config::from_env(),
            Err(SpmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_unsupported_registry_scheme() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
        env::set_var("SPM_CONNECTIONS", ONE_CONNECTION);
        env::set_var("REDIS_URL", "http://127.0.0.1:6379");

        assert!(matches!(
            Config::from_env(),
            Err(SpmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_invalid_listen_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
        env::set_var("SPM_CONNECTIONS", ONE_CONNECTION);
        env::set_var("SPM_LISTEN_PORT", "70000");

        assert!(matches!(
            Config::from_env(),
            Err(SpmError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_listen_port_requires_single_connection() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);
        env::set_var("SPM_LISTEN_PORT", "1080");

        env::set_var("SPM_CONNECTIONS", ONE_CONNECTION);
        let config = Config::from_env().unwrap();
        assert_eq!(config.listener.port, Some(1080));

        env::set_var(
            "SPM_CONNECTIONS",
            r#"[
                {"host": "jump-1.example", "username": "tunnel", "password": "secret"},
                {"host": "jump-2.example", "username": "tunnel", "password": "secret"}
            ]"#,
        );
        match Config::from_env() {
            Err(SpmError::InvalidConfig(reason)) => {
                assert!(reason.contains("SPM_LISTEN_PORT"), "{}", reason)
            }
            other => panic!("expected invalid config, got {:?}", other),
        }
    }
}
