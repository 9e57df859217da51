//! Configuration management

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::ChannelConfig;
use crate::manager::ManagerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// What a listener's sessions are allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    /// Originates PROXY/GETPROXIES, never a destination
    Client,
    /// Destination only
    Server,
    #[default]
    Either,
}

impl SessionType {
    pub fn may_originate(self) -> bool {
        !matches!(self, SessionType::Server)
    }

    pub fn is_discoverable(self) -> bool {
        !matches!(self, SessionType::Client)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Client => "client",
            SessionType::Server => "server",
            SessionType::Either => "either",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(SessionType::Client),
            "server" => Ok(SessionType::Server),
            "either" => Ok(SessionType::Either),
            other => Err(ConfigError::Invalid(format!("Unknown session type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
    #[serde(default)]
    pub session_type: SessionType,
}

impl FromStr for ListenerConfig {
    type Err = ConfigError;

    /// `ADDR` or `ADDR/TYPE`, e.g. `0.0.0.0:10001/server`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, session_type) = match s.split_once('/') {
            Some((addr, kind)) => (addr, kind.parse()?),
            None => (s, SessionType::default()),
        };
        let addr = addr
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("Invalid listen address {}: {}", addr, e)))?;
        Ok(Self { addr, session_type })
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listeners: Vec<ListenerConfig>,
    pub worker_threads: usize,
    pub login_timeout_secs: u64,
    /// UDP receive buffer per channel end
    pub channel_mtu: usize,
    /// Idle expiry per channel end, 0 disables
    pub port_expired_secs: u64,
    /// Channel stats log interval, 0 disables
    pub display_interval_secs: u64,
    /// 0 = unlimited
    pub max_sessions: usize,
    /// 0 = unlimited
    pub max_channels: usize,
    pub http_addr: Option<SocketAddr>,
    pub admin_token: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig {
                addr: SocketAddr::from(([0, 0, 0, 0], 10001)),
                session_type: SessionType::Either,
            }],
            worker_threads: 2,
            login_timeout_secs: 30,
            channel_mtu: 2048,
            port_expired_secs: 120,
            display_interval_secs: 60,
            max_sessions: 0,
            max_channels: 0,
            http_addr: None,
            admin_token: None,
            redis_url: None,
        }
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e| invalid(format!("Invalid {}: {}", key, e)))
}

impl ServerConfig {
    /// Load configuration from environment variables, command line, and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        Self::load_from(&args, |key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with explicit inputs
    pub fn load_from<F>(args: &[String], env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.load_from_env(&env)?;
        let cli_path = config.load_from_args(args)?;

        if let Some(path) = cli_path.or_else(|| env("NATPROXY_CONFIG")) {
            config.load_from_toml(&path)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn load_from_env<F>(&mut self, env: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env("NATPROXY_LISTEN") {
            self.listeners = parse_listeners(&v)?;
        }
        if let Some(v) = env("NATPROXY_WORKERS") {
            self.worker_threads = parse_num("NATPROXY_WORKERS", &v)?;
        }
        if let Some(v) = env("NATPROXY_LOGIN_TIMEOUT") {
            self.login_timeout_secs = parse_num("NATPROXY_LOGIN_TIMEOUT", &v)?;
        }
        if let Some(v) = env("NATPROXY_HTTP_ADDR") {
            self.http_addr = Some(parse_num("NATPROXY_HTTP_ADDR", &v)?);
        }
        if let Some(v) = env("NATPROXY_ADMIN_TOKEN") {
            self.admin_token = Some(v);
        }
        if let Some(v) = env("NATPROXY_REDIS_URL") {
            self.redis_url = Some(v);
        }
        Ok(())
    }

    /// Apply command line flags; returns the `--config` path if given
    fn load_from_args(&mut self, args: &[String]) -> Result<Option<String>, ConfigError> {
        let mut config_path = None;
        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            let takes_value = matches!(
                flag,
                "--listen" | "-l" | "--workers" | "-w" | "--config" | "-f" | "--http-addr"
                    | "--admin-token"
            );
            if !takes_value {
                i += 1;
                continue;
            }

            let value = args
                .get(i + 1)
                .ok_or_else(|| invalid(format!("{} requires a value", flag)))?;
            match flag {
                "--listen" | "-l" => self.listeners = parse_listeners(value)?,
                "--workers" | "-w" => self.worker_threads = parse_num("workers", value)?,
                "--config" | "-f" => config_path = Some(value.clone()),
                "--http-addr" => self.http_addr = Some(parse_num("http_addr", value)?),
                "--admin-token" => self.admin_token = Some(value.clone()),
                _ => {}
            }
            i += 2;
        }
        Ok(config_path)
    }

    /// Overlay the keys present in a TOML file onto the current values
    fn load_from_toml(&mut self, path: &str) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: toml::Table = toml::from_str(&content)?;

        let mut merged = toml::Table::try_from(&*self)?;
        for (key, value) in file {
            merged.insert(key, value);
        }
        *self = merged.try_into()?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(invalid("at least one listener is required"));
        }

        let mut seen = HashSet::new();
        for l in &self.listeners {
            if !seen.insert(l.addr) {
                return Err(invalid(format!("duplicate listener {}", l.addr)));
            }
        }

        if self.worker_threads == 0 {
            return Err(invalid("worker_threads must be > 0"));
        }

        if self.login_timeout_secs == 0 {
            return Err(invalid("login_timeout_secs must be > 0"));
        }

        if !(64..=65535).contains(&self.channel_mtu) {
            return Err(invalid(format!(
                "channel_mtu must be within 64..=65535, got {}",
                self.channel_mtu
            )));
        }

        if matches!(&self.admin_token, Some(t) if t.is_empty()) {
            return Err(invalid("admin_token must not be empty"));
        }

        Ok(())
    }

    fn secs(value: u64) -> Option<Duration> {
        (value > 0).then(|| Duration::from_secs(value))
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            mtu: self.channel_mtu,
            port_expired: Self::secs(self.port_expired_secs),
            display_interval: Self::secs(self.display_interval_secs),
            ..ChannelConfig::default()
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            login_timeout: Duration::from_secs(self.login_timeout_secs),
            max_sessions: self.max_sessions,
            max_channels: self.max_channels,
            channel: self.channel_config(),
        }
    }
}

fn parse_listeners(value: &str) -> Result<Vec<ListenerConfig>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("natproxy-server")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_validate() {
        let config = ServerConfig::load_from(&args(&[]), no_env).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listeners[0].addr.port(), 10001);
    }

    #[test]
    fn test_env_then_args() {
        let env: HashMap<&str, &str> = [
            ("NATPROXY_LISTEN", "127.0.0.1:9000/server,127.0.0.1:9001/client"),
            ("NATPROXY_WORKERS", "4"),
        ]
        .into_iter()
        .collect();
        let lookup = |k: &str| env.get(k).map(|v| v.to_string());

        let config = ServerConfig::load_from(&args(&[]), lookup).unwrap();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.listeners.len(), 2);
        assert_eq!(config.listeners[0].session_type, SessionType::Server);
        assert_eq!(config.listeners[1].session_type, SessionType::Client);

        let config = ServerConfig::load_from(&args(&["--workers", "8"]), lookup).unwrap();
        assert_eq!(config.worker_threads, 8);
    }

    #[test]
    fn test_missing_flag_value() {
        let err = ServerConfig::load_from(&args(&["--listen"]), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_toml_overlays_only_present_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
port_expired_secs = 0
max_channels = 16

[[listeners]]
addr = "127.0.0.1:7000"
session_type = "server"
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config =
            ServerConfig::load_from(&args(&["-f", &path, "--workers", "3"]), no_env).unwrap();
        assert_eq!(config.port_expired_secs, 0);
        assert_eq!(config.max_channels, 16);
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.login_timeout_secs, 30);
        assert_eq!(
            config.listeners,
            vec![ListenerConfig {
                addr: "127.0.0.1:7000".parse().unwrap(),
                session_type: SessionType::Server,
            }]
        );
        assert!(config.channel_config().port_expired.is_none());
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = ServerConfig::default();
        config.worker_threads = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.listeners.push(config.listeners[0].clone());
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.channel_mtu = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_type_rules() {
        assert!(SessionType::Client.may_originate());
        assert!(!SessionType::Client.is_discoverable());
        assert!(!SessionType::Server.may_originate());
        assert!(SessionType::Server.is_discoverable());
        assert!(SessionType::Either.may_originate() && SessionType::Either.is_discoverable());
        assert!("bogus".parse::<SessionType>().is_err());
    }
}
