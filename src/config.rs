//! Client settings, with defaults and overrides from environment variables.

use std::time::Duration;

use crate::error::RconError;

pub const DEFAULT_PORT: u16 = 25575;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Timing and server behaviour knobs for a [Client](crate::client::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// How long to wait for the answer to a request before giving up.
    pub timeout: Duration,
    /// Pause between two looks at the answer registry.
    pub poll_interval: Duration,
    /// Upper bound for opening the TCP stream.
    pub connect_timeout: Duration,
    /// Pause before every reconnect attempt.
    pub reconnect_delay: Duration,
    /// Whether the server can work on several requests at once. Most can't
    /// (Spigot, srcds), so fire-and-forget sends wait for their answer
    /// unless this is set.
    pub server_multiplexes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            server_multiplexes: false,
        }
    }
}

impl Settings {
    /// Build settings from environment variables, falling back to defaults.
    ///
    /// - `RCON_TIMEOUT_MS`: default 3000
    /// - `RCON_POLL_INTERVAL_MS`: default 1
    /// - `RCON_CONNECT_TIMEOUT_MS`: default 5000
    /// - `RCON_RECONNECT_DELAY_MS`: default 100
    /// - `RCON_MULTIPLEXED`: `true` or `false`, default false
    pub fn from_env() -> Result<Self, RconError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, RconError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        Ok(Settings {
            timeout: parse_millis(&lookup, "RCON_TIMEOUT_MS", defaults.timeout)?,
            poll_interval: parse_millis(&lookup, "RCON_POLL_INTERVAL_MS", defaults.poll_interval)?,
            connect_timeout: parse_millis(
                &lookup,
                "RCON_CONNECT_TIMEOUT_MS",
                defaults.connect_timeout,
            )?,
            reconnect_delay: parse_millis(
                &lookup,
                "RCON_RECONNECT_DELAY_MS",
                defaults.reconnect_delay,
            )?,
            server_multiplexes: parse_bool(&lookup, "RCON_MULTIPLEXED", defaults.server_multiplexes)?,
        })
    }
}

/// Where to connect and how to log in.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Empty means the server is not asked for a login.
    pub password: String,
}

impl Endpoint {
    pub fn new(host: &str, port: u16, password: &str) -> Self {
        Endpoint {
            host: host.to_owned(),
            port,
            password: password.to_owned(),
        }
    }

    /// - `RCON_HOST`: default `127.0.0.1`
    /// - `RCON_PORT`: default 25575
    /// - `RCON_PASSWORD`: default empty
    pub fn from_env() -> Result<Self, RconError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, RconError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("RCON_PORT") {
            Some(raw) => raw.trim().parse().map_err(|_| RconError::InvalidConfig {
                var: "RCON_PORT",
                value: raw,
            })?,
            None => DEFAULT_PORT,
        };

        Ok(Endpoint {
            host: lookup("RCON_HOST").unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            port,
            password: lookup("RCON_PASSWORD").unwrap_or_default(),
        })
    }
}

// keep the password out of logs
impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .finish()
    }
}

fn parse_millis<F>(lookup: &F, var: &'static str, default: Duration) -> Result<Duration, RconError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| RconError::InvalidConfig { var, value: raw }),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, var: &'static str, default: bool) -> Result<bool, RconError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(RconError::InvalidConfig { var, value: raw }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn settings_default_without_env() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.timeout, Duration::from_secs(3));
        assert!(!settings.server_multiplexes);
    }

    #[test]
    fn settings_parse_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("RCON_TIMEOUT_MS", "10000"),
            ("RCON_POLL_INTERVAL_MS", " 5 "),
            ("RCON_RECONNECT_DELAY_MS", "0"),
            ("RCON_MULTIPLEXED", "TRUE"),
        ]))
        .unwrap();

        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert_eq!(settings.poll_interval, Duration::from_millis(5));
        assert_eq!(settings.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(settings.reconnect_delay, Duration::ZERO);
        assert!(settings.server_multiplexes);
    }

    #[test]
    fn settings_reject_garbage() {
        let err = Settings::from_lookup(lookup(&[("RCON_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(matches!(
            err,
            RconError::InvalidConfig { var: "RCON_TIMEOUT_MS", .. }
        ));

        let err = Settings::from_lookup(lookup(&[("RCON_MULTIPLEXED", "maybe")])).unwrap_err();
        assert!(err.to_string().contains("RCON_MULTIPLEXED"));
    }

    #[test]
    fn endpoint_defaults() {
        let endpoint = Endpoint::from_lookup(lookup(&[])).unwrap();
        assert_eq!(endpoint, Endpoint::new("127.0.0.1", 25575, ""));
    }

    #[test]
    fn endpoint_overrides_and_bad_port() {
        let endpoint = Endpoint::from_lookup(lookup(&[
            ("RCON_HOST", "mc.example.org"),
            ("RCON_PORT", "27015"),
            ("RCON_PASSWORD", "hunter2"),
        ]))
        .unwrap();
        assert_eq!(endpoint.host, "mc.example.org");
        assert_eq!(endpoint.port, 27015);
        assert!(!format!("{:?}", endpoint).contains("hunter2"));

        let err = Endpoint::from_lookup(lookup(&[("RCON_PORT", "70000")])).unwrap_err();
        assert!(matches!(err, RconError::InvalidConfig { var: "RCON_PORT", .. }));
    }
}
