use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use rand::RngCore;
use thiserror::Error;
use tracing::warn;

use crate::calendar::{CalendarProvider, LocalCalendar, NoopCalendar};
use crate::model::Ms;
use crate::ratelimit::{RatePolicies, WindowPolicy};

const HOUR_MS: Ms = 3_600_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
    #[error("both SLOTD_TLS_CERT and SLOTD_TLS_KEY must be set, or neither")]
    TlsPair,
    #[error("tls: {0}")]
    Tls(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Which calendar provider every tenant gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarKind {
    Local,
    Noop,
}

impl CalendarKind {
    pub fn build(self) -> Arc<dyn CalendarProvider> {
        match self {
            CalendarKind::Local => Arc::new(LocalCalendar::new()),
            CalendarKind::Noop => Arc::new(NoopCalendar),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub token_secret: Vec<u8>,
    pub token_ttl_ms: Ms,
    pub calendar: CalendarKind,
    pub calendar_timeout: Duration,
    pub rate_policies: RatePolicies,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("bind", &self.bind)
            .field("data_dir", &self.data_dir)
            .field("max_connections", &self.max_connections)
            .field("compact_threshold", &self.compact_threshold)
            .field("metrics_port", &self.metrics_port)
            .field("tls", &self.tls_cert.is_some())
            .field("token_ttl_ms", &self.token_ttl_ms)
            .field("calendar", &self.calendar)
            .field("calendar_timeout", &self.calendar_timeout)
            .field("rate_policies", &self.rate_policies)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            token_secret: Vec::new(),
            token_ttl_ms: 720 * HOUR_MS,
            calendar: CalendarKind::Local,
            calendar_timeout: Duration::from_millis(3000),
            rate_policies: RatePolicies::default(),
        }
    }
}

impl Config {
    /// Read `SLOTD_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(&format!("SLOTD_{name}")).filter(|v| !v.is_empty());
        let mut cfg = Config::default();

        if let Some(v) = var("PORT") {
            cfg.port = parse("SLOTD_PORT", &v)?;
        }
        if let Some(v) = var("BIND") {
            cfg.bind = v;
        }
        if let Some(v) = var("DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        if let Some(v) = var("PASSWORD") {
            cfg.password = v;
        }
        if let Some(v) = var("MAX_CONNECTIONS") {
            cfg.max_connections = parse("SLOTD_MAX_CONNECTIONS", &v)?;
            if cfg.max_connections == 0 {
                return Err(invalid("SLOTD_MAX_CONNECTIONS", &v, "must be positive"));
            }
        }
        if let Some(v) = var("COMPACT_THRESHOLD") {
            cfg.compact_threshold = parse("SLOTD_COMPACT_THRESHOLD", &v)?;
        }
        if let Some(v) = var("METRICS_PORT") {
            cfg.metrics_port = Some(parse("SLOTD_METRICS_PORT", &v)?);
        }

        cfg.tls_cert = var("TLS_CERT");
        cfg.tls_key = var("TLS_KEY");
        if cfg.tls_cert.is_some() != cfg.tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        cfg.token_secret = match var("TOKEN_SECRET") {
            Some(secret) if secret.len() < 16 => {
                return Err(invalid("SLOTD_TOKEN_SECRET", "<redacted>", "needs at least 16 bytes"));
            }
            Some(secret) => secret.into_bytes(),
            None => {
                warn!("SLOTD_TOKEN_SECRET not set; tokens will not survive a restart");
                let mut secret = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut secret);
                secret
            }
        };
        if let Some(v) = var("TOKEN_TTL_HOURS") {
            let hours: i64 = parse("SLOTD_TOKEN_TTL_HOURS", &v)?;
            if hours <= 0 {
                return Err(invalid("SLOTD_TOKEN_TTL_HOURS", &v, "must be positive"));
            }
            cfg.token_ttl_ms = hours.saturating_mul(HOUR_MS);
        }

        if let Some(v) = var("CALENDAR") {
            cfg.calendar = match v.to_ascii_lowercase().as_str() {
                "local" => CalendarKind::Local,
                "noop" | "none" => CalendarKind::Noop,
                _ => return Err(invalid("SLOTD_CALENDAR", &v, "expected 'local' or 'noop'")),
            };
        }
        if let Some(v) = var("CALENDAR_TIMEOUT_MS") {
            let ms: u64 = parse("SLOTD_CALENDAR_TIMEOUT_MS", &v)?;
            cfg.calendar_timeout = Duration::from_millis(ms);
        }

        let policies = &mut cfg.rate_policies;
        for (class, policy) in [
            ("AUTOMATION", &mut policies.automation),
            ("CONSOLE", &mut policies.console),
            ("ANONYMOUS", &mut policies.anonymous),
        ] {
            read_policy(&var, class, policy)?;
        }

        Ok(cfg)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// TLS acceptor from the configured PEM files, if any.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => return Err(ConfigError::TlsPair),
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| ConfigError::Tls("no private key found in key file".into()))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;

        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn read_policy(
    var: &impl Fn(&str) -> Option<String>,
    class: &str,
    policy: &mut WindowPolicy,
) -> Result<(), ConfigError> {
    let quota_var = format!("RATE_{class}_QUOTA");
    if let Some(v) = var(&quota_var) {
        policy.quota = parse(&format!("SLOTD_{quota_var}"), &v)?;
    }
    let window_var = format!("RATE_{class}_WINDOW_SECS");
    if let Some(v) = var(&window_var) {
        let secs: i64 = parse(&format!("SLOTD_{window_var}"), &v)?;
        if secs <= 0 {
            return Err(invalid(&format!("SLOTD_{window_var}"), &v, "must be positive"));
        }
        policy.window_ms = secs.saturating_mul(1000);
    }
    Ok(())
}

fn parse<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| invalid(var, value, &e.to_string()))
}

fn invalid(var: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var: var.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.token_ttl_ms, 720 * HOUR_MS);
        assert_eq!(cfg.token_secret.len(), 32);
        assert_eq!(cfg.calendar, CalendarKind::Local);
        assert_eq!(cfg.calendar_timeout, Duration::from_secs(3));
        assert_eq!(cfg.rate_policies, RatePolicies::default());
        assert!(cfg.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides() {
        let cfg = from_pairs(&[
            ("SLOTD_PORT", "6000"),
            ("SLOTD_CALENDAR", "noop"),
            ("SLOTD_CALENDAR_TIMEOUT_MS", "250"),
            ("SLOTD_TOKEN_SECRET", "0123456789abcdef0123"),
            ("SLOTD_TOKEN_TTL_HOURS", "2"),
            ("SLOTD_RATE_ANONYMOUS_QUOTA", "5"),
            ("SLOTD_RATE_ANONYMOUS_WINDOW_SECS", "10"),
            ("SLOTD_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.calendar, CalendarKind::Noop);
        assert_eq!(cfg.calendar_timeout, Duration::from_millis(250));
        assert_eq!(cfg.token_secret, b"0123456789abcdef0123".to_vec());
        assert_eq!(cfg.token_ttl_ms, 2 * HOUR_MS);
        assert_eq!(cfg.rate_policies.anonymous.quota, 5);
        assert_eq!(cfg.rate_policies.anonymous.window_ms, 10_000);
        assert_eq!(cfg.rate_policies.console, RatePolicies::default().console);
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            from_pairs(&[("SLOTD_PORT", "not-a-port")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            from_pairs(&[("SLOTD_CALENDAR", "google")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            from_pairs(&[("SLOTD_TLS_CERT", "/tmp/cert.pem")]),
            Err(ConfigError::TlsPair)
        ));
        assert!(matches!(
            from_pairs(&[("SLOTD_TOKEN_SECRET", "short")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            from_pairs(&[("SLOTD_RATE_CONSOLE_WINDOW_SECS", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
