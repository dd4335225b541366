use std::env;
use std::net::IpAddr;
use std::time::Duration;

use url::Url;

use crate::error::{EgretError, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Outbound source IPs to balance across (required, comma-separated)
    pub ips: Vec<String>,
    /// Proxy listening port (default: 3128)
    pub port: u16,
    /// Ops server port for health/stats/metrics (default: 9090)
    pub ops_port: u16,
    /// Optional basic auth in "user:pass" format (empty = disabled)
    pub auth: String,
    /// Connection timeout
    pub timeout: Duration,
    /// Idle timeout for CONNECT tunnels and server connections
    pub idle_timeout: Duration,
    /// Maximum concurrent connections per outbound IP
    pub max_conns_per_ip: i64,
    /// Maximum total concurrent connections
    pub max_conns_total: i64,
    /// Time window for the per-host selection history
    pub history_window: Duration,
    /// Maximum history entries considered per host
    pub history_size: usize,
    /// Maximum total history entries across all hosts (0 = unlimited)
    pub history_max_total_entries: usize,
    /// TCP keep-alive interval for outbound connections
    pub tcp_keepalive: Duration,
    /// Idle timeout for pooled upstream connections
    pub idle_conn_timeout: Duration,
    /// TLS handshake timeout for pooled transports
    pub tls_handshake_timeout: Duration,
    /// Expect: 100-continue timeout for pooled transports
    pub expect_continue_timeout: Duration,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (json, text)
    pub log_format: String,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,
    /// Active health check configuration
    pub health_check: HealthCheckConfig,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Failures before opening the circuit
    pub failure_threshold: u32,
    /// Successes in half-open before closing the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before probing again
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Check type: "tcp" or "http"
    pub check_type: String,
    /// Interval between check rounds
    pub interval: Duration,
    /// Timeout for each individual check
    pub timeout: Duration,
    /// Target: "host:port" for tcp, URL for http
    pub target: String,
    /// Consecutive failures before an IP is marked unhealthy
    pub failure_threshold: u32,
    /// Consecutive successes before an unhealthy IP recovers
    pub success_threshold: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Config {
            ips: get_env_or("EGRET_IPS", "")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            port: parse_env("EGRET_PORT", "3128")?,
            ops_port: parse_env("EGRET_OPS_PORT", "9090")?,
            auth: get_env_or("EGRET_AUTH", ""),
            timeout: parse_env_secs("EGRET_TIMEOUT", "30")?,
            idle_timeout: parse_env_secs("EGRET_IDLE_TIMEOUT", "60")?,
            max_conns_per_ip: parse_env("EGRET_MAX_CONNS_PER_IP", "100")?,
            max_conns_total: parse_env("EGRET_MAX_CONNS_TOTAL", "1000")?,
            history_window: parse_env_secs("EGRET_HISTORY_WINDOW", "300")?,
            history_size: parse_env("EGRET_HISTORY_SIZE", "100")?,
            history_max_total_entries: parse_env("EGRET_HISTORY_MAX_TOTAL_ENTRIES", "100000")?,
            tcp_keepalive: parse_env_secs("EGRET_TCP_KEEPALIVE", "30")?,
            idle_conn_timeout: parse_env_secs("EGRET_IDLE_CONN_TIMEOUT", "90")?,
            tls_handshake_timeout: parse_env_secs("EGRET_TLS_HANDSHAKE_TIMEOUT", "10")?,
            expect_continue_timeout: parse_env_secs("EGRET_EXPECT_CONTINUE_TIMEOUT", "1")?,
            log_level: get_env_or("EGRET_LOG_LEVEL", "info"),
            log_format: get_env_or("EGRET_LOG_FORMAT", "json"),
            circuit_breaker: CircuitBreakerConfig {
                enabled: parse_env("EGRET_CIRCUIT_BREAKER_ENABLED", "false")?,
                failure_threshold: parse_env("EGRET_CB_FAILURE_THRESHOLD", "5")?,
                success_threshold: parse_env("EGRET_CB_SUCCESS_THRESHOLD", "2")?,
                timeout: parse_env_secs("EGRET_CB_TIMEOUT", "30")?,
            },
            health_check: HealthCheckConfig {
                enabled: parse_env("EGRET_HEALTH_CHECK_ENABLED", "false")?,
                check_type: get_env_or("EGRET_HEALTH_CHECK_TYPE", "tcp"),
                interval: parse_env_secs("EGRET_HEALTH_CHECK_INTERVAL", "10")?,
                timeout: parse_env_secs("EGRET_HEALTH_CHECK_TIMEOUT", "5")?,
                target: get_env_or("EGRET_HEALTH_CHECK_TARGET", "1.1.1.1:443"),
                failure_threshold: parse_env("EGRET_HEALTH_CHECK_FAILURE_THRESHOLD", "3")?,
                success_threshold: parse_env("EGRET_HEALTH_CHECK_SUCCESS_THRESHOLD", "2")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is valid. All violations are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.ips.is_empty() {
            return Err(EgretError::InvalidConfig(
                "at least one outbound IP is required (EGRET_IPS)".into(),
            ));
        }

        for ip in &self.ips {
            if ip.parse::<IpAddr>().is_err() {
                return Err(EgretError::InvalidConfig(format!(
                    "invalid IP address: {}",
                    ip
                )));
            }
        }

        if self.port == 0 {
            return Err(EgretError::InvalidConfig("invalid port: 0".into()));
        }

        if self.ops_port == 0 {
            return Err(EgretError::InvalidConfig("invalid ops port: 0".into()));
        }

        if self.port == self.ops_port {
            return Err(EgretError::InvalidConfig(
                "proxy port and ops port must be different".into(),
            ));
        }

        if !self.auth.is_empty() && !self.auth.contains(':') {
            return Err(EgretError::InvalidConfig(
                "auth must be in 'user:pass' format".into(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(EgretError::InvalidConfig("timeout must be positive".into()));
        }

        if self.idle_timeout.is_zero() {
            return Err(EgretError::InvalidConfig(
                "idle-timeout must be positive".into(),
            ));
        }

        if self.max_conns_per_ip < 1 {
            return Err(EgretError::InvalidConfig(
                "max-conns-per-ip must be at least 1".into(),
            ));
        }

        if self.max_conns_total < 1 {
            return Err(EgretError::InvalidConfig(
                "max-conns-total must be at least 1".into(),
            ));
        }

        if self.history_window.is_zero() {
            return Err(EgretError::InvalidConfig(
                "history-window must be positive".into(),
            ));
        }

        if self.history_size < 1 {
            return Err(EgretError::InvalidConfig(
                "history-size must be at least 1".into(),
            ));
        }

        const VALID_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !VALID_LEVELS.contains(&self.log_level.as_str()) {
            return Err(EgretError::InvalidConfig(format!(
                "invalid log level: {} (must be trace, debug, info, warn, or error)",
                self.log_level
            )));
        }

        const VALID_FORMATS: &[&str] = &["json", "text"];
        if !VALID_FORMATS.contains(&self.log_format.as_str()) {
            return Err(EgretError::InvalidConfig(format!(
                "invalid log format: {} (must be json or text)",
                self.log_format
            )));
        }

        if self.health_check.enabled {
            match self.health_check.check_type.as_str() {
                "tcp" => {
                    if !self.health_check.target.contains(':') {
                        return Err(EgretError::InvalidConfig(
                            "tcp health check target must be in 'host:port' format".into(),
                        ));
                    }
                }
                "http" => {
                    let url = Url::parse(&self.health_check.target).map_err(|e| {
                        EgretError::InvalidConfig(format!(
                            "http health check target must be a valid URL: {}",
                            e
                        ))
                    })?;
                    if url.scheme() != "http" {
                        return Err(EgretError::InvalidConfig(format!(
                            "http health check target must use the http scheme, got {}",
                            url.scheme()
                        )));
                    }
                }
                other => {
                    return Err(EgretError::InvalidConfig(format!(
                        "invalid health check type: {} (must be tcp or http)",
                        other
                    )));
                }
            }
        }

        Ok(())
    }

    /// Username and password if auth is configured.
    /// The password may contain colons; only the first colon separates.
    pub fn auth_credentials(&self) -> Option<(String, String)> {
        if self.auth.is_empty() {
            return None;
        }
        self.auth
            .split_once(':')
            .map(|(user, pass)| (user.to_string(), pass.to_string()))
    }

    /// Proxy listener address
    pub fn proxy_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Ops server address
    pub fn ops_addr(&self) -> String {
        format!("0.0.0.0:{}", self.ops_port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    get_env_or(key, default)
        .parse()
        .map_err(|_| EgretError::InvalidConfig(format!("{} must be a valid value", key)))
}

fn parse_env_secs(key: &str, default: &str) -> Result<Duration> {
    let secs: u64 = parse_env(key, default)?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "EGRET_IPS",
        "EGRET_PORT",
        "EGRET_OPS_PORT",
        "EGRET_AUTH",
        "EGRET_TIMEOUT",
        "EGRET_IDLE_TIMEOUT",
        "EGRET_MAX_CONNS_PER_IP",
        "EGRET_MAX_CONNS_TOTAL",
        "EGRET_HISTORY_WINDOW",
        "EGRET_HISTORY_SIZE",
        "EGRET_HISTORY_MAX_TOTAL_ENTRIES",
        "EGRET_TCP_KEEPALIVE",
        "EGRET_IDLE_CONN_TIMEOUT",
        "EGRET_TLS_HANDSHAKE_TIMEOUT",
        "EGRET_EXPECT_CONTINUE_TIMEOUT",
        "EGRET_LOG_LEVEL",
        "EGRET_LOG_FORMAT",
        "EGRET_CIRCUIT_BREAKER_ENABLED",
        "EGRET_CB_FAILURE_THRESHOLD",
        "EGRET_CB_SUCCESS_THRESHOLD",
        "EGRET_CB_TIMEOUT",
        "EGRET_HEALTH_CHECK_ENABLED",
        "EGRET_HEALTH_CHECK_TYPE",
        "EGRET_HEALTH_CHECK_INTERVAL",
        "EGRET_HEALTH_CHECK_TIMEOUT",
        "EGRET_HEALTH_CHECK_TARGET",
        "EGRET_HEALTH_CHECK_FAILURE_THRESHOLD",
        "EGRET_HEALTH_CHECK_SUCCESS_THRESHOLD",
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

        env::set_var("EGRET_IPS", "10.0.0.1,10.0.0.2");

        let config = Config::from_env().unwrap();

        assert_eq!(config.ips, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(config.port, 3128);
        assert_eq!(config.ops_port, 9090);
        assert_eq!(config.auth, "");
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.max_conns_per_ip, 100);
        assert_eq!(config.max_conns_total, 1000);
        assert_eq!(config.history_window, Duration::from_secs(300));
        assert_eq!(config.history_size, 100);
        assert_eq!(config.history_max_total_entries, 100_000);
        assert!(!config.circuit_breaker.enabled);
        assert!(!config.health_check.enabled);
        assert_eq!(config.health_check.check_type, "tcp");
        assert_eq!(config.health_check.target, "1.1.1.1:443");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", " 10.0.0.1 , 10.0.0.2 ,10.0.0.3");
        env::set_var("EGRET_PORT", "8080");
        env::set_var("EGRET_AUTH", "alice:s3cret");
        env::set_var("EGRET_MAX_CONNS_PER_IP", "5");
        env::set_var("EGRET_HEALTH_CHECK_ENABLED", "true");
        env::set_var("EGRET_HEALTH_CHECK_TYPE", "http");
        env::set_var("EGRET_HEALTH_CHECK_TARGET", "http://example.com/health");

        let config = Config::from_env().unwrap();

        assert_eq!(config.ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(config.port, 8080);
        assert_eq!(
            config.auth_credentials(),
            Some(("alice".to_string(), "s3cret".to_string()))
        );
        assert_eq!(config.max_conns_per_ip, 5);
        assert!(config.health_check.enabled);
        assert_eq!(config.health_check.check_type, "http");
    }

    #[test]
    fn test_config_requires_ips() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EgretError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_invalid_ip() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", "10.0.0.1,not-an-ip");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EgretError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_port_collision() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", "10.0.0.1");
        env::set_var("EGRET_PORT", "9090");
        env::set_var("EGRET_OPS_PORT", "9090");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EgretError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_malformed_auth() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", "10.0.0.1");
        env::set_var("EGRET_AUTH", "no-colon-here");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EgretError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_zero_timeout() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", "10.0.0.1");
        env::set_var("EGRET_TIMEOUT", "0");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EgretError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_invalid_log_level() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", "10.0.0.1");
        env::set_var("EGRET_LOG_LEVEL", "verbose");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EgretError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_bad_health_check_target() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", "10.0.0.1");
        env::set_var("EGRET_HEALTH_CHECK_ENABLED", "true");
        env::set_var("EGRET_HEALTH_CHECK_TYPE", "tcp");
        env::set_var("EGRET_HEALTH_CHECK_TARGET", "no-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EgretError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_https_probe_target() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", "10.0.0.1");
        env::set_var("EGRET_HEALTH_CHECK_ENABLED", "true");
        env::set_var("EGRET_HEALTH_CHECK_TYPE", "http");
        env::set_var("EGRET_HEALTH_CHECK_TARGET", "https://example.com/health");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, EgretError::InvalidConfig(_)));
    }

    #[test]
    fn test_auth_credentials_password_with_colons() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", "10.0.0.1");
        env::set_var("EGRET_AUTH", "user:pa:ss:word");
        let config = Config::from_env().unwrap();
        assert_eq!(
            config.auth_credentials(),
            Some(("user".to_string(), "pa:ss:word".to_string()))
        );
    }

    #[test]
    fn test_config_addr_formatters() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("EGRET_IPS", "10.0.0.1");
        let config = Config::from_env().unwrap();
        assert_eq!(config.proxy_addr(), "0.0.0.0:3128");
        assert_eq!(config.ops_addr(), "0.0.0.0:9090");
    }
}
