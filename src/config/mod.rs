use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables shared by the broker core. Every knob has a default suitable for
/// development; production overrides come in through the environment.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Outbound queue bound per connection; gates the slow-consumer policy.
    pub queue_bound: usize,
    /// How long a backend connection may take to IDENTIFY.
    pub auth_deadline: Duration,
    /// Lifetime of an unredeemed single-use access token.
    pub token_ttl: Duration,
    /// Interval between server `__heartbeat__` frames on frontend
    /// connections. Zero disables heartbeats.
    pub heartbeat_interval: Duration,
    /// Failed frontend `auth` attempts tolerated before the connection is
    /// closed.
    pub auth_retry_budget: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_bound: 64,
            auth_deadline: Duration::from_secs(10),
            token_ttl: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            auth_retry_budget: 3,
        }
    }
}

/// Launcher-facing configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    pub frontend_host: String,
    pub frontend_port: u16,
    pub backend_host: String,
    pub backend_port: u16,
    /// Vhost paths created at boot; their generated secrets are logged so
    /// workers can be provisioned.
    pub vhosts: Vec<String>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub broker: BrokerConfig,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let defaults = BrokerConfig::default();
        let broker = BrokerConfig {
            queue_bound: env_parse("WEBROCKET_QUEUE_BOUND", defaults.queue_bound),
            auth_deadline: Duration::from_secs(env_parse(
                "WEBROCKET_AUTH_DEADLINE_SECS",
                defaults.auth_deadline.as_secs(),
            )),
            token_ttl: Duration::from_secs(env_parse(
                "WEBROCKET_TOKEN_TTL_SECS",
                defaults.token_ttl.as_secs(),
            )),
            heartbeat_interval: Duration::from_secs(env_parse(
                "WEBROCKET_HEARTBEAT_SECS",
                defaults.heartbeat_interval.as_secs(),
            )),
            auth_retry_budget: env_parse("WEBROCKET_AUTH_RETRIES", defaults.auth_retry_budget),
        };

        let vhosts = env::var("WEBROCKET_VHOSTS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Config {
            frontend_host: env_or("WEBROCKET_FRONTEND_HOST", "127.0.0.1"),
            frontend_port: env_parse("WEBROCKET_FRONTEND_PORT", 8080),
            backend_host: env_or("WEBROCKET_BACKEND_HOST", "127.0.0.1"),
            backend_port: env_parse("WEBROCKET_BACKEND_PORT", 8081),
            vhosts,
            tls_cert: env::var("WEBROCKET_TLS_CERT").ok().map(PathBuf::from),
            tls_key: env::var("WEBROCKET_TLS_KEY").ok().map(PathBuf::from),
            broker,
        }
    }

    pub fn frontend_addr(&self) -> String {
        format!("{}:{}", self.frontend_host, self.frontend_port)
    }

    pub fn backend_addr(&self) -> String {
        format!("{}:{}", self.backend_host, self.backend_port)
    }

    /// TLS is enabled only when both halves of the credential pair are set.
    pub fn tls_pair(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}
