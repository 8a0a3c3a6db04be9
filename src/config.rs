use crate::retry::RetryConfig;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string for the durable message store.
    pub database_url: Option<String>,
    /// Socket server URL for the push transport.
    pub socket_url: String,
    /// Window within which a provisional entry may be matched to a durable one.
    pub reconcile_window: Duration,
    /// How long a provisional entry may stay unresolved before it is marked failed.
    pub resolve_timeout: Duration,
    /// Typing indicator auto-expiry.
    pub typing_expiry: Duration,
    pub retry: RetryConfig,
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::ChatError> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());
        let socket_url =
            env::var("SOCKET_URL").unwrap_or_else(|_| "ws://localhost:8080".to_string());

        Ok(Self {
            database_url,
            socket_url,
            reconcile_window: env_secs("RECONCILE_WINDOW_SECS", 5),
            resolve_timeout: env_secs("RESOLVE_TIMEOUT_SECS", 30),
            typing_expiry: env_secs("TYPING_EXPIRY_SECS", 3),
            retry: RetryConfig::default(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            socket_url: "ws://localhost:8080".to_string(),
            reconcile_window: Duration::from_secs(5),
            resolve_timeout: Duration::from_secs(30),
            typing_expiry: Duration::from_secs(3),
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_product_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.reconcile_window, Duration::from_secs(5));
        assert_eq!(cfg.resolve_timeout, Duration::from_secs(30));
        assert_eq!(cfg.typing_expiry, Duration::from_secs(3));
    }
}
