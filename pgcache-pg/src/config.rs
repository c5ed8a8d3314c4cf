//! Connection settings for the notification transport.

use std::time::Duration;

/// PostgreSQL connection configuration for the listening connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Full connection string; takes precedence over the individual parts.
    pub url: Option<String>,
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Delay between reconnect attempts after the connection drops
    pub reconnect_delay: Duration,
    /// Give up after this many consecutive failed reconnects (0 = never)
    pub max_reconnect_attempts: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: "".to_string(),
            connect_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 0,
        }
    }
}

impl DbConfig {
    /// Create a new database configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            url: lookup("PG_CACHE_POSTGRES_URL").filter(|s| !s.trim().is_empty()),
            host: lookup("PG_CACHE_DB_HOST").unwrap_or(defaults.host),
            port: lookup("PG_CACHE_DB_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            dbname: lookup("PG_CACHE_DB_NAME").unwrap_or(defaults.dbname),
            user: lookup("PG_CACHE_DB_USER").unwrap_or(defaults.user),
            password: lookup("PG_CACHE_DB_PASSWORD").unwrap_or_default(),
            connect_timeout: lookup("PG_CACHE_DB_TIMEOUT")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            reconnect_delay: lookup("PG_CACHE_RECONNECT_DELAY_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect_delay),
            max_reconnect_attempts: lookup("PG_CACHE_MAX_RECONNECTS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_reconnect_attempts),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Connection string understood by `tokio_postgres::connect`.
    pub fn connection_string(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let mut parts = vec![
            format!("host={}", self.host),
            format!("port={}", self.port),
            format!("dbname={}", self.dbname),
            format!("user={}", self.user),
            format!("connect_timeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if !self.password.is_empty() {
            parts.push(format!("password='{}'", self.password.replace('\\', "\\\\").replace('\'', "\\'")));
        }
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_takes_precedence() {
        let config = DbConfig::default().with_url("postgres://u@db/app");
        assert_eq!(config.connection_string(), "postgres://u@db/app");
    }

    #[test]
    fn test_connection_string_from_parts() {
        let config = DbConfig::from_lookup(|name| match name {
            "PG_CACHE_DB_HOST" => Some("db".to_string()),
            "PG_CACHE_DB_PORT" => Some("6543".to_string()),
            "PG_CACHE_DB_PASSWORD" => Some("it's".to_string()),
            _ => None,
        });
        let conn = config.connection_string();
        assert!(conn.contains("host=db"));
        assert!(conn.contains("port=6543"));
        assert!(conn.contains("password='it\\'s'"));
    }

    #[test]
    fn test_reconnect_settings() {
        let config = DbConfig::from_lookup(|name| match name {
            "PG_CACHE_RECONNECT_DELAY_MS" => Some("250".to_string()),
            "PG_CACHE_MAX_RECONNECTS" => Some("5".to_string()),
            _ => None,
        });
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.max_reconnect_attempts, 5);
    }
}
