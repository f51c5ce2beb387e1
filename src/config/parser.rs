use super::ConfigError;
use serde::{Deserialize, Serialize};

/// Process configuration, sourced entirely from the environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub platform: PlatformConfig,
    pub security: SecurityConfig,
    pub web: WebConfig,
    pub fanout: FanoutConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    pub url: String,
    pub pool_size: u32,
    pub pool_overflow: u32,
}

impl StoreConfig {
    pub fn store_type(&self) -> StoreType {
        if self.url.starts_with("sqlite://") {
            StoreType::Sqlite
        } else {
            StoreType::Postgres
        }
    }

    pub fn sqlite_path(&self) -> Option<String> {
        self.url
            .strip_prefix("sqlite://")
            .map(|path| path.to_string())
    }

    pub fn max_connections(&self) -> u32 {
        match self.store_type() {
            StoreType::Postgres => self.pool_size + self.pool_overflow,
            StoreType::Sqlite => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub url: String,
    pub pool_max: u32,
}

impl CacheConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlatformConfig {
    pub token: String,
    /// Per-call timeout for platform API requests, in seconds.
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    pub admin_username: String,
    pub admin_password: String,
    pub secret_key: String,
    pub token_expire_minutes: u64,
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    pub bind_address: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FanoutConfig {
    pub per_room_concurrency: usize,
    pub retry_max: u32,
    pub drain_deadline_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self {
            store: StoreConfig {
                url: require_var("STORE_URL")?,
                pool_size: parse_var("STORE_POOL_SIZE", 20)?,
                pool_overflow: parse_var("STORE_POOL_OVERFLOW", 30)?,
            },
            cache: CacheConfig {
                url: require_var("CACHE_URL")?,
                pool_max: parse_var("CACHE_POOL_MAX", 20)?,
            },
            platform: PlatformConfig {
                token: require_var("PLATFORM_TOKEN")?,
                call_timeout_secs: parse_var("PLATFORM_CALL_TIMEOUT_SEC", 10)?,
            },
            security: SecurityConfig {
                admin_username: require_var("ADMIN_USERNAME")?,
                admin_password: require_var("ADMIN_PASSWORD")?,
                secret_key: require_var("SECRET_KEY")?,
                token_expire_minutes: parse_var("TOKEN_EXPIRE_MINUTES", 1440)?,
                rate_limit_requests: parse_var("RATE_LIMIT_REQUESTS", 100)?,
                rate_limit_window_secs: parse_var("RATE_LIMIT_WINDOW_SEC", 60)?,
            },
            web: WebConfig {
                bind_address: string_var("BIND_ADDRESS", "0.0.0.0"),
                port: parse_var("PORT", 8000)?,
                allowed_origins: list_var("ALLOWED_ORIGINS"),
                debug: parse_var("DEBUG", false)?,
            },
            fanout: FanoutConfig {
                per_room_concurrency: parse_var("FANOUT_PER_ROOM_CONCURRENCY", 32)?,
                retry_max: parse_var("FANOUT_RETRY_MAX", 3)?,
                drain_deadline_secs: parse_var("FANOUT_DRAIN_DEADLINE_SEC", 30)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.url.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "STORE_URL cannot be empty".to_string(),
            ));
        }

        if self.cache.url.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "CACHE_URL cannot be empty".to_string(),
            ));
        }

        if self.platform.token.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "PLATFORM_TOKEN cannot be empty".to_string(),
            ));
        }

        if self.security.secret_key.len() < 32 {
            return Err(ConfigError::InvalidConfig(
                "SECRET_KEY must be at least 32 bytes".to_string(),
            ));
        }

        if self.web.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "PORT must be between 1 and 65535".to_string(),
            ));
        }

        if self.fanout.per_room_concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "FANOUT_PER_ROOM_CONCURRENCY must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name)),
    }
}

fn string_var(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn list_var(name: &'static str) -> Vec<String> {
    std::env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|err: T::Err| ConfigError::InvalidValue {
            name,
            reason: err.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            store: StoreConfig {
                url: "sqlite:///tmp/relay.db".to_string(),
                pool_size: 20,
                pool_overflow: 30,
            },
            cache: CacheConfig {
                url: "memory://".to_string(),
                pool_max: 20,
            },
            platform: PlatformConfig {
                token: "token".to_string(),
                call_timeout_secs: 10,
            },
            security: SecurityConfig {
                admin_username: "admin".to_string(),
                admin_password: "password".to_string(),
                secret_key: "0123456789abcdef0123456789abcdef".to_string(),
                token_expire_minutes: 1440,
                rate_limit_requests: 100,
                rate_limit_window_secs: 60,
            },
            web: WebConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8000,
                allowed_origins: Vec::new(),
                debug: false,
            },
            fanout: FanoutConfig {
                per_room_concurrency: 32,
                retry_max: 3,
                drain_deadline_secs: 30,
            },
        }
    }

    #[test]
    fn store_type_follows_url_scheme() {
        let mut config = base_config();
        assert_eq!(config.store.store_type(), StoreType::Sqlite);
        assert_eq!(config.store.sqlite_path().as_deref(), Some("/tmp/relay.db"));

        config.store.url = "postgres://relay@localhost/relay".to_string();
        assert_eq!(config.store.store_type(), StoreType::Postgres);
        assert!(config.store.sqlite_path().is_none());
    }

    #[test]
    fn validate_rejects_short_secret() {
        let mut config = base_config();
        config.security.secret_key = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_base_config() {
        assert!(base_config().validate().is_ok());
    }
}
