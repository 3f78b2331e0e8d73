use std::env;

use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub jwt_secret: String,
    pub wg_config_root: String,
    pub wg_command_timeout_secs: u64,
    pub default_dns: String,
    pub default_endpoint: String,
    pub base_listen_port: i32,
    pub default_keepalive: i32,
    pub default_mtu: i32,
    pub stats_interval_secs: i64,
    pub history_retention_days: i64,
    pub admin_username: String,
    pub admin_password: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    MissingEnvVar { var: &'static str },

    #[error("environment variable {var} is not a valid number")]
    InvalidNumber { var: &'static str },
}

fn require_env(var: &'static str) -> Result<String, ConfigError> {
    env::var(var).map_err(|_| ConfigError::MissingEnvVar { var })
}

fn env_or(var: &'static str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_num<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            bind_addr: env_or("BIND_ADDR", "127.0.0.1:8080"),
            jwt_secret: require_env("JWT_SECRET")?,
            wg_config_root: env_or("WG_CONFIG_ROOT", "/etc/wireguard"),
            wg_command_timeout_secs: env_num("WG_COMMAND_TIMEOUT_SECS", 10)?,
            default_dns: env_or("WG_DEFAULT_DNS", "1.1.1.1, 8.8.8.8"),
            default_endpoint: env_or("WG_DEFAULT_ENDPOINT", ""),
            base_listen_port: env_num("WG_BASE_PORT", 51820)?,
            default_keepalive: env_num("WG_DEFAULT_KEEPALIVE", 25)?,
            default_mtu: env_num("WG_DEFAULT_MTU", 1420)?,
            stats_interval_secs: env_num("STATS_INTERVAL_SECS", 300)?,
            history_retention_days: env_num("HISTORY_RETENTION_DAYS", 30)?,
            admin_username: env_or("ADMIN_USERNAME", "admin"),
            admin_password: env::var("ADMIN_PASSWORD").ok(),
        })
    }
}
