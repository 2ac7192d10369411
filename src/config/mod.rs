use std::{env, error::Error, time::Duration};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";
const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis_url: String,
    pub bind_addr: String,
    /// Prefix for the public capture address handed out to clients.
    pub base_url: String,
    /// Skip the Redis attempt entirely and run on the in-memory backend.
    pub force_memory: bool,
    pub connect_timeout: Duration,
    pub reaper_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error + Send + Sync>> {
        let redis_url = env_or("REDIS_URL", DEFAULT_REDIS_URL);
        let bind_addr = env_or("BIND_ADDR", DEFAULT_BIND_ADDR);
        let base_url = match env::var("BASE_URL") {
            Ok(raw) => raw.trim_end_matches('/').to_owned(),
            Err(env::VarError::NotPresent) => format!("http://{bind_addr}"),
            Err(err) => return Err(Box::new(err)),
        };
        let force_memory = match env::var("TRAP_IN_MEMORY") {
            Ok(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
            Err(env::VarError::NotPresent) => false,
            Err(err) => return Err(Box::new(err)),
        };
        let connect_timeout = match env::var("REDIS_CONNECT_TIMEOUT_MS") {
            Ok(raw) => Duration::from_millis(raw.parse::<u64>()?),
            Err(env::VarError::NotPresent) => Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            Err(err) => return Err(Box::new(err)),
        };
        let reaper_interval = match env::var("REAPER_INTERVAL_SECS") {
            Ok(raw) => Duration::from_secs(raw.parse::<u64>()?),
            Err(env::VarError::NotPresent) => Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            Err(err) => return Err(Box::new(err)),
        };

        Ok(Self {
            redis_url,
            bind_addr,
            base_url,
            force_memory,
            connect_timeout,
            reaper_interval,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}
