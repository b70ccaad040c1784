//! Env-var-driven configuration (spec.md §6, SPEC_FULL.md §4.12), with
//! `.env` support via `dotenvy`, matching the teacher's `config.rs` pattern
//! of a single `Config::from_env()` entry point with sensible defaults.

use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct DavisConfig {
    pub serial_port: String,
    pub baud_rate: u32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub loop_count: u16,
    pub wakeup_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub davis: DavisConfig,
    pub bus_buffer_size: usize,
    pub health_bind_addr: String,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .context("DATABASE_URL is required")?
            .trim()
            .to_string();
        let db_pool_size = env_parsed("DB_POOL_SIZE", 10u32);

        let davis = DavisConfig {
            serial_port: env::var("DAVIS_SERIAL_PORT").unwrap_or_else(|_| "SIMULATED".to_string()),
            baud_rate: env_parsed("DAVIS_BAUD_RATE", 19200u32),
            latitude: env_opt_parsed("DAVIS_LATITUDE"),
            longitude: env_opt_parsed("DAVIS_LONGITUDE"),
            altitude: env_opt_parsed("DAVIS_ALTITUDE"),
            loop_count: env_parsed("DAVIS_LOOP_COUNT", 200u16),
            wakeup_timeout_ms: env_parsed("DAVIS_WAKEUP_TIMEOUT_MS", 3000u64),
            reconnect_delay_ms: env_parsed("DAVIS_RECONNECT_DELAY_MS", 5000u64),
        };

        let bus_buffer_size = env_parsed("BUS_BUFFER_SIZE", 10_000usize);
        let health_bind_addr =
            env::var("HEALTH_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8090".to_string());

        Ok(Self {
            database_url,
            db_pool_size,
            davis,
            bus_buffer_size,
            health_bind_addr,
        })
    }
}

impl DavisConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "DAVIS_SERIAL_PORT",
            "DAVIS_BAUD_RATE",
            "DAVIS_LOOP_COUNT",
            "BUS_BUFFER_SIZE",
            "HEALTH_BIND_ADDR",
        ] {
            env::remove_var(key);
        }
        env::set_var("DATABASE_URL", "postgres://localhost/weather_test");
        let config = Config::from_env().unwrap();
        assert_eq!(config.davis.serial_port, "SIMULATED");
        assert_eq!(config.davis.baud_rate, 19200);
        assert_eq!(config.davis.loop_count, 200);
        assert_eq!(config.bus_buffer_size, 10_000);
        assert_eq!(config.health_bind_addr, "127.0.0.1:8090");
        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("DATABASE_URL");
        assert!(Config::from_env().is_err());
    }
}
