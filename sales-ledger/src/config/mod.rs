use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use secrecy::Secret;

use ledger_core::error::AppError;
use ledger_core::retry::RetryConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub database: DatabaseConfig,
    pub gate: GateConfig,
    pub retry: RetryConfig,
    pub aggregator: AggregatorConfig,
    pub service_name: String,
    pub log_level: String,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub db_name: String,
}

#[derive(Clone, Debug)]
pub struct GateConfig {
    /// How long a mutation may wait for the operation gate.
    pub max_wait: Duration,
}

#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// Window inside which unforced aggregate refreshes are skipped.
    pub debounce: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let db_url = env::var("LEDGER_DATABASE_URL")
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
        let db_name =
            env::var("LEDGER_DATABASE_NAME").unwrap_or_else(|_| "sales_ledger".to_string());

        let gate_max_wait = Duration::from_millis(env_u64("LEDGER_GATE_MAX_WAIT_MS", 1_000)?);
        let call_timeout = Duration::from_millis(env_u64("LEDGER_STORE_CALL_TIMEOUT_MS", 5_000)?);
        let max_retries = env_u64("LEDGER_STORE_MAX_RETRIES", 3)? as u32;
        let debounce = Duration::from_secs(env_u64("LEDGER_REFRESH_DEBOUNCE_SECS", 30)?);

        let log_level = env::var("LEDGER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            database: DatabaseConfig {
                url: Secret::new(db_url),
                db_name,
            },
            gate: GateConfig {
                max_wait: gate_max_wait,
            },
            retry: RetryConfig {
                max_retries,
                call_timeout,
                ..RetryConfig::default()
            },
            aggregator: AggregatorConfig { debounce },
            service_name: "sales-ledger".to_string(),
            log_level,
        })
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64, AppError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| AppError::Config(anyhow::anyhow!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}
