//! Process configuration, loaded from environment variables with spec §6
//! defaults. Grounded in the teacher's `webhook::ConfirmationPolicy::from_env`
//! style (parse-with-fallback, no CLI framework since bootstrap is out of
//! scope).

use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    pub network: String,
    pub required_confirmations: u64,
    pub session_default_ttl_secs: i64,
    pub webhook_workers: usize,
    pub webhook_max_attempts: u32,
    pub rpc_url: Option<String>,
    pub rest_api_url: String,
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            network: env_or("NETWORK", "mainnet"),
            required_confirmations: env_parsed("REQUIRED_CONFIRMATIONS", 10),
            session_default_ttl_secs: env_parsed("SESSION_DEFAULT_TTL", 900),
            webhook_workers: env_parsed("WEBHOOK_WORKERS", 4),
            webhook_max_attempts: env_parsed("WEBHOOK_MAX_ATTEMPTS", 8),
            rpc_url: env::var("RPC_URL").ok(),
            rest_api_url: env_or("REST_API_URL", "http://localhost:16110"),
            data_dir: PathBuf::from(env_or("DATA_DIR", "./kasgate-data")),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parsed_falls_back_on_missing_or_bad_value() {
        assert_eq!(env_parsed::<u64>("KASGATE_TEST_UNSET_KEY", 10), 10);
    }
}
