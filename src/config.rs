use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, VaultError};
use crate::key_manager::{MasterKey, MASTER_KEY_ENV};

/// Service configuration
#[derive(Clone)]
pub struct Config {
    pub master_key: MasterKey,

    /// PostgreSQL connection URL
    pub database_url: String,

    /// Deadline for a single database round trip
    pub sql_timeout: Duration,

    /// How long before expiry a credential counts as expiring soon
    pub lead_window: Duration,

    /// Interval between credential check passes
    pub check_interval: Duration,

    /// Max random delay between owners within a pass (zero disables)
    pub check_max_jitter: Duration,
}

// Custom Debug implementation to prevent secret leakage
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("master_key", &"[REDACTED]")
            .field("database_url", &"[REDACTED]")
            .field("sql_timeout", &self.sql_timeout)
            .field("lead_window", &self.lead_window)
            .field("check_interval", &self.check_interval)
            .field("check_max_jitter", &self.check_max_jitter)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a variable if set
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // the key comes first: a missing key is reported as such, even if more is missing
        let master_key = lookup(MASTER_KEY_ENV)
            .ok_or_else(|| VaultError::KeyMisconfigured(format!("{} not set", MASTER_KEY_ENV)))
            .and_then(|encoded| MasterKey::from_base64(&encoded))?;

        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| VaultError::Config("DATABASE_URL not set".into()))?;

        let sql_timeout = Duration::from_millis(parse_or(&lookup, "SQL_TIMEOUT_MS", 1000)?);
        if sql_timeout.is_zero() {
            return Err(VaultError::Config("SQL_TIMEOUT_MS must be positive".into()));
        }

        let lead_window = Duration::from_secs(parse_or(&lookup, "CREDENTIAL_LEAD_WINDOW_SECS", 21_600)?);

        let check_interval =
            Duration::from_secs(parse_or(&lookup, "CREDENTIAL_CHECK_INTERVAL_SECS", 300)?);
        if check_interval.is_zero() {
            return Err(VaultError::Config(
                "CREDENTIAL_CHECK_INTERVAL_SECS must be positive".into(),
            ));
        }

        let check_max_jitter =
            Duration::from_millis(parse_or(&lookup, "CREDENTIAL_CHECK_MAX_JITTER_MS", 0)?);

        Ok(Self {
            master_key,
            database_url,
            sql_timeout,
            lead_window,
            check_interval,
            check_max_jitter,
        })
    }

    /// Lead window as a calendar duration for the credential lifecycle
    pub fn lead_window(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.lead_window)
            .map_err(|e| VaultError::Config(format!("lead window out of range: {}", e)))
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| VaultError::Config(format!("invalid {}: {}", name, e))),
        None => Ok(default),
    }
}
