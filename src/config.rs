// ⚙️ Runtime configuration, read from the environment
//
// Every setting has a default so the server starts with no environment at
// all. Without QRZ_API_KEY the reconciler is not started; without
// ADMIN_PASSWORD every admin call is rejected; without LOGGER_API_KEY the
// logging script cannot clear callsigns.

use crate::api::StationConfig;
use crate::reconciler::{ConfirmationWindow, ReconcilerConfig};
use crate::registry::DEFAULT_CAPACITY;
use crate::verifier::qrz::{self, QrzConfig};
use anyhow::{anyhow, bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:5000";
pub const DEFAULT_DB_PATH: &str = "callsign_queue.db";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: SocketAddr,
    pub capacity: usize,
    pub db_path: PathBuf,
    pub admin_password: Option<String>,
    /// Key the external logging script presents to /api/clear_callsign
    pub logger_api_key: Option<String>,
    pub qrz_api_key: Option<String>,
    pub qrz_endpoint: String,
    pub verifier_timeout: Duration,
    pub verifier_max_attempts: u32,
    pub reconciler: ReconcilerConfig,
    pub station: StationConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind = parse_or(&get, "QUEUE_BIND", DEFAULT_BIND.parse::<SocketAddr>()?)?;

        let capacity: usize = parse_or(&get, "QUEUE_CAPACITY", DEFAULT_CAPACITY)?;
        if capacity == 0 {
            bail!("QUEUE_CAPACITY must be at least 1");
        }

        let defaults = ReconcilerConfig::default();
        let interval = secs_or(&get, "RECONCILE_INTERVAL_SECS", defaults.interval)?;
        let cycle_budget = secs_or(&get, "CYCLE_BUDGET_SECS", defaults.cycle_budget)?;
        let verifier_timeout =
            secs_or(&get, "VERIFIER_TIMEOUT_SECS", qrz::DEFAULT_REQUEST_TIMEOUT)?;

        let verifier_max_attempts: u32 =
            parse_or(&get, "VERIFIER_MAX_ATTEMPTS", qrz::DEFAULT_MAX_ATTEMPTS)?;
        if verifier_max_attempts == 0 {
            bail!("VERIFIER_MAX_ATTEMPTS must be at least 1");
        }

        let retries = QrzConfig {
            request_timeout: verifier_timeout,
            max_attempts: verifier_max_attempts,
            ..QrzConfig::new("")
        };
        if retries.worst_case_duration() > cycle_budget {
            bail!(
                "verifier retries can take {}s, more than CYCLE_BUDGET_SECS ({}s); \
                 lower VERIFIER_TIMEOUT_SECS or VERIFIER_MAX_ATTEMPTS",
                retries.worst_case_duration().as_secs(),
                cycle_budget.as_secs()
            );
        }

        let window = match get("CONFIRMATION_WINDOW") {
            Some(raw) => ConfirmationWindow::from_str(&raw)
                .map_err(|e| anyhow!(e))
                .context("invalid CONFIRMATION_WINDOW")?,
            None => defaults.window,
        };

        let station_defaults = StationConfig::default();
        let station = StationConfig {
            operator_name: get("OPERATOR_NAME").unwrap_or(station_defaults.operator_name),
            frequency: get("FREQUENCY").unwrap_or(station_defaults.frequency),
        };

        Ok(AppConfig {
            bind,
            capacity,
            db_path: get("QUEUE_DB_PATH")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string())
                .into(),
            admin_password: get("ADMIN_PASSWORD"),
            logger_api_key: get("LOGGER_API_KEY"),
            qrz_api_key: get("QRZ_API_KEY"),
            qrz_endpoint: get("QRZ_ENDPOINT").unwrap_or_else(|| qrz::DEFAULT_ENDPOINT.to_string()),
            verifier_timeout,
            verifier_max_attempts,
            reconciler: ReconcilerConfig {
                interval,
                cycle_budget,
                window,
                ..defaults
            },
            station,
        })
    }

    /// QRZ client settings, if an API key is configured
    pub fn qrz(&self) -> Option<QrzConfig> {
        let api_key = self.qrz_api_key.as_ref()?;
        let mut config = QrzConfig::new(api_key.clone());
        config.endpoint = self.qrz_endpoint.clone();
        config.request_timeout = self.verifier_timeout;
        config.max_attempts = self.verifier_max_attempts;
        Some(config)
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid {} value {:?}", key, raw)),
        None => Ok(default),
    }
}

fn secs_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let secs: u64 = parse_or(get, key, default.as_secs())?;
    if secs == 0 {
        bail!("{} must be at least 1 second", key);
    }
    Ok(Duration::from_secs(secs))
}
