use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::ControlledSubstancePolicy;

/// Application-level constants
pub const APP_NAME: &str = "erx-pipeline";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "ERX_PIPELINE_";

pub const ROUTING_QUEUE: &str = "erx-routing";
pub const STATUS_QUEUE: &str = "erx-status";

/// Get the application data directory
pub fn app_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

pub fn default_database_path() -> PathBuf {
    app_data_dir().join("erx.db")
}

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "warn,erx_pipeline=info"
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Runtime settings for the worker fleet.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    pub gateway_base_url: String,
    pub gateway_api_key: Option<String>,
    /// Bound on every gateway call.
    pub gateway_timeout: Duration,
    /// Concurrent gateway calls allowed from this instance.
    pub gateway_concurrency: usize,
    /// How long a received message stays hidden. Must outlast a whole batch
    /// of gateway calls, or a redelivered copy is handled concurrently.
    pub visibility_timeout: Duration,
    pub receive_batch_size: usize,
    /// Pause after an empty receive.
    pub empty_queue_wait: Duration,
    /// Delay before the first re-poll of a pending prescription; doubles per
    /// attempt up to the ceiling.
    pub status_backoff_base: Duration,
    pub status_backoff_ceiling: Duration,
    /// Stop polling after this many attempts. None polls until terminal.
    pub max_status_attempts: Option<u32>,
    pub refill_poll_interval: Duration,
    pub transmission_error_poll_interval: Duration,
    pub sweeper_interval: Duration,
    /// A pending owner with no status check enqueued for this long is
    /// re-enqueued by the sweeper.
    pub sweeper_stale_after: Duration,
    pub lease_ttl: Duration,
    pub controlled_substance_policy: ControlledSubstancePolicy,
    /// Source tag for pharmacy ids issued by the gateway's directory.
    pub pharmacy_source: String,
    /// Identifies this process as a lease holder.
    pub instance_id: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            gateway_base_url: "http://localhost:8700/api/v1".into(),
            gateway_api_key: None,
            gateway_timeout: Duration::from_secs(30),
            gateway_concurrency: 4,
            visibility_timeout: Duration::from_secs(6 * 60),
            receive_batch_size: 10,
            empty_queue_wait: Duration::from_secs(30),
            status_backoff_base: Duration::from_secs(30),
            status_backoff_ceiling: Duration::from_secs(15 * 60),
            max_status_attempts: None,
            refill_poll_interval: Duration::from_secs(30),
            transmission_error_poll_interval: Duration::from_secs(2 * 60 * 60),
            sweeper_interval: Duration::from_secs(10 * 60),
            sweeper_stale_after: Duration::from_secs(30 * 60),
            lease_ttl: Duration::from_secs(5 * 60),
            controlled_substance_policy: ControlledSubstancePolicy::default(),
            pharmacy_source: "surescripts".into(),
            instance_id: default_instance_id(),
        }
    }
}

fn default_instance_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{APP_NAME}-{}-{}", std::process::id(), &suffix[..8])
}

impl PipelineConfig {
    /// Defaults overridden by `ERX_PIPELINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `ERX_PIPELINE_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(v) = get("DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("GATEWAY_URL") {
            config.gateway_base_url = v;
        }
        if let Some(v) = get("GATEWAY_API_KEY") {
            config.gateway_api_key = Some(v);
        }
        if let Some(v) = get("PHARMACY_SOURCE") {
            config.pharmacy_source = v;
        }
        if let Some(v) = get("INSTANCE_ID") {
            config.instance_id = v;
        }
        if let Some(v) = get("CONTROLLED_SUBSTANCE_POLICY") {
            config.controlled_substance_policy = ControlledSubstancePolicy::from_str(&v)
                .map_err(|e| invalid("CONTROLLED_SUBSTANCE_POLICY", &v, e))?;
        }

        let secs = |name: &str, slot: &mut Duration| -> Result<(), ConfigError> {
            if let Some(v) = get(name) {
                *slot = Duration::from_secs(parse_number(name, &v)?);
            }
            Ok(())
        };
        secs("GATEWAY_TIMEOUT_SECS", &mut config.gateway_timeout)?;
        secs("VISIBILITY_TIMEOUT_SECS", &mut config.visibility_timeout)?;
        secs("EMPTY_QUEUE_WAIT_SECS", &mut config.empty_queue_wait)?;
        secs("STATUS_BACKOFF_BASE_SECS", &mut config.status_backoff_base)?;
        secs("STATUS_BACKOFF_CEILING_SECS", &mut config.status_backoff_ceiling)?;
        secs("REFILL_POLL_SECS", &mut config.refill_poll_interval)?;
        secs("TRANSMISSION_ERROR_POLL_SECS", &mut config.transmission_error_poll_interval)?;
        secs("SWEEPER_INTERVAL_SECS", &mut config.sweeper_interval)?;
        secs("SWEEPER_STALE_AFTER_SECS", &mut config.sweeper_stale_after)?;
        secs("LEASE_TTL_SECS", &mut config.lease_ttl)?;

        if let Some(v) = get("GATEWAY_CONCURRENCY") {
            config.gateway_concurrency = parse_number("GATEWAY_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("RECEIVE_BATCH_SIZE") {
            config.receive_batch_size = parse_number("RECEIVE_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("MAX_STATUS_ATTEMPTS") {
            config.max_status_attempts = Some(parse_number("MAX_STATUS_ATTEMPTS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway_base_url.trim().is_empty() {
            return Err(ConfigError::Inconsistent("gateway URL is empty".into()));
        }
        let batch_budget = self
            .gateway_timeout
            .saturating_mul(u32::try_from(self.receive_batch_size).unwrap_or(u32::MAX));
        if self.visibility_timeout <= batch_budget {
            return Err(ConfigError::Inconsistent(format!(
                "visibility timeout ({}s) must exceed {} messages x gateway timeout ({}s)",
                self.visibility_timeout.as_secs(),
                self.receive_batch_size,
                self.gateway_timeout.as_secs()
            )));
        }
        if self.status_backoff_ceiling < self.status_backoff_base {
            return Err(ConfigError::Inconsistent(
                "status backoff ceiling is below the base delay".into(),
            ));
        }
        if self.sweeper_stale_after <= self.status_backoff_ceiling + self.visibility_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "sweeper staleness ({}s) must exceed backoff ceiling plus visibility timeout",
                self.sweeper_stale_after.as_secs()
            )));
        }
        if self.gateway_concurrency == 0 || self.receive_batch_size == 0 {
            return Err(ConfigError::Inconsistent(
                "gateway concurrency and receive batch size must be positive".into(),
            ));
        }
        if self.max_status_attempts == Some(0) {
            return Err(ConfigError::Inconsistent(
                "max status attempts must be positive when set".into(),
            ));
        }
        if self.lease_ttl.is_zero() {
            return Err(ConfigError::Inconsistent("lease TTL must be positive".into()));
        }
        Ok(())
    }

    /// Delay before status-check attempt `attempt` (1-based): base doubled
    /// per prior attempt, capped at the ceiling.
    pub fn status_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.status_backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.status_backoff_ceiling)
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| invalid(name, value, e))
}

fn invalid(name: &str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
