use std::time::Duration;

use crate::adapters::fusion_solar::{self, FusionSolarCredentials};
use crate::adapters::solis_cloud::{self, SolisCredentials};
use crate::adapters::vendor_client::{
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_RETRIES, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_RETRY_BACKOFF_MS, FetchSettings, RetryPolicy,
};
use crate::app::AppError;
use crate::domain::reconciliation::{DEFAULT_CREDIT_TOLERANCE_KWH, ReconcileSettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorSource {
    Live,
    Replay { script_path: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_bind: String,
    pub directory_db_path: String,
    pub vendor_source: VendorSource,
    pub fusion_solar: Option<FusionSolarCredentials>,
    pub solis: Option<SolisCredentials>,
    pub fetch: FetchSettings,
    pub station_cache_ttl: Duration,
    pub reconcile: ReconcileSettings,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vendor_source = match non_empty(&lookup, "VENDOR_SOURCE")
            .unwrap_or_else(|| "live".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "live" => VendorSource::Live,
            "replay" => VendorSource::Replay {
                script_path: non_empty(&lookup, "REPLAY_SCRIPT_PATH").ok_or_else(|| {
                    AppError::config("REPLAY_SCRIPT_PATH is required when VENDOR_SOURCE=replay")
                })?,
            },
            other => {
                return Err(AppError::config(format!(
                    "VENDOR_SOURCE must be live or replay, got {other}"
                )));
            }
        };

        let fusion_solar = credential_pair(&lookup, "FUSIONSOLAR_USER", "FUSIONSOLAR_SYSTEM_CODE")?
            .map(|(user_name, system_code)| -> Result<_, AppError> {
                Ok(FusionSolarCredentials {
                    base_url: non_empty(&lookup, "FUSIONSOLAR_BASE_URL")
                        .unwrap_or_else(|| fusion_solar::DEFAULT_BASE_URL.to_string()),
                    user_name,
                    system_code,
                    utc_offset_minutes: parse_or_default(
                        &lookup,
                        "FUSIONSOLAR_UTC_OFFSET_MINUTES",
                        0_i32,
                    )?,
                })
            })
            .transpose()?;

        let solis = credential_pair(&lookup, "SOLIS_KEY_ID", "SOLIS_KEY_SECRET")?.map(
            |(key_id, key_secret)| SolisCredentials {
                base_url: non_empty(&lookup, "SOLIS_BASE_URL")
                    .unwrap_or_else(|| solis_cloud::DEFAULT_BASE_URL.to_string()),
                key_id,
                key_secret,
            },
        );

        let max_in_flight = parse_or_default(&lookup, "VENDOR_MAX_IN_FLIGHT", DEFAULT_MAX_IN_FLIGHT)?;
        if max_in_flight == 0 {
            return Err(AppError::config("VENDOR_MAX_IN_FLIGHT must be at least 1"));
        }

        let fetch = FetchSettings {
            max_in_flight,
            request_timeout: Duration::from_millis(parse_or_default(
                &lookup,
                "VENDOR_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )?),
            retry: RetryPolicy {
                max_retries: parse_or_default(&lookup, "VENDOR_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
                backoff_base: Duration::from_millis(parse_or_default(
                    &lookup,
                    "VENDOR_RETRY_BACKOFF_MS",
                    DEFAULT_RETRY_BACKOFF_MS,
                )?),
            },
        };

        Ok(Self {
            http_bind: non_empty(&lookup, "HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            directory_db_path: non_empty(&lookup, "DIRECTORY_DB_PATH")
                .unwrap_or_else(|| "/var/lib/solar-audit/directory.db".to_string()),
            vendor_source,
            fusion_solar,
            solis,
            fetch,
            station_cache_ttl: Duration::from_secs(parse_or_default(
                &lookup,
                "STATION_CACHE_TTL_SECS",
                600_u64,
            )?),
            reconcile: ReconcileSettings {
                fallback_tariff: parse_or_default(&lookup, "FALLBACK_TARIFF", 0.0_f64)?,
                credit_tolerance_kwh: parse_or_default(
                    &lookup,
                    "CREDIT_TOLERANCE_KWH",
                    DEFAULT_CREDIT_TOLERANCE_KWH,
                )?,
            },
        })
    }
}

/// Input of the one-shot audit job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub customer_key: String,
    pub invoice_path: String,
    pub period_start: Option<String>,
    pub period_end: Option<String>,
}

impl JobConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            customer_key: non_empty(&lookup, "AUDIT_CUSTOMER_KEY")
                .ok_or_else(|| AppError::config("AUDIT_CUSTOMER_KEY is required"))?,
            invoice_path: non_empty(&lookup, "AUDIT_INVOICE_PATH")
                .ok_or_else(|| AppError::config("AUDIT_INVOICE_PATH is required"))?,
            period_start: non_empty(&lookup, "AUDIT_PERIOD_START"),
            period_end: non_empty(&lookup, "AUDIT_PERIOD_END"),
        })
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Both values or neither.
fn credential_pair<F>(lookup: &F, first: &str, second: &str) -> Result<Option<(String, String)>, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match (non_empty(lookup, first), non_empty(lookup, second)) {
        (Some(a), Some(b)) => Ok(Some((a, b))),
        (None, None) => Ok(None),
        _ => Err(AppError::config(format!(
            "{first} and {second} must be set together"
        ))),
    }
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{AppConfig, JobConfig, VendorSource};

    #[test]
    fn applies_defaults_for_optional_fields() {
        let config = AppConfig::from_lookup(|_| None).expect("config should be valid");

        assert_eq!(config.http_bind, "0.0.0.0:8080");
        assert_eq!(config.directory_db_path, "/var/lib/solar-audit/directory.db");
        assert_eq!(config.vendor_source, VendorSource::Live);
        assert!(config.fusion_solar.is_none());
        assert!(config.solis.is_none());
        assert_eq!(config.fetch.max_in_flight, 4);
        assert_eq!(config.fetch.request_timeout, Duration::from_millis(15_000));
        assert_eq!(config.fetch.retry.max_retries, 2);
        assert_eq!(config.station_cache_ttl, Duration::from_secs(600));
        assert_eq!(config.reconcile.credit_tolerance_kwh, 5.0);
        assert_eq!(config.reconcile.fallback_tariff, 0.0);
    }

    #[test]
    fn registers_vendors_with_complete_credentials() {
        let config = AppConfig::from_lookup(|key| match key {
            "FUSIONSOLAR_USER" => Some("api-user".to_string()),
            "FUSIONSOLAR_SYSTEM_CODE" => Some("secret".to_string()),
            "FUSIONSOLAR_UTC_OFFSET_MINUTES" => Some("-180".to_string()),
            "SOLIS_KEY_ID" => Some("1300386381676".to_string()),
            "SOLIS_KEY_SECRET" => Some("key-secret".to_string()),
            "SOLIS_BASE_URL" => Some("http://localhost:9000".to_string()),
            _ => None,
        })
        .expect("config should be valid");

        let fusion = config.fusion_solar.expect("fusion solar configured");
        assert_eq!(fusion.base_url, "https://la5.fusionsolar.huawei.com/thirdData");
        assert_eq!(fusion.utc_offset_minutes, -180);
        assert_eq!(config.solis.expect("solis configured").base_url, "http://localhost:9000");
    }

    #[test]
    fn rejects_half_configured_credentials() {
        let result = AppConfig::from_lookup(|key| match key {
            "SOLIS_KEY_ID" => Some("1300386381676".to_string()),
            _ => None,
        });

        assert_eq!(
            result.expect_err("half credentials must fail").to_string(),
            "invalid configuration: SOLIS_KEY_ID and SOLIS_KEY_SECRET must be set together"
        );
    }

    #[test]
    fn replay_source_requires_script_path() {
        let missing = AppConfig::from_lookup(|key| match key {
            "VENDOR_SOURCE" => Some("replay".to_string()),
            _ => None,
        });
        assert!(missing.is_err());

        let config = AppConfig::from_lookup(|key| match key {
            "VENDOR_SOURCE" => Some("Replay".to_string()),
            "REPLAY_SCRIPT_PATH" => Some("testdata/replay/no_records.json".to_string()),
            _ => None,
        })
        .expect("config should be valid");
        assert_eq!(
            config.vendor_source,
            VendorSource::Replay {
                script_path: "testdata/replay/no_records.json".to_string()
            }
        );
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let result = AppConfig::from_lookup(|key| match key {
            "VENDOR_TIMEOUT_MS" => Some("abc".to_string()),
            _ => None,
        });

        assert_eq!(
            result.expect_err("invalid number must fail").to_string(),
            "invalid configuration: VENDOR_TIMEOUT_MS must be a valid number"
        );
    }

    #[test]
    fn rejects_zero_in_flight_cap() {
        let result = AppConfig::from_lookup(|key| match key {
            "VENDOR_MAX_IN_FLIGHT" => Some("0".to_string()),
            _ => None,
        });

        assert!(result.is_err());
    }

    #[test]
    fn job_requires_customer_and_invoice() {
        let result = JobConfig::from_lookup(|key| match key {
            "AUDIT_CUSTOMER_KEY" => Some("Casa Silva".to_string()),
            _ => None,
        });
        assert_eq!(
            result.expect_err("missing invoice must fail").to_string(),
            "invalid configuration: AUDIT_INVOICE_PATH is required"
        );

        let job = JobConfig::from_lookup(|key| match key {
            "AUDIT_CUSTOMER_KEY" => Some("Casa Silva".to_string()),
            "AUDIT_INVOICE_PATH" => Some("invoice.json".to_string()),
            "AUDIT_PERIOD_START" => Some("2024-04-10".to_string()),
            _ => None,
        })
        .expect("job config should be valid");
        assert_eq!(job.period_start.as_deref(), Some("2024-04-10"));
        assert_eq!(job.period_end, None);
    }
}
