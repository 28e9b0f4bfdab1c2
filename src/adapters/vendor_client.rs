use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use thiserror::Error;

use crate::adapters::fusion_solar::{FusionSolarClient, FusionSolarCredentials};
use crate::adapters::solis_cloud::{SolisCloudClient, SolisCredentials};
use crate::domain::models::{RawSample, StationRef, StationSummary, Vendor};
use crate::domain::period::{Coverage, MonthBucket, fetch_start, month_buckets};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VendorError {
    #[error("vendor configuration invalid: {0}")]
    Configuration(String),
    #[error("vendor rejected the session: {0}")]
    Authentication(String),
    #[error("transient vendor failure: {0}")]
    Transient(String),
    #[error("vendor data unavailable: {0}")]
    DataUnavailable(String),
}

impl VendorError {
    /// Fatal errors abort the whole audit; everything else degrades to a
    /// zero contribution.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VendorError::Configuration(_) | VendorError::Authentication(_)
        )
    }
}

impl From<reqwest::Error> for VendorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            VendorError::DataUnavailable(format!("malformed vendor payload: {error}"))
        } else if error.is_builder() {
            VendorError::Configuration(format!("invalid vendor request: {error}"))
        } else if let Some(status) = error.status() {
            status_error(status, &error.to_string())
        } else {
            VendorError::Transient(error.to_string())
        }
    }
}

pub fn status_error(status: StatusCode, context: &str) -> VendorError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            VendorError::Authentication(format!("{context}: HTTP {status}"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            VendorError::Transient(format!("{context}: HTTP {status}"))
        }
        status if status.is_server_error() => {
            VendorError::Transient(format!("{context}: HTTP {status}"))
        }
        status => VendorError::DataUnavailable(format!("{context}: HTTP {status}")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2_u32.saturating_pow(retry))
    }

    /// Runs `attempt` until it succeeds, fails with a non-transient error, or
    /// the retry budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, VendorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VendorError>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(VendorError::Transient(reason)) if retries < self.max_retries => {
                    let delay = self.delay_for(retries);
                    tracing::debug!(
                        operation,
                        retry = retries + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %reason,
                        "retrying transient vendor failure"
                    );
                    actix_web::rt::time::sleep(delay).await;
                    retries += 1;
                }
                other => return other,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchSettings {
    pub max_in_flight: usize,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            retry: RetryPolicy::default(),
        }
    }
}

/// Tries each strategy in order until one yields records. Fatal errors stop
/// the chain; transient ones move on to the next strategy and are reported
/// only if nothing else answered.
pub async fn try_in_order<S, T, F, Fut>(strategies: &[S], mut attempt: F) -> Result<Option<T>, VendorError>
where
    S: Copy,
    F: FnMut(S) -> Fut,
    Fut: Future<Output = Result<Option<T>, VendorError>>,
{
    let mut last_error = None;

    for strategy in strategies {
        match attempt(*strategy).await {
            Ok(Some(value)) => return Ok(Some(value)),
            Ok(None) => {}
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => last_error = Some(error),
        }
    }

    match last_error {
        Some(error) => Err(error),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketFailure {
    pub device_id: String,
    pub month: MonthBucket,
    pub error: VendorError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawFetch {
    pub samples: Vec<RawSample>,
    pub buckets_total: usize,
    pub failed_buckets: Vec<BucketFailure>,
}

#[async_trait]
pub trait VendorClient: Send + Sync {
    fn vendor(&self) -> Vendor;

    fn fetch_settings(&self) -> &FetchSettings;

    async fn authenticate(&self) -> Result<(), VendorError>;

    /// Samples of one device for one month. `coverage` tells whether the
    /// audited period spans the whole month, which decides if month-level
    /// totals may stand in for daily values.
    async fn fetch_bucket(
        &self,
        station: &StationRef,
        device_id: &str,
        month: MonthBucket,
        coverage: Coverage,
    ) -> Result<Vec<RawSample>, VendorError>;

    async fn list_stations(&self) -> Result<Vec<StationSummary>, VendorError>;

    async fn fetch_raw_series(
        &self,
        station: &StationRef,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<RawFetch, VendorError> {
        fetch_month_buckets(self, station, start, end).await
    }
}

/// Fans out one request per (device, month) bucket covering the range plus
/// the margin day, bounded by the client's in-flight cap. A failing bucket
/// contributes nothing; only fatal errors abort the fetch.
pub async fn fetch_month_buckets<C>(
    client: &C,
    station: &StationRef,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<RawFetch, VendorError>
where
    C: VendorClient + ?Sized,
{
    if station.vendor != client.vendor() {
        return Err(VendorError::Configuration(format!(
            "station {} belongs to {}, not {}",
            station.external_id,
            station.vendor,
            client.vendor()
        )));
    }

    client.authenticate().await?;

    let months = month_buckets(fetch_start(start), end);
    let jobs: Vec<(String, MonthBucket)> = station
        .devices()
        .into_iter()
        .flat_map(|device_id| {
            months
                .iter()
                .map(move |month| (device_id.clone(), *month))
        })
        .collect();
    let buckets_total = jobs.len();
    let max_in_flight = client.fetch_settings().max_in_flight.max(1);

    let outcomes: Vec<(String, MonthBucket, Result<Vec<RawSample>, VendorError>)> =
        stream::iter(jobs)
            .map(|(device_id, month)| async move {
                let coverage = month.coverage(start, end);
                let result = client
                    .fetch_bucket(station, &device_id, month, coverage)
                    .await;
                (device_id, month, result)
            })
            .buffer_unordered(max_in_flight)
            .collect()
            .await;

    let mut samples = Vec::new();
    let mut failed_buckets = Vec::new();

    for (device_id, month, result) in outcomes {
        match result {
            Ok(mut bucket) => samples.append(&mut bucket),
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => {
                tracing::warn!(
                    vendor = %client.vendor(),
                    station = %station.external_id,
                    device_id = %device_id,
                    month = %month,
                    error = %error,
                    "bucket fetch failed, counting it as zero"
                );
                failed_buckets.push(BucketFailure {
                    device_id,
                    month,
                    error,
                });
            }
        }
    }

    samples.sort_by(|left, right| {
        left.device_id
            .cmp(&right.device_id)
            .then_with(|| left.field_name.cmp(&right.field_name))
            .then_with(|| left.date.cmp(&right.date))
    });

    if samples.is_empty() {
        if buckets_total > 0 && failed_buckets.len() == buckets_total {
            let any_transient = failed_buckets
                .iter()
                .any(|failure| matches!(failure.error, VendorError::Transient(_)));
            return Err(if any_transient {
                VendorError::Transient(format!("all {buckets_total} buckets failed"))
            } else {
                VendorError::DataUnavailable(format!("all {buckets_total} buckets were unusable"))
            });
        }
        return Err(VendorError::DataUnavailable(format!(
            "no records for station {} between {start} and {end}",
            station.external_id
        )));
    }

    tracing::debug!(
        vendor = %client.vendor(),
        station = %station.external_id,
        samples = samples.len(),
        buckets_total,
        buckets_failed = failed_buckets.len(),
        "raw series fetched"
    );

    Ok(RawFetch {
        samples,
        buckets_total,
        failed_buckets,
    })
}

/// Builds a fresh client per audit run. No session outlives the run that
/// created it.
pub trait VendorClientFactory: Send + Sync {
    fn vendors(&self) -> Vec<Vendor>;

    fn create(&self, vendor: Vendor) -> Result<Box<dyn VendorClient>, VendorError>;
}

#[derive(Debug, Clone, Default)]
pub struct LiveVendorFactory {
    pub fusion_solar: Option<FusionSolarCredentials>,
    pub solis: Option<SolisCredentials>,
    pub settings: FetchSettings,
}

impl VendorClientFactory for LiveVendorFactory {
    fn vendors(&self) -> Vec<Vendor> {
        Vendor::ALL
            .into_iter()
            .filter(|vendor| match vendor {
                Vendor::FusionSolar => self.fusion_solar.is_some(),
                Vendor::SolisCloud => self.solis.is_some(),
            })
            .collect()
    }

    fn create(&self, vendor: Vendor) -> Result<Box<dyn VendorClient>, VendorError> {
        match vendor {
            Vendor::FusionSolar => {
                let credentials = self.fusion_solar.clone().ok_or_else(|| {
                    VendorError::Configuration("FusionSolar credentials are not configured".into())
                })?;
                Ok(Box::new(FusionSolarClient::new(credentials, self.settings)?))
            }
            Vendor::SolisCloud => {
                let credentials = self.solis.clone().ok_or_else(|| {
                    VendorError::Configuration("Solis credentials are not configured".into())
                })?;
                Ok(Box::new(SolisCloudClient::new(credentials, self.settings)?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::{LiveVendorFactory, RetryPolicy, VendorClientFactory, VendorError, status_error, try_in_order};
    use crate::domain::models::Vendor;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_millis(250),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
    }

    #[test]
    fn maps_http_statuses_to_error_kinds() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "kpi"),
            VendorError::Authentication(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "kpi"),
            VendorError::Transient(_)
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, "kpi"),
            VendorError::DataUnavailable(_)
        ));
    }

    #[actix_web::test]
    async fn retries_transient_failures_within_budget() {
        let attempts = Cell::new(0);

        let result = fast_policy(2)
            .run("test", || {
                attempts.set(attempts.get() + 1);
                let attempt = attempts.get();
                async move {
                    if attempt < 3 {
                        Err(VendorError::Transient("timeout".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
    }

    #[actix_web::test]
    async fn gives_up_after_retry_budget() {
        let attempts = Cell::new(0);

        let result: Result<(), VendorError> = fast_policy(1)
            .run("test", || {
                attempts.set(attempts.get() + 1);
                async { Err(VendorError::Transient("timeout".into())) }
            })
            .await;

        assert!(matches!(result, Err(VendorError::Transient(_))));
        assert_eq!(attempts.get(), 2);
    }

    #[actix_web::test]
    async fn does_not_retry_authentication_failures() {
        let attempts = Cell::new(0);

        let result: Result<(), VendorError> = fast_policy(3)
            .run("test", || {
                attempts.set(attempts.get() + 1);
                async { Err(VendorError::Authentication("expired".into())) }
            })
            .await;

        assert!(matches!(result, Err(VendorError::Authentication(_))));
        assert_eq!(attempts.get(), 1);
    }

    #[actix_web::test]
    async fn fallback_chain_uses_first_strategy_with_records() {
        let result = try_in_order(&["primary", "secondary", "tertiary"], |path| async move {
            match path {
                "primary" => Err(VendorError::Transient("502".into())),
                "secondary" => Ok(None),
                _ => Ok(Some(path)),
            }
        })
        .await;

        assert_eq!(result, Ok(Some("tertiary")));
    }

    #[actix_web::test]
    async fn fallback_chain_reports_last_error_when_exhausted() {
        let result: Result<Option<()>, VendorError> =
            try_in_order(&[1, 2], |_| async { Err(VendorError::Transient("down".into())) }).await;

        assert!(matches!(result, Err(VendorError::Transient(_))));

        let empty: Result<Option<()>, VendorError> =
            try_in_order(&[1, 2], |_| async { Ok(None) }).await;
        assert_eq!(empty, Ok(None));
    }

    #[actix_web::test]
    async fn fallback_chain_stops_on_fatal_error() {
        let calls = Cell::new(0);

        let result: Result<Option<()>, VendorError> = try_in_order(&[1, 2], |_| {
            calls.set(calls.get() + 1);
            async { Err(VendorError::Configuration("bad key".into())) }
        })
        .await;

        assert!(matches!(result, Err(VendorError::Configuration(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn live_factory_only_offers_configured_vendors() {
        let factory = LiveVendorFactory::default();

        assert!(factory.vendors().is_empty());
        assert!(matches!(
            factory.create(Vendor::SolisCloud),
            Err(VendorError::Configuration(_))
        ));
    }
}
