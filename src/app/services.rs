use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::adapters::directory_db::{self, CustomerRecord, DbError};
use crate::adapters::vendor_client::{VendorClientFactory, VendorError};
use crate::app::station_cache::StationCache;
use crate::domain::models::{
    AuditNote, AuditReport, Confidence, IntegritySeal, InvoiceFacts, StationRef, StationSummary,
};
use crate::domain::reconciliation::{ReconcileSettings, ReconciliationWarning, reconcile};
use crate::domain::series_normalizer::normalize_with_diagnostics;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("customer {0} is not linked to any station")]
    NotFound(String),
    #[error("customer {0} is already linked to a station")]
    AlreadyLinked(String),
    #[error("invalid link: {0}")]
    InvalidLink(String),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("directory operation failed: {0}")]
    Database(#[from] DbError),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("customer {0} is not linked to any station")]
    CustomerNotLinked(String),
    #[error("invalid audit period: {start} is after {end}")]
    InvalidPeriod { start: NaiveDate, end: NaiveDate },
    #[error("vendor access failed: {0}")]
    Vendor(VendorError),
    #[error("directory lookup failed: {0}")]
    Directory(DirectoryError),
}

/// Account holder name as printed on the invoice, reduced to a lookup key.
pub fn normalize_customer_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

pub trait DirectoryGateway: Send + Sync {
    fn resolve(&self, customer_key: &str) -> Result<StationRef, DirectoryError>;
    fn register(
        &self,
        customer_key: &str,
        station: &StationRef,
    ) -> Result<CustomerRecord, DirectoryError>;
}

#[derive(Clone)]
pub struct SqliteDirectory {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteDirectory {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, DirectoryError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| DirectoryError::LockPoisoned)?;
        op(&connection).map_err(DirectoryError::from)
    }
}

impl DirectoryGateway for SqliteDirectory {
    fn resolve(&self, customer_key: &str) -> Result<StationRef, DirectoryError> {
        let key = normalize_customer_key(customer_key);
        self.with_connection(|connection| directory_db::find_customer(connection, &key))?
            .map(|record| record.station)
            .ok_or(DirectoryError::NotFound(key))
    }

    fn register(
        &self,
        customer_key: &str,
        station: &StationRef,
    ) -> Result<CustomerRecord, DirectoryError> {
        let key = normalize_customer_key(customer_key);
        if key.is_empty() {
            return Err(DirectoryError::InvalidLink("customer key is empty".to_string()));
        }
        if station.external_id.trim().is_empty() {
            return Err(DirectoryError::InvalidLink("station id is empty".to_string()));
        }
        if station.device_ids.iter().any(|device| device.trim().is_empty()) {
            return Err(DirectoryError::InvalidLink("device ids must not be empty".to_string()));
        }

        let record = CustomerRecord {
            customer_key: key.clone(),
            station: StationRef {
                vendor: station.vendor,
                external_id: station.external_id.trim().to_string(),
                device_ids: station
                    .device_ids
                    .iter()
                    .map(|device| device.trim().to_string())
                    .collect(),
            },
            linked_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let inserted = self.with_connection(|connection| directory_db::insert_customer(connection, &record))?;
        if !inserted {
            return Err(DirectoryError::AlreadyLinked(key));
        }

        tracing::info!(
            customer_key = %record.customer_key,
            vendor = %record.station.vendor,
            station = %record.station.external_id,
            devices = record.station.device_ids.len(),
            "customer linked to station"
        );
        Ok(record)
    }
}

/// Runs audits end to end: directory lookup, vendor fetch, normalization and
/// reconciliation. Also serves the station catalogue used for linking.
pub struct AuditService {
    directory: Arc<dyn DirectoryGateway>,
    vendors: Arc<dyn VendorClientFactory>,
    reconcile: ReconcileSettings,
    stations: StationCache,
}

impl AuditService {
    pub fn new(
        directory: Arc<dyn DirectoryGateway>,
        vendors: Arc<dyn VendorClientFactory>,
        reconcile: ReconcileSettings,
        stations: StationCache,
    ) -> Self {
        Self {
            directory,
            vendors,
            reconcile,
            stations,
        }
    }

    pub async fn audit(
        &self,
        customer_key: &str,
        start: NaiveDate,
        end: NaiveDate,
        invoice: &InvoiceFacts,
    ) -> Result<AuditReport, AuditError> {
        if start > end {
            return Err(AuditError::InvalidPeriod { start, end });
        }

        let audit_id = Uuid::new_v4();
        let customer_key = normalize_customer_key(customer_key);
        let span = tracing::info_span!("audit", %audit_id, customer_key = %customer_key);

        self.run_audit(audit_id, customer_key, start, end, invoice)
            .instrument(span)
            .await
    }

    async fn run_audit(
        &self,
        audit_id: Uuid,
        customer_key: String,
        start: NaiveDate,
        end: NaiveDate,
        invoice: &InvoiceFacts,
    ) -> Result<AuditReport, AuditError> {
        let station = match self.directory.resolve(&customer_key) {
            Ok(station) => station,
            Err(DirectoryError::NotFound(_)) => {
                return Err(AuditError::CustomerNotLinked(customer_key));
            }
            Err(error) => return Err(AuditError::Directory(error)),
        };

        tracing::info!(
            vendor = %station.vendor,
            station = %station.external_id,
            %start,
            %end,
            "audit started"
        );

        let client = self.vendors.create(station.vendor).map_err(AuditError::Vendor)?;
        let mut notes = Vec::new();

        let samples = match client.fetch_raw_series(&station, start, end).await {
            Ok(fetch) => {
                if !fetch.failed_buckets.is_empty() {
                    notes.push(AuditNote::BucketsFailed {
                        count: fetch.failed_buckets.len(),
                    });
                }
                fetch.samples
            }
            Err(error) if error.is_fatal() => {
                tracing::error!(error = %error, "audit aborted by vendor failure");
                return Err(AuditError::Vendor(error));
            }
            Err(error) => {
                tracing::warn!(error = %error, "no telemetry available, generation counts as zero");
                notes.push(AuditNote::NoTelemetry {
                    reason: error.to_string(),
                });
                Vec::new()
            }
        };

        let normalized = normalize_with_diagnostics(&samples, start, end);
        for device in &normalized.devices {
            if device.ambiguous {
                notes.push(AuditNote::ClassificationAmbiguous {
                    device_id: device.device_id.clone(),
                    field: device.field.clone(),
                });
            }
            if device.clamped_days > 0 {
                notes.push(AuditNote::NegativeDeltasClamped {
                    device_id: device.device_id.clone(),
                    days: device.clamped_days,
                });
            }
        }

        let reconciliation = reconcile(&normalized.series, invoice, &self.reconcile);
        let mut result = reconciliation.result;
        notes.extend(reconciliation.warnings.iter().map(|warning| match warning {
            ReconciliationWarning::SelfConsumptionClamped => AuditNote::SelfConsumptionClamped,
            ReconciliationWarning::CreditNotReported => AuditNote::CreditNotReported,
        }));

        if samples.is_empty() {
            result.integrity_seal = IntegritySeal::Warning;
        }

        let confidence = if notes.iter().any(AuditNote::lowers_confidence) {
            Confidence::Low
        } else {
            Confidence::High
        };
        let credit_message = result
            .delta_classification
            .zip(result.credited_kwh)
            .map(|(classification, credited)| classification.message(result.generated_kwh, credited));

        tracing::info!(
            generated_kwh = result.generated_kwh,
            savings_amount = result.savings_amount,
            seal = ?result.integrity_seal,
            confidence = ?confidence,
            notes = notes.len(),
            "audit completed"
        );

        Ok(AuditReport {
            audit_id,
            customer_key,
            station,
            period_start: start,
            period_end: end,
            reference_month: invoice.reference_month,
            series: normalized.series.to_points(),
            seal_message: result.integrity_seal.message().to_string(),
            credit_message,
            result,
            confidence,
            notes,
        })
    }

    pub fn resolve(&self, customer_key: &str) -> Result<StationRef, DirectoryError> {
        self.directory.resolve(customer_key)
    }

    pub fn register(
        &self,
        customer_key: &str,
        station: &StationRef,
    ) -> Result<CustomerRecord, DirectoryError> {
        self.directory.register(customer_key, station)
    }

    /// Stations of every registered vendor. A vendor that fails to list is
    /// skipped; the result is cached only when at least one vendor answered.
    pub async fn list_stations(&self) -> Vec<StationSummary> {
        if let Some(cached) = self.stations.get() {
            return cached;
        }

        let mut stations = Vec::new();
        let mut answered = false;

        for vendor in self.vendors.vendors() {
            let listed = match self.vendors.create(vendor) {
                Ok(client) => client.list_stations().await,
                Err(error) => Err(error),
            };
            match listed {
                Ok(mut found) => {
                    tracing::debug!(vendor = %vendor, stations = found.len(), "stations listed");
                    answered = true;
                    stations.append(&mut found);
                }
                Err(error) => {
                    tracing::warn!(vendor = %vendor, error = %error, "station listing failed, skipping vendor");
                }
            }
        }

        stations.sort_by(|left, right| left.display().cmp(&right.display()));
        if answered {
            self.stations.store(stations.clone());
        }
        stations
    }

    pub fn invalidate_stations(&self) {
        self.stations.invalidate();
        tracing::info!("station catalogue invalidated");
    }
}
