use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::adapters::vendor_client::{
    FetchSettings, VendorClient, VendorClientFactory, VendorError,
};
use crate::domain::models::{RawSample, StationRef, StationSummary, Vendor};
use crate::domain::period::{Coverage, MonthBucket};

/// Recorded vendor behaviour: which stations exist and what each
/// (device, month) bucket answers, one event per request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayScript {
    #[serde(default)]
    login_error: Option<String>,
    #[serde(default)]
    stations: Vec<StationSummary>,
    #[serde(default)]
    buckets: Vec<ScriptedBucket>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptedBucket {
    device: String,
    month: String,
    events: Vec<ScriptEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptEvent {
    ok: Option<Vec<ScriptedSample>>,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptedSample {
    date: NaiveDate,
    field: String,
    value: f64,
}

impl ReplayScript {
    pub fn from_file(path: &str) -> Result<Self, VendorError> {
        let content = fs::read_to_string(path).map_err(|error| {
            VendorError::Configuration(format!("failed to read replay script {path}: {error}"))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, VendorError> {
        let script: ReplayScript = serde_json::from_str(content).map_err(|error| {
            VendorError::Configuration(format!("invalid replay script: {error}"))
        })?;

        for bucket in &script.buckets {
            if bucket.events.is_empty() {
                return Err(VendorError::Configuration(format!(
                    "replay bucket {}/{} must contain at least one event",
                    bucket.device, bucket.month
                )));
            }
        }

        Ok(script)
    }

    fn bucket(&self, device_id: &str, month: MonthBucket) -> Option<&ScriptedBucket> {
        let label = month.label();
        self.buckets
            .iter()
            .find(|bucket| bucket.device == device_id && bucket.month == label)
    }
}

/// Vendor client that answers from a [`ReplayScript`] instead of the network.
/// Each bucket walks through its events in order and keeps repeating the last.
#[derive(Debug)]
pub struct ReplayVendorClient {
    vendor: Vendor,
    script: Arc<ReplayScript>,
    settings: FetchSettings,
    cursors: Mutex<HashMap<(String, MonthBucket), usize>>,
}

impl ReplayVendorClient {
    pub fn new(vendor: Vendor, script: Arc<ReplayScript>, settings: FetchSettings) -> Self {
        Self {
            vendor,
            script,
            settings,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn next_event(&self, device_id: &str, month: MonthBucket) -> Result<Option<ScriptEvent>, VendorError> {
        let Some(bucket) = self.script.bucket(device_id, month) else {
            return Ok(None);
        };

        let mut cursors = self.cursors.lock().map_err(|_| {
            VendorError::Configuration("replay cursor lock poisoned".to_string())
        })?;
        let cursor = cursors.entry((device_id.to_string(), month)).or_insert(0);
        let index = (*cursor).min(bucket.events.len().saturating_sub(1));
        *cursor = cursor.saturating_add(1);

        Ok(bucket.events.get(index).cloned())
    }

    fn execute_event(
        event: ScriptEvent,
        device_id: &str,
    ) -> Result<Vec<RawSample>, VendorError> {
        match (event.ok, event.error) {
            (Some(samples), None) => Ok(samples
                .into_iter()
                .map(|sample| RawSample {
                    date: sample.date,
                    device_id: device_id.to_string(),
                    field_name: sample.field,
                    value: sample.value,
                })
                .collect()),
            (None, Some(error)) => Err(map_script_error(&error)),
            _ => Err(VendorError::Configuration(
                "script event must contain exactly one of: ok or error".to_string(),
            )),
        }
    }
}

fn map_script_error(kind: &str) -> VendorError {
    let normalized = kind.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "timeout" | "server_error" | "network_unreachable" | "rate_limited" => {
            VendorError::Transient(format!("scripted {normalized}"))
        }
        "unauthorized" | "session_expired" => {
            VendorError::Authentication(format!("scripted {normalized}"))
        }
        "bad_credentials" | "login_rejected" => {
            VendorError::Configuration(format!("scripted {normalized}"))
        }
        "malformed" | "invalid_json" => {
            VendorError::DataUnavailable(format!("scripted {normalized}"))
        }
        _ => VendorError::Configuration(format!("unknown scripted error kind: {kind}")),
    }
}

#[async_trait]
impl VendorClient for ReplayVendorClient {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    fn fetch_settings(&self) -> &FetchSettings {
        &self.settings
    }

    async fn authenticate(&self) -> Result<(), VendorError> {
        match &self.script.login_error {
            Some(kind) => Err(map_script_error(kind)),
            None => Ok(()),
        }
    }

    async fn fetch_bucket(
        &self,
        _station: &StationRef,
        device_id: &str,
        month: MonthBucket,
        _coverage: Coverage,
    ) -> Result<Vec<RawSample>, VendorError> {
        self.settings
            .retry
            .run("replay bucket", || async move {
                match self.next_event(device_id, month)? {
                    Some(event) => Self::execute_event(event, device_id),
                    None => Ok(Vec::new()),
                }
            })
            .await
    }

    async fn list_stations(&self) -> Result<Vec<StationSummary>, VendorError> {
        self.authenticate().await?;
        Ok(self
            .script
            .stations
            .iter()
            .filter(|station| station.vendor == self.vendor)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ReplayVendorFactory {
    script: Arc<ReplayScript>,
    settings: FetchSettings,
}

impl ReplayVendorFactory {
    pub fn new(script: ReplayScript, settings: FetchSettings) -> Self {
        Self {
            script: Arc::new(script),
            settings,
        }
    }
}

impl VendorClientFactory for ReplayVendorFactory {
    fn vendors(&self) -> Vec<Vendor> {
        Vendor::ALL.to_vec()
    }

    fn create(&self, vendor: Vendor) -> Result<Box<dyn VendorClient>, VendorError> {
        Ok(Box::new(ReplayVendorClient::new(
            vendor,
            self.script.clone(),
            self.settings,
        )))
    }
}
