use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use serde_json::{Map, Value, json};
use sha1::Sha1;

use crate::adapters::vendor_client::{
    FetchSettings, VendorClient, VendorError, status_error, try_in_order,
};
use crate::domain::models::{RawSample, StationRef, StationSummary, Vendor};
use crate::domain::numeric::{find_text, find_value, parse_f64};
use crate::domain::period::{Coverage, MonthBucket};

pub const DEFAULT_BASE_URL: &str = "https://www.soliscloud.com:13333";

const CONTENT_TYPE: &str = "application/json";
const STATION_LIST_PATH: &str = "/v1/api/userStationList";
const INVERTER_MONTH_PATH: &str = "/v1/api/inverterMonth";
const STATION_PAGE_SIZE: u32 = 100;

const STATION_DAY_PATHS: &[&str] = &["/v1/api/stationDayEnergyList", "/v1/api/stationMonth"];
const DEVICE_DAY_PATHS: &[&str] = &[INVERTER_MONTH_PATH];

// Envelope codes the gateway uses for a rejected key id or signature.
const KEY_REJECTED_CODES: &[&str] = &["401", "403"];

const ENERGY_FIELDS: &[&str] = &["energy", "eToday", "eTotal", "pac"];

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolisCredentials {
    pub base_url: String,
    pub key_id: String,
    pub key_secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub content_md5: String,
    pub date: String,
    pub authorization: String,
}

/// Signs one request body for `resource`. `date` must be the RFC 1123 GMT
/// timestamp sent in the `Date` header.
pub fn sign_request(
    key_id: &str,
    key_secret: &str,
    body: &str,
    date: &str,
    resource: &str,
) -> Result<SignedHeaders, VendorError> {
    let content_md5 = STANDARD.encode(Md5::digest(body.as_bytes()));
    let string_to_sign = format!("POST\n{content_md5}\n{CONTENT_TYPE}\n{date}\n{resource}");

    let mut mac = HmacSha1::new_from_slice(key_secret.as_bytes())
        .map_err(|error| VendorError::Configuration(format!("invalid Solis key secret: {error}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    Ok(SignedHeaders {
        content_md5,
        date: date.to_string(),
        authorization: format!("API {key_id}:{signature}"),
    })
}

pub fn gmt_timestamp(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// SolisCloud client. Every request carries its own signature, so there is no
/// session to establish or refresh.
pub struct SolisCloudClient {
    base_url: String,
    key_id: String,
    key_secret: String,
    http: reqwest::Client,
    settings: FetchSettings,
}

impl SolisCloudClient {
    pub fn new(credentials: SolisCredentials, settings: FetchSettings) -> Result<Self, VendorError> {
        if credentials.key_id.trim().is_empty() || credentials.key_secret.is_empty() {
            return Err(VendorError::Configuration(
                "Solis key id and key secret are required".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|error| {
                VendorError::Configuration(format!("failed to build HTTP client: {error}"))
            })?;

        Ok(Self {
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            key_id: credentials.key_id,
            key_secret: credentials.key_secret,
            http,
            settings,
        })
    }

    async fn post_signed(&self, resource: &str, body: &Value) -> Result<Value, VendorError> {
        let body = serde_json::to_string(body).map_err(|error| {
            VendorError::Configuration(format!("failed to encode Solis request: {error}"))
        })?;
        let body = body.as_str();

        self.settings
            .retry
            .run(resource, || async move {
                // Signed right before sending; a retried request gets a new date.
                let signed = sign_request(
                    &self.key_id,
                    &self.key_secret,
                    body,
                    &gmt_timestamp(Utc::now()),
                    resource,
                )?;

                let response = self
                    .http
                    .post(format!("{}{}", self.base_url, resource))
                    .header("Content-Type", CONTENT_TYPE)
                    .header("Content-MD5", &signed.content_md5)
                    .header("Date", &signed.date)
                    .header("Authorization", &signed.authorization)
                    .body(body.to_string())
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(status_error(status, resource));
                }
                let payload: Value = response.json().await?;
                check_envelope(resource, payload)
            })
            .await
    }
}

#[async_trait]
impl VendorClient for SolisCloudClient {
    fn vendor(&self) -> Vendor {
        Vendor::SolisCloud
    }

    fn fetch_settings(&self) -> &FetchSettings {
        &self.settings
    }

    async fn authenticate(&self) -> Result<(), VendorError> {
        Ok(())
    }

    async fn fetch_bucket(
        &self,
        station: &StationRef,
        device_id: &str,
        month: MonthBucket,
        _coverage: Coverage,
    ) -> Result<Vec<RawSample>, VendorError> {
        let station_level = station.is_station_level(device_id);
        let paths = if station_level {
            STATION_DAY_PATHS
        } else {
            DEVICE_DAY_PATHS
        };

        let found = try_in_order(paths, |path| async move {
            let body = day_energy_request(path, device_id, month);
            let payload = self.post_signed(path, &body).await?;
            let samples = parse_day_records(&payload, device_id, month);
            Ok((!samples.is_empty()).then_some(samples))
        })
        .await?;

        Ok(found.unwrap_or_default())
    }

    async fn list_stations(&self) -> Result<Vec<StationSummary>, VendorError> {
        let body = json!({"pageNo": 1, "pageSize": STATION_PAGE_SIZE});
        let payload = self.post_signed(STATION_LIST_PATH, &body).await?;
        Ok(parse_station_list(&payload))
    }
}

fn day_energy_request(path: &str, id: &str, month: MonthBucket) -> Value {
    match path {
        INVERTER_MONTH_PATH => json!({"sn": id, "month": month.label()}),
        "/v1/api/stationMonth" => json!({"id": id, "month": month.label(), "money": "", "timeZone": 0}),
        _ => json!({"stationId": id, "time": month.label()}),
    }
}

fn check_envelope(resource: &str, payload: Value) -> Result<Value, VendorError> {
    let code = payload
        .get("code")
        .and_then(|code| match code {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| "0".to_string());
    let success = payload
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(code == "0");

    if success && code == "0" {
        return Ok(payload);
    }

    let message = payload
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or("no message");
    if KEY_REJECTED_CODES.contains(&code.as_str()) {
        return Err(VendorError::Configuration(format!(
            "{resource}: Solis rejected the API key, code {code}, {message}"
        )));
    }
    Err(VendorError::DataUnavailable(format!(
        "{resource}: code {code}, {message}"
    )))
}

fn records(payload: &Value) -> Vec<&Map<String, Value>> {
    let data = payload.get("data");
    let list = data
        .and_then(Value::as_array)
        .or_else(|| data.and_then(|data| data.get("records")).and_then(Value::as_array))
        .or_else(|| {
            data.and_then(|data| data.get("page"))
                .and_then(|page| page.get("records"))
                .and_then(Value::as_array)
        });

    list.into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .collect()
}

/// Resolves a record date that may be a bare day of `month`, a full ISO date,
/// or epoch milliseconds.
fn parse_record_date(record: &Map<String, Value>, month: MonthBucket) -> Option<NaiveDate> {
    match find_value(record, &["dateStr", "date"])? {
        Value::String(text) => {
            let text = text.trim();
            if text.len() < 3 {
                month.day(text.parse().ok()?)
            } else {
                NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
            }
        }
        Value::Number(number) => {
            let raw = number.as_i64()?;
            if (1..=31).contains(&raw) {
                month.day(u32::try_from(raw).ok()?)
            } else {
                DateTime::from_timestamp_millis(raw).map(|moment| moment.date_naive())
            }
        }
        _ => None,
    }
}

fn parse_day_records(payload: &Value, device_id: &str, month: MonthBucket) -> Vec<RawSample> {
    records(payload)
        .into_iter()
        .filter_map(|record| {
            let date = parse_record_date(record, month)?;
            (MonthBucket::containing(date) == month).then_some((date, record))
        })
        .flat_map(|(date, record)| {
            ENERGY_FIELDS.iter().filter_map(move |field| {
                let value = record.get(*field).and_then(parse_f64)?;
                Some(RawSample {
                    date,
                    device_id: device_id.to_string(),
                    field_name: (*field).to_string(),
                    value,
                })
            })
        })
        .collect()
}

fn parse_station_list(payload: &Value) -> Vec<StationSummary> {
    records(payload)
        .into_iter()
        .filter_map(|record| {
            let external_id = find_text(record, &["id", "stationId"])?;
            let name = find_text(record, &["stationName", "sno"])
                .unwrap_or_else(|| external_id.clone());
            Some(StationSummary {
                vendor: Vendor::SolisCloud,
                external_id,
                name,
            })
        })
        .collect()
}
