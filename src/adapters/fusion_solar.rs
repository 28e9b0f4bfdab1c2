use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone};
use serde_json::{Map, Value, json};

use crate::adapters::vendor_client::{
    FetchSettings, VendorClient, VendorError, status_error, try_in_order,
};
use crate::domain::models::{RawSample, StationRef, StationSummary, Vendor};
use crate::domain::numeric::{find_text, parse_f64};
use crate::domain::period::{Coverage, MonthBucket};
use crate::domain::series_normalizer::MONTH_TOTAL_FIELD;

pub const DEFAULT_BASE_URL: &str = "https://la5.fusionsolar.huawei.com/thirdData";

const LOGIN_PATH: &str = "/login";
const STATION_LIST_PATH: &str = "/getStationList";
const TOKEN_HEADER: &str = "xsrf-token";
const STATION_PAGE_SIZE: u32 = 100;

const SESSION_EXPIRED_FAIL_CODE: i64 = 305;
const RATE_LIMITED_FAIL_CODE: i64 = 407;

const KPI_FIELDS: &[&str] = &[
    "inverter_power",
    "product_power",
    "PVYield",
    "total_power",
    "active_power",
];

// Yield fields of a monthly KPI record, in order of preference.
const MONTH_YIELD_FIELDS: &[&str] = &["inverter_power", "product_power", "PVYield"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    Day,
    Month,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KpiQuery {
    path: &'static str,
    dev_type_id: Option<u32>,
    granularity: Granularity,
}

const STATION_KPI_QUERIES: &[KpiQuery] = &[
    KpiQuery {
        path: "/getKpiStationDay",
        dev_type_id: None,
        granularity: Granularity::Day,
    },
    KpiQuery {
        path: "/getKpiStationMonth",
        dev_type_id: None,
        granularity: Granularity::Month,
    },
];

// String inverters first, then residential inverters.
const DEVICE_KPI_QUERIES: &[KpiQuery] = &[
    KpiQuery {
        path: "/getDevKpiDay",
        dev_type_id: Some(1),
        granularity: Granularity::Day,
    },
    KpiQuery {
        path: "/getDevKpiDay",
        dev_type_id: Some(38),
        granularity: Granularity::Day,
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusionSolarCredentials {
    pub base_url: String,
    pub user_name: String,
    pub system_code: String,
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone)]
struct SessionToken {
    value: String,
    generation: u64,
}

/// FusionSolar northbound client. Holds a session token obtained through a
/// login handshake; an expired session is refreshed once per request before
/// the failure is reported.
pub struct FusionSolarClient {
    base_url: String,
    user_name: String,
    system_code: String,
    utc_offset: FixedOffset,
    http: reqwest::Client,
    settings: FetchSettings,
    session: Mutex<Option<SessionToken>>,
}

impl FusionSolarClient {
    pub fn new(credentials: FusionSolarCredentials, settings: FetchSettings) -> Result<Self, VendorError> {
        if credentials.user_name.trim().is_empty() || credentials.system_code.trim().is_empty() {
            return Err(VendorError::Configuration(
                "FusionSolar user name and system code are required".to_string(),
            ));
        }

        let utc_offset = FixedOffset::east_opt(credentials.utc_offset_minutes.saturating_mul(60))
            .ok_or_else(|| {
                VendorError::Configuration(format!(
                    "invalid FusionSolar UTC offset: {} minutes",
                    credentials.utc_offset_minutes
                ))
            })?;

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|error| {
                VendorError::Configuration(format!("failed to build HTTP client: {error}"))
            })?;

        Ok(Self {
            base_url: credentials.base_url.trim_end_matches('/').to_string(),
            user_name: credentials.user_name,
            system_code: credentials.system_code,
            utc_offset,
            http,
            settings,
            session: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self) -> Result<String, VendorError> {
        let body = json!({
            "userName": self.user_name,
            "systemCode": self.system_code,
        });
        let body = &body;

        self.settings
            .retry
            .run(LOGIN_PATH, || async move {
                let response = self.http.post(self.url(LOGIN_PATH)).json(body).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(match status_error(status, "FusionSolar login") {
                        VendorError::Authentication(reason) => VendorError::Configuration(reason),
                        other => other,
                    });
                }

                let token = response
                    .headers()
                    .get(TOKEN_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let payload: Value = response.json().await?;
                parse_login(&payload, token)
            })
            .await
    }

    /// Returns the current session, logging in when there is none or when the
    /// caller saw `stale_generation` rejected.
    async fn session(&self, stale_generation: Option<u64>) -> Result<SessionToken, VendorError> {
        {
            let current = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = current.as_ref()
                && stale_generation != Some(token.generation)
            {
                return Ok(token.clone());
            }
        }

        let value = self.login().await?;

        let mut current = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = current.as_ref().map_or(1, |token| token.generation + 1);
        let token = SessionToken { value, generation };
        *current = Some(token.clone());
        tracing::debug!(generation, "fusionsolar session established");
        Ok(token)
    }

    async fn post_with_token(&self, path: &str, body: &Value, token: &str) -> Result<Value, VendorError> {
        self.settings
            .retry
            .run(path, || async move {
                let response = self
                    .http
                    .post(self.url(path))
                    .header(TOKEN_HEADER, token)
                    .json(body)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(status_error(status, path));
                }
                let payload: Value = response.json().await?;
                check_envelope(path, payload)
            })
            .await
    }

    async fn post_authorized(&self, path: &str, body: &Value) -> Result<Value, VendorError> {
        let token = self.session(None).await?;

        match self.post_with_token(path, body, &token.value).await {
            Err(VendorError::Authentication(reason)) => {
                tracing::info!(path, reason = %reason, "fusionsolar session rejected, logging in again");
                let fresh = self.session(Some(token.generation)).await?;
                self.post_with_token(path, body, &fresh.value).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl VendorClient for FusionSolarClient {
    fn vendor(&self) -> Vendor {
        Vendor::FusionSolar
    }

    fn fetch_settings(&self) -> &FetchSettings {
        &self.settings
    }

    async fn authenticate(&self) -> Result<(), VendorError> {
        self.session(None).await.map(|_| ())
    }

    async fn fetch_bucket(
        &self,
        station: &StationRef,
        device_id: &str,
        month: MonthBucket,
        coverage: Coverage,
    ) -> Result<Vec<RawSample>, VendorError> {
        let collect_time = month_start_millis(month, self.utc_offset)?;
        let queries = if station.is_station_level(device_id) {
            STATION_KPI_QUERIES
        } else {
            DEVICE_KPI_QUERIES
        };

        let found = try_in_order(queries, |query| async move {
            let body = kpi_request(query, &station.external_id, device_id, collect_time);
            let payload = self.post_authorized(query.path, &body).await?;
            let samples = match query.granularity {
                Granularity::Day => parse_kpi_records(&payload, device_id, month, self.utc_offset),
                Granularity::Month => parse_month_total(&payload, device_id, month, self.utc_offset),
            };
            if samples.is_empty() {
                tracing::debug!(path = query.path, device_id, month = %month, "no KPI records, trying next query");
                return Ok(None);
            }
            if query.granularity == Granularity::Month && coverage == Coverage::Partial {
                return Err(VendorError::DataUnavailable(format!(
                    "{}: only a monthly total exists for {month}, which the audited period covers partially",
                    query.path
                )));
            }
            Ok(Some(samples))
        })
        .await?;

        Ok(found.unwrap_or_default())
    }

    async fn list_stations(&self) -> Result<Vec<StationSummary>, VendorError> {
        let body = json!({"pageNo": 1, "pageSize": STATION_PAGE_SIZE});
        let payload = self.post_authorized(STATION_LIST_PATH, &body).await?;
        Ok(parse_station_list(&payload))
    }
}

fn kpi_request(query: KpiQuery, station_code: &str, device_id: &str, collect_time: i64) -> Value {
    match query.dev_type_id {
        None => json!({
            "stationCodes": station_code,
            "collectTime": collect_time,
        }),
        Some(dev_type_id) => json!({
            "devIds": device_id,
            "devTypeId": dev_type_id,
            "collectTime": collect_time,
        }),
    }
}

fn fail_code(payload: &Value) -> Option<i64> {
    payload.get("failCode").and_then(parse_f64).map(|code| code as i64)
}

fn envelope_message(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(Value::as_str)
        .filter(|message| !message.is_empty())
        .map(str::to_string)
        .or_else(|| fail_code(payload).map(|code| format!("failCode {code}")))
        .unwrap_or_else(|| "no message".to_string())
}

fn parse_login(payload: &Value, token: Option<String>) -> Result<String, VendorError> {
    if payload.get("success").and_then(Value::as_bool) != Some(true) {
        if fail_code(payload) == Some(RATE_LIMITED_FAIL_CODE) {
            return Err(VendorError::Transient(
                "FusionSolar login rate limited".to_string(),
            ));
        }
        return Err(VendorError::Configuration(format!(
            "FusionSolar login rejected: {}",
            envelope_message(payload)
        )));
    }

    token.filter(|token| !token.is_empty()).ok_or_else(|| {
        VendorError::Configuration(format!("FusionSolar login returned no {TOKEN_HEADER} header"))
    })
}

fn check_envelope(path: &str, payload: Value) -> Result<Value, VendorError> {
    if payload.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(payload);
    }

    match fail_code(&payload) {
        Some(SESSION_EXPIRED_FAIL_CODE) => Err(VendorError::Authentication(format!(
            "{path}: session expired"
        ))),
        Some(RATE_LIMITED_FAIL_CODE) => Err(VendorError::Transient(format!(
            "{path}: rate limited"
        ))),
        _ => Err(VendorError::DataUnavailable(format!(
            "{path}: {}",
            envelope_message(&payload)
        ))),
    }
}

fn month_start_millis(month: MonthBucket, offset: FixedOffset) -> Result<i64, VendorError> {
    let first = month
        .first_day()
        .ok_or_else(|| VendorError::DataUnavailable(format!("invalid month {month}")))?;

    offset
        .from_local_datetime(&first.and_time(NaiveTime::MIN))
        .single()
        .map(|start| start.timestamp_millis())
        .ok_or_else(|| VendorError::DataUnavailable(format!("invalid month {month}")))
}

fn records_in_month(
    payload: &Value,
    month: MonthBucket,
    offset: FixedOffset,
) -> Vec<(NaiveDate, &Map<String, Value>)> {
    let Some(records) = payload.get("data").and_then(Value::as_array) else {
        return Vec::new();
    };

    records
        .iter()
        .filter_map(|record| {
            let collect_time = record.get("collectTime").and_then(parse_f64)? as i64;
            let date = DateTime::from_timestamp_millis(collect_time)?
                .with_timezone(&offset)
                .date_naive();
            let items = record.get("dataItemMap")?.as_object()?;
            (MonthBucket::containing(date) == month).then_some((date, items))
        })
        .collect()
}

/// Flattens daily KPI records into one sample per known numeric field.
/// Records whose collect time falls outside `month` are dropped.
fn parse_kpi_records(
    payload: &Value,
    device_id: &str,
    month: MonthBucket,
    offset: FixedOffset,
) -> Vec<RawSample> {
    records_in_month(payload, month, offset)
        .into_iter()
        .flat_map(|(date, items)| {
            KPI_FIELDS.iter().filter_map(move |field| {
                let value = items.get(*field).and_then(parse_f64)?;
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

/// Reads the monthly KPI record of `month` as one month-total sample dated
/// on the month's first day.
fn parse_month_total(
    payload: &Value,
    device_id: &str,
    month: MonthBucket,
    offset: FixedOffset,
) -> Vec<RawSample> {
    let Some(first_day) = month.first_day() else {
        return Vec::new();
    };

    records_in_month(payload, month, offset)
        .into_iter()
        .find_map(|(_, items)| {
            MONTH_YIELD_FIELDS
                .iter()
                .find_map(|field| items.get(*field).and_then(parse_f64))
        })
        .map(|value| RawSample {
            date: first_day,
            device_id: device_id.to_string(),
            field_name: MONTH_TOTAL_FIELD.to_string(),
            value,
        })
        .into_iter()
        .collect()
}

fn parse_station_list(payload: &Value) -> Vec<StationSummary> {
    let data = payload.get("data");
    let records = data
        .and_then(Value::as_array)
        .or_else(|| data.and_then(|data| data.get("list")).and_then(Value::as_array));

    records
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
        .filter_map(|record| {
            let external_id = find_text(record, &["stationCode", "plantCode"])?;
            let name = find_text(record, &["stationName", "plantName"])
                .unwrap_or_else(|| external_id.clone());
            Some(StationSummary {
                vendor: Vendor::FusionSolar,
                external_id,
                name,
            })
        })
        .collect()
}
