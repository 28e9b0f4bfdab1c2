use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::numeric::{lenient_f64, lenient_opt_f64};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    FusionSolar,
    SolisCloud,
}

impl Vendor {
    pub const ALL: [Vendor; 2] = [Vendor::FusionSolar, Vendor::SolisCloud];

    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::FusionSolar => "fusion_solar",
            Vendor::SolisCloud => "solis_cloud",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Vendor::FusionSolar => "Huawei",
            Vendor::SolisCloud => "Solis",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fusion_solar" | "fusionsolar" | "huawei" => Ok(Vendor::FusionSolar),
            "solis_cloud" | "soliscloud" | "solis" => Ok(Vendor::SolisCloud),
            other => Err(format!("unknown vendor: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationRef {
    pub vendor: Vendor,
    pub external_id: String,
    #[serde(default)]
    pub device_ids: Vec<String>,
}

impl StationRef {
    /// Devices queried for this installation. A station registered without
    /// explicit devices is queried at station level under its own id.
    pub fn devices(&self) -> Vec<String> {
        if self.device_ids.is_empty() {
            vec![self.external_id.clone()]
        } else {
            self.device_ids.clone()
        }
    }

    pub fn is_station_level(&self, device_id: &str) -> bool {
        self.device_ids.is_empty() && device_id == self.external_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationSummary {
    pub vendor: Vendor,
    pub external_id: String,
    pub name: String,
}

impl StationSummary {
    pub fn display(&self) -> String {
        format!("{} | {}", self.vendor.display_name(), self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub date: NaiveDate,
    pub device_id: String,
    pub field_name: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyGenerationSeries {
    start: NaiveDate,
    end: NaiveDate,
    days: BTreeMap<NaiveDate, f64>,
}

impl DailyGenerationSeries {
    /// Builds a series covering every day of `[start, end]`. Days absent from
    /// `values` are 0.0, values outside the range are dropped and negative
    /// values are clamped to zero.
    pub fn from_days(
        start: NaiveDate,
        end: NaiveDate,
        values: &BTreeMap<NaiveDate, f64>,
    ) -> Self {
        let days = start
            .iter_days()
            .take_while(|day| *day <= end)
            .map(|day| {
                let value = values.get(&day).copied().unwrap_or(0.0);
                (day, if value.is_finite() { value.max(0.0) } else { 0.0 })
            })
            .collect();

        Self { start, end, days }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn get(&self, day: NaiveDate) -> Option<f64> {
        self.days.get(&day).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.days.iter().map(|(day, kwh)| (*day, *kwh))
    }

    pub fn total_kwh(&self) -> f64 {
        self.days.values().sum()
    }

    pub fn to_points(&self) -> Vec<DailyPoint> {
        self.iter()
            .map(|(date, kwh)| DailyPoint { date, kwh })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceFacts {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub consumption_from_grid_kwh: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub energy_injected_kwh: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub energy_credited_kwh: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub amount_billed: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub other_fixed_charges: f64,
    #[serde(default, deserialize_with = "lenient_opt_f64")]
    pub credit_tariff: Option<f64>,
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    #[serde(default)]
    pub reference_month: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeltaClassification {
    UnderCredited,
    OverCredited,
    Balanced,
}

impl DeltaClassification {
    pub fn message(&self, generated_kwh: f64, credited_kwh: f64) -> String {
        let delta = credited_kwh - generated_kwh;
        match self {
            DeltaClassification::UnderCredited => format!(
                "utility credited {:.2} kWh less than generated (expected {generated_kwh:.2}, credited {credited_kwh:.2})",
                delta.abs()
            ),
            DeltaClassification::OverCredited => {
                format!("utility credited {delta:.2} kWh more than generated")
            }
            DeltaClassification::Balanced => {
                format!("credit matches generation (difference {delta:.2} kWh)")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegritySeal {
    Ok,
    Warning,
}

impl IntegritySeal {
    pub fn message(&self) -> &'static str {
        match self {
            IntegritySeal::Ok => "mathematical integrity confirmed",
            IntegritySeal::Warning => "generation below injected energy, check the data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditResult {
    pub generated_kwh: f64,
    pub credited_kwh: Option<f64>,
    pub delta_kwh: Option<f64>,
    pub delta_classification: Option<DeltaClassification>,
    /// Money value of the credit delta at the invoice's credit tariff, or the
    /// effective tariff when the invoice states none.
    pub delta_value: Option<f64>,
    pub self_consumption_kwh: f64,
    pub effective_load_kwh: f64,
    pub effective_tariff: f64,
    pub estimated_bill_without_solar: f64,
    pub savings_amount: f64,
    pub savings_pct: f64,
    pub integrity_seal: IntegritySeal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditNote {
    ClassificationAmbiguous { device_id: String, field: String },
    NegativeDeltasClamped { device_id: String, days: usize },
    BucketsFailed { count: usize },
    NoTelemetry { reason: String },
    SelfConsumptionClamped,
    CreditNotReported,
}

impl AuditNote {
    pub fn lowers_confidence(&self) -> bool {
        !matches!(self, AuditNote::CreditNotReported)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub audit_id: Uuid,
    pub customer_key: String,
    pub station: StationRef,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub reference_month: Option<NaiveDate>,
    pub series: Vec<DailyPoint>,
    pub result: AuditResult,
    pub confidence: Confidence,
    pub notes: Vec<AuditNote>,
    pub seal_message: String,
    pub credit_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::NaiveDate;
    use serde_json::json;

    use super::{DailyGenerationSeries, InvoiceFacts, StationRef, StationSummary, Vendor};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn series_covers_every_day_and_clamps_negatives() {
        let mut values = BTreeMap::new();
        values.insert(day(2024, 1, 30), 5.0);
        values.insert(day(2024, 2, 1), -3.0);
        values.insert(day(2024, 2, 5), 99.0);

        let series = DailyGenerationSeries::from_days(day(2024, 1, 30), day(2024, 2, 2), &values);

        assert_eq!(series.len(), 4);
        assert_eq!(series.get(day(2024, 1, 31)), Some(0.0));
        assert_eq!(series.get(day(2024, 2, 1)), Some(0.0));
        assert_eq!(series.get(day(2024, 2, 5)), None);
        assert_eq!(series.total_kwh(), 5.0);
    }

    #[test]
    fn invoice_missing_fields_default_to_zero() {
        let invoice: InvoiceFacts = serde_json::from_value(json!({
            "consumptionFromGridKwh": "450,00",
            "amountBilled": 120.5,
            "energyCreditedKwh": null
        }))
        .expect("invoice should deserialize");

        assert_eq!(invoice.consumption_from_grid_kwh, 450.0);
        assert_eq!(invoice.energy_injected_kwh, 0.0);
        assert_eq!(invoice.energy_credited_kwh, None);
        assert_eq!(invoice.other_fixed_charges, 0.0);
        assert_eq!(invoice.period_start, None);
    }

    #[test]
    fn invoice_amounts_read_dot_thousands_as_brazilian() {
        let invoice: InvoiceFacts = serde_json::from_value(json!({
            "consumptionFromGridKwh": "1.234",
            "energyInjectedKwh": 380.5,
            "creditTariff": "0,92",
            "referenceMonth": "2024-05-01"
        }))
        .expect("invoice should deserialize");

        assert_eq!(invoice.consumption_from_grid_kwh, 1234.0);
        assert_eq!(invoice.energy_injected_kwh, 380.5);
        assert_eq!(invoice.credit_tariff, Some(0.92));
        assert_eq!(
            invoice.reference_month,
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
    }

    #[test]
    fn station_without_devices_is_queried_at_station_level() {
        let station = StationRef {
            vendor: Vendor::SolisCloud,
            external_id: "1298491919449".to_string(),
            device_ids: Vec::new(),
        };

        assert_eq!(station.devices(), vec!["1298491919449".to_string()]);
        assert!(station.is_station_level("1298491919449"));
    }

    #[test]
    fn vendor_parses_brand_names() {
        assert_eq!("Huawei".parse::<Vendor>(), Ok(Vendor::FusionSolar));
        assert_eq!(" solis ".parse::<Vendor>(), Ok(Vendor::SolisCloud));
        assert!("growatt".parse::<Vendor>().is_err());
    }

    #[test]
    fn station_summary_display_prefixes_brand() {
        let summary = StationSummary {
            vendor: Vendor::FusionSolar,
            external_id: "NE=123".to_string(),
            name: "Casa Silva".to_string(),
        };

        assert_eq!(summary.display(), "Huawei | Casa Silva");
    }
}
