use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::domain::models::{DailyGenerationSeries, RawSample};
use crate::domain::numeric::normalize_key;
use crate::domain::period::fetch_start;

// Mean daily value at or above which a series is read as an odometer.
pub const CUMULATIVE_FLOOR_KWH: f64 = 2_000.0;
// Mean daily value above which a "daily" reading is implausible for a
// residential installation but still too small to be a counter.
pub const DAILY_CEILING_KWH: f64 = 300.0;

const DAILY_YIELD_FIELDS: &[&str] = &[
    "inverter_power",
    "product_power",
    "PVYield",
    "energy",
    "eToday",
    "dayEnergy",
    "daily_yield",
];
/// Field carrying a whole month's yield on the month's first day. Always read
/// as generation for that month, never as an odometer.
pub const MONTH_TOTAL_FIELD: &str = "month_total";
const MONTH_TOTAL_FIELDS: &[&str] = &[MONTH_TOTAL_FIELD];

const CUMULATIVE_FIELDS: &[&str] = &["total_power", "eTotal", "allEnergy", "total_yield"];
const INSTANT_POWER_FIELDS: &[&str] = &["power", "pac", "active_power"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldClass {
    DailyYield,
    MonthTotal,
    Cumulative,
    InstantPower,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeriesKind {
    Daily,
    Cumulative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: SeriesKind,
    pub ambiguous: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CumulativeDeltas {
    pub deltas: BTreeMap<NaiveDate, f64>,
    pub clamped_days: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSelection {
    pub device_id: String,
    pub field: String,
    pub kind: SeriesKind,
    pub ambiguous: bool,
    pub clamped_days: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSeries {
    pub series: DailyGenerationSeries,
    pub devices: Vec<DeviceSelection>,
}

type Readings = BTreeMap<NaiveDate, f64>;

pub fn field_class(field_name: &str) -> (FieldClass, usize) {
    let key = normalize_key(field_name);
    let catalogue = [
        (FieldClass::DailyYield, DAILY_YIELD_FIELDS),
        (FieldClass::MonthTotal, MONTH_TOTAL_FIELDS),
        (FieldClass::Cumulative, CUMULATIVE_FIELDS),
        (FieldClass::InstantPower, INSTANT_POWER_FIELDS),
    ];

    for (class, names) in catalogue {
        if let Some(rank) = names.iter().position(|name| normalize_key(name) == key) {
            return (class, rank);
        }
    }

    (FieldClass::Unknown, usize::MAX)
}

/// Picks the field a device's series is read from: the highest-priority
/// field that ever reported a non-zero value, else the highest-priority
/// field present at all.
pub fn select_field(fields: &BTreeMap<String, Readings>) -> Option<&str> {
    let mut ordered: Vec<&String> = fields.keys().collect();
    ordered.sort_by(|left, right| {
        field_class(left)
            .cmp(&field_class(right))
            .then_with(|| left.cmp(right))
    });

    ordered
        .iter()
        .copied()
        .find(|name| {
            fields
                .get(name.as_str())
                .is_some_and(|readings| readings.values().any(|value| *value != 0.0))
        })
        .or_else(|| ordered.first().copied())
        .map(String::as_str)
}

/// Magnitude heuristic separating daily values from odometer readings.
/// Values between the daily ceiling and the cumulative floor resolve to
/// daily and are flagged ambiguous.
pub fn classify_series(values: &[f64]) -> Classification {
    if values.is_empty() {
        return Classification {
            kind: SeriesKind::Daily,
            ambiguous: false,
        };
    }

    let mean = values.iter().sum::<f64>() / values.len() as f64;

    if mean >= CUMULATIVE_FLOOR_KWH {
        Classification {
            kind: SeriesKind::Cumulative,
            ambiguous: false,
        }
    } else {
        Classification {
            kind: SeriesKind::Daily,
            ambiguous: mean > DAILY_CEILING_KWH,
        }
    }
}

/// First differences of an odometer series, keyed by the later reading's
/// date. The earliest reading only serves as a predecessor. Negative
/// differences (counter resets, vendor corrections) are clamped to zero.
pub fn cumulative_to_daily(readings: &[(NaiveDate, f64)]) -> CumulativeDeltas {
    let mut sorted = readings.to_vec();
    sorted.sort_by_key(|(day, _)| *day);

    let mut deltas = BTreeMap::new();
    let mut clamped_days = 0;

    for pair in sorted.windows(2) {
        let (_, previous) = pair[0];
        let (day, current) = pair[1];
        let raw_delta = current - previous;
        if raw_delta < 0.0 {
            clamped_days += 1;
            deltas.insert(day, 0.0);
        } else {
            deltas.insert(day, raw_delta);
        }
    }

    CumulativeDeltas {
        deltas,
        clamped_days,
    }
}

pub fn normalize(samples: &[RawSample], start: NaiveDate, end: NaiveDate) -> DailyGenerationSeries {
    normalize_with_diagnostics(samples, start, end).series
}

pub fn normalize_with_diagnostics(
    samples: &[RawSample],
    start: NaiveDate,
    end: NaiveDate,
) -> NormalizedSeries {
    let window_start = fetch_start(start);
    let mut by_device: BTreeMap<&str, BTreeMap<String, Readings>> = BTreeMap::new();

    for sample in samples {
        if sample.date < window_start || sample.date > end || !sample.value.is_finite() {
            continue;
        }

        let readings = by_device
            .entry(sample.device_id.as_str())
            .or_default()
            .entry(sample.field_name.clone())
            .or_default();
        readings
            .entry(sample.date)
            .and_modify(|existing| *existing = existing.max(sample.value))
            .or_insert(sample.value);
    }

    let mut combined: Readings = BTreeMap::new();
    let mut devices = Vec::new();

    for (device_id, fields) in &by_device {
        let Some(field) = select_field(fields) else {
            continue;
        };
        let Some(readings) = fields.get(field) else {
            continue;
        };

        let values: Vec<f64> = readings.values().copied().collect();
        let classification = match field_class(field).0 {
            FieldClass::MonthTotal => Classification {
                kind: SeriesKind::Daily,
                ambiguous: false,
            },
            _ => classify_series(&values),
        };

        let (daily, clamped_days) = match classification.kind {
            SeriesKind::Cumulative => {
                let pairs: Vec<(NaiveDate, f64)> =
                    readings.iter().map(|(day, value)| (*day, *value)).collect();
                let result = cumulative_to_daily(&pairs);
                (result.deltas, result.clamped_days)
            }
            SeriesKind::Daily => {
                let mut clamped = 0;
                let daily = readings
                    .iter()
                    .map(|(day, value)| {
                        if *value < 0.0 {
                            clamped += 1;
                            (*day, 0.0)
                        } else {
                            (*day, *value)
                        }
                    })
                    .collect::<Readings>();
                (daily, clamped)
            }
        };

        for (day, kwh) in daily {
            if day >= start && day <= end {
                *combined.entry(day).or_insert(0.0) += kwh;
            }
        }

        if classification.ambiguous || clamped_days > 0 {
            tracing::debug!(
                device_id,
                field,
                ambiguous = classification.ambiguous,
                clamped_days,
                "device series needed correction"
            );
        }

        devices.push(DeviceSelection {
            device_id: (*device_id).to_string(),
            field: field.to_string(),
            kind: classification.kind,
            ambiguous: classification.ambiguous,
            clamped_days,
        });
    }

    NormalizedSeries {
        series: DailyGenerationSeries::from_days(start, end, &combined),
        devices,
    }
}
