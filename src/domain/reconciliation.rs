use crate::domain::models::{
    AuditResult, DailyGenerationSeries, DeltaClassification, IntegritySeal, InvoiceFacts,
};

pub const DEFAULT_CREDIT_TOLERANCE_KWH: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileSettings {
    pub fallback_tariff: f64,
    pub credit_tolerance_kwh: f64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            fallback_tariff: 0.0,
            credit_tolerance_kwh: DEFAULT_CREDIT_TOLERANCE_KWH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationWarning {
    SelfConsumptionClamped,
    CreditNotReported,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub result: AuditResult,
    pub warnings: Vec<ReconciliationWarning>,
}

pub fn classify_delta(delta_kwh: f64, tolerance_kwh: f64) -> DeltaClassification {
    if delta_kwh < -tolerance_kwh {
        DeltaClassification::UnderCredited
    } else if delta_kwh > tolerance_kwh {
        DeltaClassification::OverCredited
    } else {
        DeltaClassification::Balanced
    }
}

pub fn reconcile(
    series: &DailyGenerationSeries,
    invoice: &InvoiceFacts,
    settings: &ReconcileSettings,
) -> Reconciliation {
    let mut warnings = Vec::new();

    let generated_kwh = series.total_kwh();
    let injected_kwh = invoice.energy_injected_kwh;
    let grid_kwh = invoice.consumption_from_grid_kwh;

    let raw_self_consumption = generated_kwh - injected_kwh;
    let self_consumption_kwh = if raw_self_consumption < 0.0 {
        warnings.push(ReconciliationWarning::SelfConsumptionClamped);
        0.0
    } else {
        raw_self_consumption
    };

    let effective_load_kwh = grid_kwh + self_consumption_kwh;
    let effective_tariff = if grid_kwh > 0.0 {
        invoice.amount_billed / grid_kwh
    } else {
        settings.fallback_tariff
    };

    let estimated_bill_without_solar =
        effective_load_kwh * effective_tariff + invoice.other_fixed_charges;
    let savings_amount = estimated_bill_without_solar - invoice.amount_billed;
    let savings_pct = if estimated_bill_without_solar != 0.0 {
        savings_amount / estimated_bill_without_solar * 100.0
    } else {
        0.0
    };

    let (delta_kwh, delta_classification) = match invoice.energy_credited_kwh {
        Some(credited) => {
            let delta = credited - generated_kwh;
            (
                Some(delta),
                Some(classify_delta(delta, settings.credit_tolerance_kwh)),
            )
        }
        None => {
            warnings.push(ReconciliationWarning::CreditNotReported);
            (None, None)
        }
    };

    let credit_tariff = invoice.credit_tariff.unwrap_or(effective_tariff);
    let delta_value = delta_kwh.map(|delta| delta * credit_tariff);

    let integrity_seal = if generated_kwh >= injected_kwh {
        IntegritySeal::Ok
    } else {
        IntegritySeal::Warning
    };

    Reconciliation {
        result: AuditResult {
            generated_kwh,
            credited_kwh: invoice.energy_credited_kwh,
            delta_kwh,
            delta_classification,
            delta_value,
            self_consumption_kwh,
            effective_load_kwh,
            effective_tariff,
            estimated_bill_without_solar,
            savings_amount,
            savings_pct,
            integrity_seal,
        },
        warnings,
    }
}
