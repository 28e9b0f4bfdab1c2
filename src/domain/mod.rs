pub mod models;
pub mod numeric;
pub mod period;
pub mod reconciliation;
pub mod series_normalizer;
