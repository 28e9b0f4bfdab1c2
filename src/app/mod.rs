pub mod config;
mod error;
mod logging;
pub mod runtime;
pub mod services;
pub mod station_cache;

pub use error::AppError;

pub fn run() -> Result<(), AppError> {
    run_api()
}

pub fn run_api() -> Result<(), AppError> {
    logging::init()?;

    let config = config::AppConfig::from_env()?;
    log_bootstrap(&config);

    runtime::run_api(config)
}

pub fn run_audit_job() -> Result<(), AppError> {
    logging::init()?;

    let config = config::AppConfig::from_env()?;
    let job = config::JobConfig::from_env()?;
    log_bootstrap(&config);
    tracing::info!(
        customer_key = %job.customer_key,
        invoice = %job.invoice_path,
        "audit job starting"
    );

    runtime::run_audit_job(config, job)
}

fn log_bootstrap(config: &config::AppConfig) {
    tracing::info!(
        http_bind = %config.http_bind,
        directory_db_path = %config.directory_db_path,
        vendor_source = ?config.vendor_source,
        fusion_solar = config.fusion_solar.is_some(),
        solis = config.solis.is_some(),
        max_in_flight = config.fetch.max_in_flight,
        max_retries = config.fetch.retry.max_retries,
        station_cache_ttl_secs = config.station_cache_ttl.as_secs(),
        "application bootstrap initialized"
    );
}
