use std::sync::{Arc, Mutex};

use actix_cors::Cors;
use actix_web::{App, HttpServer, http::header, web};
use chrono::NaiveDate;

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::directory_db::{open_connection, run_migrations};
use crate::adapters::vendor_client::{LiveVendorFactory, VendorClientFactory};
use crate::adapters::vendor_replay::{ReplayScript, ReplayVendorFactory};
use crate::app::config::{AppConfig, JobConfig, VendorSource};
use crate::app::error::AppError;
use crate::app::services::{AuditService, SqliteDirectory};
use crate::app::station_cache::StationCache;
use crate::domain::models::{AuditReport, InvoiceFacts};

pub fn build_vendor_factory(config: &AppConfig) -> Result<Arc<dyn VendorClientFactory>, AppError> {
    match &config.vendor_source {
        VendorSource::Live => {
            if config.fusion_solar.is_none() && config.solis.is_none() {
                tracing::warn!("no vendor credentials configured, every audit will fail");
            }
            Ok(Arc::new(LiveVendorFactory {
                fusion_solar: config.fusion_solar.clone(),
                solis: config.solis.clone(),
                settings: config.fetch,
            }))
        }
        VendorSource::Replay { script_path } => {
            let script = ReplayScript::from_file(script_path).map_err(AppError::config)?;
            tracing::info!(script = %script_path, "vendor replay enabled");
            Ok(Arc::new(ReplayVendorFactory::new(script, config.fetch)))
        }
    }
}

pub fn build_service(config: &AppConfig) -> Result<AuditService, AppError> {
    let mut connection =
        open_connection(&config.directory_db_path).map_err(AppError::database_init)?;
    run_migrations(&mut connection).map_err(AppError::database_init)?;

    let directory = SqliteDirectory::new(Arc::new(Mutex::new(connection)));
    let vendors = build_vendor_factory(config)?;

    Ok(AuditService::new(
        Arc::new(directory),
        vendors,
        config.reconcile,
        StationCache::new(config.station_cache_ttl),
    ))
}

pub fn run_api(config: AppConfig) -> Result<(), AppError> {
    let api_state = ApiState {
        audits: Arc::new(build_service(&config)?),
    };

    tracing::info!(bind = %config.http_bind, "http server starting");

    actix_web::rt::System::new()
        .block_on(async move {
            HttpServer::new(move || {
                let cors = Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "PUT"])
                    .allowed_headers(vec![header::CONTENT_TYPE, header::ACCEPT])
                    .max_age(3600);

                App::new()
                    .wrap(cors)
                    .app_data(web::Data::new(api_state.clone()))
                    .configure(configure_routes)
            })
            .bind(&config.http_bind)?
            .run()
            .await
        })
        .map_err(AppError::runtime)
}

pub fn run_audit_job(config: AppConfig, job: JobConfig) -> Result<(), AppError> {
    let service = build_service(&config)?;

    let report = actix_web::rt::System::new().block_on(execute_job(&service, &job))?;
    let rendered = serde_json::to_string_pretty(&report).map_err(AppError::runtime)?;
    println!("{rendered}");

    Ok(())
}

pub async fn execute_job(service: &AuditService, job: &JobConfig) -> Result<AuditReport, AppError> {
    let raw = std::fs::read_to_string(&job.invoice_path).map_err(|error| {
        AppError::config(format!("failed to read invoice {}: {error}", job.invoice_path))
    })?;
    let invoice: InvoiceFacts = serde_json::from_str(&raw).map_err(|error| {
        AppError::config(format!("invalid invoice json {}: {error}", job.invoice_path))
    })?;

    let start = job_date(job.period_start.as_deref(), invoice.period_start, "AUDIT_PERIOD_START")?;
    let end = job_date(job.period_end.as_deref(), invoice.period_end, "AUDIT_PERIOD_END")?;

    service
        .audit(&job.customer_key, start, end, &invoice)
        .await
        .map_err(AppError::runtime)
}

fn job_date(
    explicit: Option<&str>,
    from_invoice: Option<NaiveDate>,
    key: &str,
) -> Result<NaiveDate, AppError> {
    match explicit {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .map_err(|_| AppError::config(format!("{key} must be a YYYY-MM-DD date, got {raw}"))),
        None => from_invoice.ok_or_else(|| {
            AppError::config(format!("{key} is required when the invoice carries no period"))
        }),
    }
}
