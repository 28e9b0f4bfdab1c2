use std::sync::Arc;

use actix_web::{HttpResponse, Responder, get, post, put, web};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::adapters::vendor_client::VendorError;
use crate::app::services::{AuditError, AuditService, DirectoryError, normalize_customer_key};
use crate::domain::models::{InvoiceFacts, StationRef, Vendor};

#[derive(Clone)]
pub struct ApiState {
    pub audits: Arc<AuditService>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRequest {
    pub customer_key: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub invoice: InvoiceFacts,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomerLinkResponse {
    pub customer_key: String,
    pub station: StationRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_at: Option<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StationResponse {
    pub vendor: Vendor,
    pub external_id: String,
    pub name: String,
    pub display: String,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(run_audit_endpoint)
        .service(get_customer_endpoint)
        .service(link_customer_endpoint)
        .service(list_stations_endpoint)
        .service(refresh_stations_endpoint);
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[post("/audits")]
async fn run_audit_endpoint(
    state: web::Data<ApiState>,
    request: web::Json<AuditRequest>,
) -> impl Responder {
    let request = request.into_inner();
    let start = request.period_start.or(request.invoice.period_start);
    let end = request.period_end.or(request.invoice.period_end);

    let (Some(start), Some(end)) = (start, end) else {
        return error_body(
            HttpResponse::BadRequest(),
            "invalid_period",
            "periodStart and periodEnd are required, directly or on the invoice",
        );
    };

    match state
        .audits
        .audit(&request.customer_key, start, end, &request.invoice)
        .await
    {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(error) => audit_error_response(error),
    }
}

#[get("/customers/{customer_key}")]
async fn get_customer_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<String>,
) -> impl Responder {
    let customer_key = path.into_inner();

    match state.audits.resolve(&customer_key) {
        Ok(station) => HttpResponse::Ok().json(CustomerLinkResponse {
            customer_key: normalize_customer_key(&customer_key),
            station,
            linked_at: None,
        }),
        Err(error) => directory_error_response(error),
    }
}

#[put("/customers/{customer_key}")]
async fn link_customer_endpoint(
    state: web::Data<ApiState>,
    path: web::Path<String>,
    station: web::Json<StationRef>,
) -> impl Responder {
    match state.audits.register(&path.into_inner(), &station) {
        Ok(record) => HttpResponse::Created().json(CustomerLinkResponse {
            customer_key: record.customer_key,
            station: record.station,
            linked_at: Some(record.linked_at),
        }),
        Err(error) => directory_error_response(error),
    }
}

#[get("/stations")]
async fn list_stations_endpoint(state: web::Data<ApiState>) -> impl Responder {
    let stations: Vec<StationResponse> = state
        .audits
        .list_stations()
        .await
        .into_iter()
        .map(|station| StationResponse {
            display: station.display(),
            vendor: station.vendor,
            external_id: station.external_id,
            name: station.name,
        })
        .collect();

    HttpResponse::Ok().json(stations)
}

#[post("/stations/refresh")]
async fn refresh_stations_endpoint(state: web::Data<ApiState>) -> impl Responder {
    state.audits.invalidate_stations();
    HttpResponse::NoContent().finish()
}

fn error_body(
    mut builder: actix_web::HttpResponseBuilder,
    state: &str,
    message: impl std::fmt::Display,
) -> HttpResponse {
    builder.json(serde_json::json!({
        "state": state,
        "error": message.to_string(),
    }))
}

fn audit_error_response(error: AuditError) -> HttpResponse {
    match error {
        AuditError::CustomerNotLinked(_) => {
            error_body(HttpResponse::NotFound(), "customer_not_linked", error)
        }
        AuditError::InvalidPeriod { .. } => {
            error_body(HttpResponse::BadRequest(), "invalid_period", error)
        }
        AuditError::Vendor(VendorError::Configuration(_)) => {
            error_body(HttpResponse::InternalServerError(), "configuration_error", error)
        }
        AuditError::Vendor(VendorError::Authentication(_)) => {
            error_body(HttpResponse::BadGateway(), "vendor_authentication_failed", error)
        }
        AuditError::Vendor(_) => error_body(HttpResponse::BadGateway(), "vendor_unavailable", error),
        AuditError::Directory(inner) => directory_error_response(inner),
    }
}

fn directory_error_response(error: DirectoryError) -> HttpResponse {
    match error {
        DirectoryError::NotFound(_) => {
            error_body(HttpResponse::NotFound(), "customer_not_linked", error)
        }
        DirectoryError::AlreadyLinked(_) => {
            error_body(HttpResponse::Conflict(), "already_linked", error)
        }
        DirectoryError::InvalidLink(_) => {
            error_body(HttpResponse::BadRequest(), "invalid_station", error)
        }
        DirectoryError::LockPoisoned | DirectoryError::Database(_) => {
            error_body(HttpResponse::InternalServerError(), "directory_error", error)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use actix_web::{App, http::StatusCode, test, web};
    use serde_json::{Value, json};

    use crate::adapters::vendor_client::{FetchSettings, RetryPolicy};
    use crate::adapters::vendor_replay::{ReplayScript, ReplayVendorFactory};
    use crate::app::services::{AuditService, SqliteDirectory};
    use crate::app::station_cache::StationCache;
    use crate::domain::reconciliation::ReconcileSettings;
    use crate::test_support::{open_test_connection, replay_fixture};

    use super::{ApiState, configure_routes};

    fn build_state(name: &str, fixture: &str) -> ApiState {
        let connection = open_test_connection(name);
        let directory = SqliteDirectory::new(Arc::new(Mutex::new(connection)));
        let script = ReplayScript::from_file(&replay_fixture(fixture)).expect("fixture should load");
        let vendors = ReplayVendorFactory::new(
            script,
            FetchSettings {
                max_in_flight: 2,
                request_timeout: Duration::from_secs(1),
                retry: RetryPolicy {
                    max_retries: 0,
                    backoff_base: Duration::from_millis(1),
                },
            },
        );

        ApiState {
            audits: Arc::new(AuditService::new(
                Arc::new(directory),
                Arc::new(vendors),
                ReconcileSettings::default(),
                StationCache::new(Duration::from_secs(600)),
            )),
        }
    }

    fn solis_link() -> Value {
        json!({"vendor": "solis_cloud", "externalId": "1298491919449"})
    }

    #[actix_web::test]
    async fn health_endpoint_returns_ok() {
        let state = build_state("health", "no_records.json");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn links_customer_once_and_resolves_it() {
        let state = build_state("link-customer", "no_records.json");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let missing = test::call_service(
            &app,
            test::TestRequest::get().uri("/customers/casa%20silva").to_request(),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(missing).await;
        assert_eq!(body["state"], "customer_not_linked");

        let created = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/customers/casa%20silva")
                .set_json(solis_link())
                .to_request(),
        )
        .await;
        assert_eq!(created.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(created).await;
        assert_eq!(body["customerKey"], "CASA SILVA");
        assert!(body["linkedAt"].is_string());

        let conflict = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/customers/CASA%20SILVA")
                .set_json(json!({"vendor": "fusion_solar", "externalId": "NE=1"}))
                .to_request(),
        )
        .await;
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        let body: Value = test::read_body_json(conflict).await;
        assert_eq!(body["state"], "already_linked");

        let resolved = test::call_service(
            &app,
            test::TestRequest::get().uri("/customers/Casa%20Silva").to_request(),
        )
        .await;
        assert_eq!(resolved.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resolved).await;
        assert_eq!(body["station"]["externalId"], "1298491919449");
        assert_eq!(body["station"]["vendor"], "solis_cloud");
    }

    #[actix_web::test]
    async fn rejects_link_without_station_id() {
        let state = build_state("link-invalid", "no_records.json");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::put()
                .uri("/customers/casa")
                .set_json(json!({"vendor": "solis_cloud", "externalId": ""}))
                .to_request(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["state"], "invalid_station");
    }

    #[actix_web::test]
    async fn audit_returns_report_with_degraded_months() {
        let state = build_state("audit-report", "three_months_one_failing.json");
        state
            .audits
            .register("Fazenda Boa Vista", &serde_json::from_value(solis_link()).expect("station"))
            .expect("link should succeed");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/audits")
                .set_json(json!({
                    "customerKey": "fazenda boa vista",
                    "invoice": {
                        "consumptionFromGridKwh": "300,00",
                        "energyInjectedKwh": 30,
                        "energyCreditedKwh": 20,
                        "amountBilled": "R$ 90,00",
                        "periodStart": "2024-01-01",
                        "periodEnd": "2024-03-31"
                    }
                }))
                .to_request(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["result"]["generatedKwh"], 42.0);
        assert_eq!(body["result"]["deltaClassification"], "UNDER_CREDITED");
        assert_eq!(body["result"]["integritySeal"], "OK");
        assert_eq!(body["confidence"], "low");
        assert_eq!(body["series"].as_array().map(Vec::len), Some(91));
        assert_eq!(body["notes"][0]["kind"], "buckets_failed");
        assert!(body["auditId"].is_string());
    }

    #[actix_web::test]
    async fn audit_for_unlinked_customer_returns_404() {
        let state = build_state("audit-unlinked", "no_records.json");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/audits")
                .set_json(json!({
                    "customerKey": "nobody",
                    "periodStart": "2024-05-01",
                    "periodEnd": "2024-05-31",
                    "invoice": {}
                }))
                .to_request(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["state"], "customer_not_linked");
    }

    #[actix_web::test]
    async fn audit_without_period_is_rejected() {
        let state = build_state("audit-no-period", "no_records.json");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let resp = test::call_service(
            &app,
            test::TestRequest::post()
                .uri("/audits")
                .set_json(json!({"customerKey": "casa", "invoice": {}}))
                .to_request(),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["state"], "invalid_period");
    }

    #[actix_web::test]
    async fn lists_and_refreshes_station_catalogue() {
        let state = build_state("stations", "no_records.json");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure_routes),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/stations").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body[0]["display"], "Huawei | Casa Silva");
        assert_eq!(body[1]["externalId"], "1298491919449");

        let refreshed = test::call_service(
            &app,
            test::TestRequest::post().uri("/stations/refresh").to_request(),
        )
        .await;
        assert_eq!(refreshed.status(), StatusCode::NO_CONTENT);
    }
}
