//! Axum JSON API over the scraper service.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use txscout_core::{ParameterValue, ScraperDraft, ScraperType, ScraperTypeCatalog};
use txscout_jobs::{
    ClusterApi, InMemoryCluster, JobView, KubeClient, KubeConfig, LogPage, OrchestratorConfig,
    ScraperService, ScraperView, ServiceError,
};
use txscout_storage::{
    InMemoryScraperRepository, PgScraperRepository, ScraperRepository, StorageError, WatermarkBody,
    WatermarkStore,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "txscout-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub catalog_path: PathBuf,
    /// Local development only: run on in-memory stores and a simulated
    /// cluster when Postgres or cluster credentials are missing.
    pub in_memory_fallback: bool,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("TXSCOUT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            database_url: std::env::var("DATABASE_URL").ok(),
            catalog_path: std::env::var("SCRAPER_TYPES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("scraper_types.yaml")),
            in_memory_fallback: std::env::var("TXSCOUT_IN_MEMORY_FALLBACK")
                .map(|v| matches!(v.as_str(), "1" | "true"))
                .unwrap_or(false),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ScraperService>,
}

impl AppState {
    pub fn new(service: ScraperService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "deletion_timeout"),
            ApiError::BadGateway(_) => (StatusCode::BAD_GATEWAY, "cluster_error"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let body = Json(ErrorResponse {
            error: kind.to_string(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::Validation(_) => ApiError::BadRequest(err.to_string()),
            ServiceError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ServiceError::RunInProgress { .. } => ApiError::Conflict(err.to_string()),
            ServiceError::DeletionTimeout { .. } => ApiError::Timeout(err.to_string()),
            ServiceError::Cluster(_) => {
                error!(error = %err, "cluster call failed");
                ApiError::BadGateway(err.to_string())
            }
            ServiceError::Storage(StorageError::WatermarkRegression { .. }) => {
                ApiError::Conflict(err.to_string())
            }
            ServiceError::Storage(StorageError::TenantInUse(_)) => ApiError::Conflict(err.to_string()),
            ServiceError::Storage(_) => {
                error!(error = %err, "storage call failed");
                ApiError::Internal("storage error".to_string())
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertScraperRequest {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub scraper_type_id: String,
    pub display_name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterValue>,
}

impl UpsertScraperRequest {
    fn into_draft(self, tenant_id: String, id: Option<Uuid>) -> ScraperDraft {
        ScraperDraft {
            tenant_id,
            id: id.or(self.id),
            scraper_type_id: self.scraper_type_id,
            display_name: self.display_name,
            parameters: self.parameters,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

impl LogsQuery {
    /// Paging applies once a page size is given; the page defaults to the first.
    fn page(&self) -> Option<LogPage> {
        self.page_size.map(|size| LogPage {
            page: self.page.unwrap_or(0),
            size,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantDeleted {
    pub deleted_scrapers: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/scraper-types", get(scraper_types_handler))
        .route("/tenants/{tenant_id}", axum::routing::delete(delete_tenant_handler))
        .route(
            "/tenants/{tenant_id}/scrapers",
            get(list_scrapers_handler).post(create_scraper_handler),
        )
        .route(
            "/tenants/{tenant_id}/scrapers/{scraper_id}",
            get(get_scraper_handler)
                .put(update_scraper_handler)
                .delete(delete_scraper_handler),
        )
        .route(
            "/tenants/{tenant_id}/scrapers/{scraper_id}/trigger",
            post(trigger_handler),
        )
        .route(
            "/tenants/{tenant_id}/scrapers/{scraper_id}/schedule",
            put(schedule_handler),
        )
        .route(
            "/tenants/{tenant_id}/scrapers/{scraper_id}/jobs",
            get(scraper_jobs_handler),
        )
        .route(
            "/tenants/{tenant_id}/scrapers/{scraper_id}/last-scraped-date",
            get(get_watermark_handler).put(set_watermark_handler),
        )
        .route("/tenants/{tenant_id}/jobs/{unit_name}", get(job_handler))
        .route("/tenants/{tenant_id}/jobs/{unit_name}/logs", get(job_logs_handler))
        .with_state(Arc::new(state))
}

/// Cluster client from `kube`, or the simulated cluster when the config
/// allows it; missing credentials are fatal otherwise.
pub fn cluster_client(
    config: &WebConfig,
    kube: anyhow::Result<KubeConfig>,
) -> anyhow::Result<Arc<dyn ClusterApi>> {
    match kube {
        Ok(kube) => Ok(Arc::new(KubeClient::new(kube)?)),
        Err(err) if config.in_memory_fallback => {
            warn!(error = %err, "no cluster credentials, execution units are simulated in memory");
            Ok(Arc::new(InMemoryCluster::new()))
        }
        Err(err) => Err(err.context(
            "cluster credentials unavailable; set TXSCOUT_IN_MEMORY_FALLBACK=1 for local development",
        )),
    }
}

/// Wires Postgres and the cluster client from the environment and serves the API.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    let catalog = Arc::new(ScraperTypeCatalog::load(&config.catalog_path)?);

    let (scrapers, watermarks): (Arc<dyn ScraperRepository>, Arc<dyn WatermarkStore>) =
        match &config.database_url {
            Some(url) => {
                let repo = Arc::new(PgScraperRepository::new(PgPool::connect(url).await?));
                (repo.clone(), repo)
            }
            None if config.in_memory_fallback => {
                warn!("DATABASE_URL not set, scraper definitions live in memory");
                let repo = Arc::new(InMemoryScraperRepository::new());
                (repo.clone(), repo)
            }
            None => anyhow::bail!(
                "DATABASE_URL not set; set TXSCOUT_IN_MEMORY_FALLBACK=1 for local development"
            ),
        };

    let cluster = cluster_client(&config, KubeConfig::from_env())?;
    let orchestrator = Arc::new(OrchestratorConfig::from_env());

    let service = ScraperService::new(catalog, scrapers, watermarks, cluster, orchestrator);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "serving scraper API");
    axum::serve(listener, app(AppState::new(service))).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn scraper_types_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ScraperType>> {
    Json(state.service.scraper_types().to_vec())
}

async fn list_scrapers_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<Vec<ScraperView>>> {
    Ok(Json(state.service.list(&tenant_id).await?))
}

async fn create_scraper_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    Json(request): Json<UpsertScraperRequest>,
) -> ApiResult<(StatusCode, Json<ScraperView>)> {
    let draft = request.into_draft(tenant_id, None);
    let status = if draft.id.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(state.service.upsert(&draft).await?)))
}

async fn get_scraper_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, scraper_id)): Path<(String, Uuid)>,
) -> ApiResult<Json<ScraperView>> {
    Ok(Json(state.service.get(&tenant_id, scraper_id).await?))
}

async fn update_scraper_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, scraper_id)): Path<(String, Uuid)>,
    Json(request): Json<UpsertScraperRequest>,
) -> ApiResult<Json<ScraperView>> {
    let draft = request.into_draft(tenant_id, Some(scraper_id));
    Ok(Json(state.service.upsert(&draft).await?))
}

async fn delete_scraper_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, scraper_id)): Path<(String, Uuid)>,
) -> ApiResult<StatusCode> {
    state.service.delete(&tenant_id, scraper_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_tenant_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<TenantDeleted>> {
    let deleted_scrapers = state.service.delete_tenant(&tenant_id).await?;
    Ok(Json(TenantDeleted { deleted_scrapers }))
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, scraper_id)): Path<(String, Uuid)>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let job = state.service.trigger(&tenant_id, scraper_id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn schedule_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, scraper_id)): Path<(String, Uuid)>,
    Json(request): Json<ScheduleRequest>,
) -> ApiResult<Json<ScraperView>> {
    Ok(Json(
        state
            .service
            .set_schedule_enabled(&tenant_id, scraper_id, request.enabled)
            .await?,
    ))
}

async fn scraper_jobs_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, scraper_id)): Path<(String, Uuid)>,
) -> ApiResult<Json<Vec<JobView>>> {
    Ok(Json(state.service.jobs(&tenant_id, scraper_id).await?))
}

async fn job_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, unit_name)): Path<(String, String)>,
) -> ApiResult<Json<JobView>> {
    Ok(Json(state.service.job(&tenant_id, &unit_name).await?))
}

async fn job_logs_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, unit_name)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(
        state
            .service
            .logs(&tenant_id, &unit_name, query.page())
            .await?,
    ))
}

async fn get_watermark_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, scraper_id)): Path<(String, Uuid)>,
) -> ApiResult<Json<WatermarkBody>> {
    let date = state.service.last_scraped_date(&tenant_id, scraper_id).await?;
    Ok(Json(WatermarkBody { date }))
}

async fn set_watermark_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, scraper_id)): Path<(String, Uuid)>,
    Json(body): Json<WatermarkBody>,
) -> ApiResult<StatusCode> {
    let date = body
        .date
        .ok_or_else(|| ApiError::BadRequest("date is required".to_string()))?;
    state
        .service
        .set_last_scraped_date(&tenant_id, scraper_id, date)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use std::path::Path as FsPath;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let catalog = ScraperTypeCatalog::load(
            FsPath::new(env!("CARGO_MANIFEST_DIR")).join("../../scraper_types.yaml"),
        )
        .unwrap();
        let repo = Arc::new(InMemoryScraperRepository::new());
        let config = OrchestratorConfig {
            delete_timeout: Duration::from_millis(200),
            delete_poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let service = ScraperService::new(
            Arc::new(catalog),
            repo.clone(),
            repo,
            Arc::new(InMemoryCluster::new()),
            Arc::new(config),
        );
        app(AppState::new(service))
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn new_scraper(account: &str) -> serde_json::Value {
        serde_json::json!({
            "scraperTypeId": "fixture-ledger",
            "displayName": "Checking",
            "parameters": [
                {"parameterId": "account", "value": account},
                {"parameterId": "fixture-path", "value": "/data/statement.json"}
            ]
        })
    }

    async fn create(app: &Router) -> String {
        let resp = app
            .clone()
            .oneshot(json_request("POST", "/tenants/t1/scrapers", new_scraper("acc-1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        body_json(resp).await["id"].as_str().unwrap().to_string()
    }

    fn web_config(in_memory_fallback: bool) -> WebConfig {
        WebConfig {
            port: 0,
            database_url: None,
            catalog_path: PathBuf::from("scraper_types.yaml"),
            in_memory_fallback,
        }
    }

    #[test]
    fn missing_cluster_credentials_fail_startup_unless_fallback_enabled() {
        let err = cluster_client(&web_config(false), Err(anyhow::anyhow!("no service account")))
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("TXSCOUT_IN_MEMORY_FALLBACK"));

        assert!(cluster_client(&web_config(true), Err(anyhow::anyhow!("no service account"))).is_ok());
    }

    #[tokio::test]
    async fn lists_scraper_types() {
        let resp = test_app()
            .oneshot(empty_request("GET", "/scraper-types"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert!(body
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t["id"] == "fixture-ledger"));
    }

    #[tokio::test]
    async fn create_then_fetch_scraper() {
        let app = test_app();
        let id = create(&app).await;

        let resp = app
            .oneshot(empty_request("GET", &format!("/tenants/t1/scrapers/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["tenantId"], "t1");
        assert_eq!(body["scheduleEnabled"], false);
        assert_eq!(body["parameters"][0]["value"], "acc-1");
        assert!(body["unitName"].as_str().unwrap().starts_with("scraper-"));
    }

    #[tokio::test]
    async fn invalid_parameter_is_bad_request() {
        let mut payload = new_scraper("acc-1");
        payload["parameters"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({"parameterId": "pages", "value": "12.5"}));
        let resp = test_app()
            .oneshot(json_request("POST", "/tenants/t1/scrapers", payload))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "bad_request");
    }

    #[tokio::test]
    async fn unknown_scraper_is_not_found() {
        let resp = test_app()
            .oneshot(empty_request("GET", &format!("/tenants/t1/scrapers/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn trigger_lists_job_and_serves_empty_logs() {
        let app = test_app();
        let id = create(&app).await;

        let resp = app
            .clone()
            .oneshot(empty_request("POST", &format!("/tenants/t1/scrapers/{id}/trigger")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let job = body_json(resp).await;
        assert_eq!(job["trigger"], "manual");
        assert_eq!(job["status"], "pending");
        let unit = job["name"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(empty_request("GET", &format!("/tenants/t1/scrapers/{id}/jobs")))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 1);

        let resp = app
            .oneshot(empty_request("GET", &format!("/tenants/t1/jobs/{unit}/logs?page=0&pageSize=10")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn watermark_put_then_get_and_regression_conflicts() {
        let app = test_app();
        let id = create(&app).await;
        let uri = format!("/tenants/t1/scrapers/{id}/last-scraped-date");

        let resp = app
            .clone()
            .oneshot(json_request("PUT", &uri, serde_json::json!({"date": "2024-03-03"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app.clone().oneshot(empty_request("GET", &uri)).await.unwrap();
        assert_eq!(body_json(resp).await["date"], "2024-03-03");

        let resp = app
            .oneshot(json_request("PUT", &uri, serde_json::json!({"date": "2024-01-01"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn delete_scraper_and_tenant() {
        let app = test_app();
        let id = create(&app).await;

        let resp = app
            .clone()
            .oneshot(empty_request("DELETE", &format!("/tenants/t1/scrapers/{id}")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        create(&app).await;
        let resp = app.oneshot(empty_request("DELETE", "/tenants/t1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["deletedScrapers"], 1);
    }
}
