use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use credential_ledger_api::{CredentialLedgerApi, MigrateResult, API_CONTRACT_VERSION};
use credential_ledger_core::{InvokePayload, LedgerError};
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: CredentialLedgerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct InvokeRequest {
    operation: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "credential-ledger-service")]
#[command(about = "Local HTTP service for the credential ledger")]
struct Args {
    #[arg(long, default_value = "./credential_ledger.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn service_error(err: &anyhow::Error) -> ServiceError {
    // Domain errors keep their kind across the anyhow boundary; everything
    // else is a bad request.
    let status = match err.downcast_ref::<LedgerError>() {
        Some(LedgerError::NotFound(_)) => StatusCode::NOT_FOUND,
        Some(LedgerError::Unauthorized { .. }) => StatusCode::FORBIDDEN,
        Some(LedgerError::AlreadyExists(_) | LedgerError::PartialFailure { .. }) => {
            StatusCode::CONFLICT
        }
        Some(LedgerError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        Some(LedgerError::InvalidArgument(_) | LedgerError::UnknownOperation(_)) | None => {
            StatusCode::BAD_REQUEST
        }
    };
    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: err.to_string(),
        status,
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/invoke", post(invoke))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = ServiceState { api: CredentialLedgerApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<credential_ledger_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn invoke(
    State(state): State<ServiceState>,
    Json(request): Json<InvokeRequest>,
) -> Result<Json<ServiceEnvelope<InvokePayload>>, ServiceError> {
    let payload = state
        .api
        .invoke(&request.operation, &request.args)
        .map_err(|err| service_error(&err))?;
    Ok(Json(envelope(payload)))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("credential-ledger-service-{}.sqlite3", ulid::Ulid::new()))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn invoke_request(operation: &str, args: &[&str]) -> Request<axum::body::Body> {
        let payload = serde_json::json!({
            "operation": operation,
            "args": args,
        });
        Request::builder()
            .uri("/v1/invoke")
            .method("POST")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(payload.to_string()))
            .unwrap_or_else(|err| panic!("failed to build invoke request: {err}"))
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = ServiceState { api: CredentialLedgerApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/health")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let state = ServiceState { api: CredentialLedgerApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/openapi")
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/invoke"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn invoke_flow_creates_and_reads_a_record() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: CredentialLedgerApi::new(db_path.clone()) };
        let router = app(state);

        let create_response = match router
            .clone()
            .oneshot(invoke_request(
                "initRecord",
                &[
                    "32",
                    "Dylan",
                    "Bryan",
                    "200049641",
                    "North Carolina State University",
                    "Bachelor of Science in Computer Science",
                    "4.0",
                    "4.0",
                    "dbryan@ncsu.edu",
                ],
            ))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("create request failed: {err}"),
        };
        assert_eq!(create_response.status(), StatusCode::OK);
        let create_value = response_json(create_response).await;
        assert_eq!(create_value.get("data"), Some(&serde_json::Value::Null));

        let read_response = match router
            .oneshot(invoke_request("readRecord", &["32", "DBryan@ncsu.edu"]))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("read request failed: {err}"),
        };
        assert_eq!(read_response.status(), StatusCode::OK);
        let read_value = response_json(read_response).await;
        assert_eq!(
            read_value
                .get("data")
                .and_then(|data| data.get("firstName"))
                .and_then(serde_json::Value::as_str),
            Some("dylan")
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn invoke_failures_map_domain_kinds_to_statuses() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: CredentialLedgerApi::new(db_path.clone()) };
        let router = app(state);

        let unknown = match router
            .clone()
            .oneshot(invoke_request("transferRecord", &["1"]))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("unknown-operation request failed: {err}"),
        };
        assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);

        let missing = match router
            .clone()
            .oneshot(invoke_request("readRecord", &["404", "alice"]))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("missing-record request failed: {err}"),
        };
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let created = match router
            .clone()
            .oneshot(invoke_request(
                "initRecord",
                &["5", "Dylan", "Bryan", "200049641", "NCSU", "BSc", "4.0", "4.0", "alice"],
            ))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("create request failed: {err}"),
        };
        assert_eq!(created.status(), StatusCode::OK);

        let forbidden = match router
            .oneshot(invoke_request("readRecord", &["5", "eve"]))
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("forbidden request failed: {err}"),
        };
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let _ = std::fs::remove_file(&db_path);
    }
}
