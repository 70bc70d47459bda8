use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use scamper_notes_api::{
    scamper_field_descriptors, ApiError, DeleteConfirmation, NotesApi, ScamperFieldDescriptor,
    API_CONTRACT_VERSION,
};
use scamper_notes_core::{
    InMemoryStore, Note, NoteId, NoteStore, NoteWithScamper, ScamperData, ValidationIssue,
};
use scamper_notes_store_sqlite::SqliteStore;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: NotesApi,
}

/// Error body: a short message plus field-level issues for validation failures.
#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service_contract_version: &'static str,
    api_contract_version: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "scamper-notes-service")]
#[command(about = "HTTP service for notes with SCAMPER worksheets")]
struct Args {
    #[arg(long, env = "SCAMPER_NOTES_BIND", default_value = "127.0.0.1:5000")]
    bind: SocketAddr,
    /// SQLite database file. Without it notes live in memory for the life of the process.
    #[arg(long, env = "SCAMPER_NOTES_DB")]
    db: Option<PathBuf>,
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_filter: String,
}

impl From<ApiError> for ServiceError {
    fn from(err: ApiError) -> Self {
        let status = match &err {
            ApiError::InvalidId(_) | ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unexpected { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self { status, message: err.to_string(), errors: err.issues().to_vec() }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

type ServiceResult<T> = Result<T, ServiceError>;

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/openapi", get(openapi))
        .route("/api/scamper/fields", get(scamper_fields))
        .route("/api/notes", get(list_notes).post(create_note))
        .route("/api/notes/:id", get(get_note).patch(update_note).delete(delete_note))
        .route("/api/notes/:id/scamper", get(get_scamper).post(save_scamper))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

fn init_tracing(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .with_context(|| format!("invalid log filter `{filter}`"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn open_store(db: Option<&std::path::Path>) -> Result<Arc<dyn NoteStore>> {
    match db {
        Some(path) => {
            let store = SqliteStore::open_migrated(path)?;
            tracing::info!(db = %path.display(), "using sqlite store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("using in-memory store; notes are lost on exit");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_filter)?;

    let state = ServiceState { api: NotesApi::new(open_store(args.db.as_deref())?) };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "scamper notes service listening");

    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("scamper notes service stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    tracing::info!(%method, %path, status = response.status().as_u16(), elapsed_ms, "request");
    response
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
    })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn scamper_fields() -> Json<Vec<ScamperFieldDescriptor>> {
    Json(scamper_field_descriptors())
}

async fn list_notes(State(state): State<ServiceState>) -> ServiceResult<Json<Vec<NoteWithScamper>>> {
    Ok(Json(state.api.list_notes()?))
}

async fn get_note(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> ServiceResult<Json<NoteWithScamper>> {
    Ok(Json(state.api.get_note(&id)?))
}

/// A request that sends no body at all reads as `{}`. Bodies that are present
/// but not JSON stay rejected.
fn json_body(
    headers: &HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Value, JsonRejection> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(JsonRejection::MissingJsonContentType(_)) if sends_no_body(headers) => {
            Ok(Value::Object(Map::new()))
        }
        Err(rejection) => Err(rejection),
    }
}

fn sends_no_body(headers: &HeaderMap) -> bool {
    !headers.contains_key(header::CONTENT_TYPE)
        && !headers.contains_key(header::TRANSFER_ENCODING)
        && !matches!(headers.get(header::CONTENT_LENGTH), Some(length) if length.as_bytes() != b"0")
}

async fn create_note(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<(StatusCode, Json<Note>)> {
    let body = json_body(&headers, body)
        .map_err(|rejection| ApiError::unreadable_note_body(rejection.body_text()))?;
    Ok((StatusCode::CREATED, Json(state.api.create_note(&body)?)))
}

async fn update_note(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<Json<Note>> {
    let body = match json_body(&headers, body) {
        Ok(body) => body,
        Err(rejection) => {
            id.parse::<NoteId>().map_err(ApiError::InvalidId)?;
            return Err(ApiError::unreadable_note_body(rejection.body_text()).into());
        }
    };
    Ok(Json(state.api.update_note(&id, &body)?))
}

async fn delete_note(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> ServiceResult<Json<DeleteConfirmation>> {
    Ok(Json(state.api.delete_note(&id)?))
}

async fn get_scamper(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
) -> ServiceResult<Json<ScamperData>> {
    Ok(Json(state.api.get_scamper(&id)?))
}

async fn save_scamper(
    State(state): State<ServiceState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<Value>, JsonRejection>,
) -> ServiceResult<Json<ScamperData>> {
    let body = match json_body(&headers, body) {
        Ok(body) => body,
        Err(rejection) => {
            state.api.existing_note_for_scamper(&id)?;
            return Err(ApiError::unreadable_scamper_body(rejection.body_text()).into());
        }
    };
    Ok(Json(state.api.save_scamper(&id, &body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use scamper_notes_core::{NewNote, NotePatch, ScamperPatch, StoreError};
    use tower::ServiceExt;

    struct FailingStore;

    fn boom<T>() -> Result<T, StoreError> {
        Err(StoreError::Backend("database is locked".to_string()))
    }

    impl NoteStore for FailingStore {
        fn list_notes(&self) -> Result<Vec<NoteWithScamper>, StoreError> {
            boom()
        }
        fn get_note(&self, _id: NoteId) -> Result<Option<NoteWithScamper>, StoreError> {
            boom()
        }
        fn create_note(&self, _fields: NewNote) -> Result<Note, StoreError> {
            boom()
        }
        fn update_note(&self, _id: NoteId, _patch: NotePatch) -> Result<Option<Note>, StoreError> {
            boom()
        }
        fn delete_note(&self, _id: NoteId) -> Result<bool, StoreError> {
            boom()
        }
        fn get_scamper_data(&self, _note_id: NoteId) -> Result<Option<ScamperData>, StoreError> {
            boom()
        }
        fn upsert_scamper_data(
            &self,
            _note_id: NoteId,
            _patch: ScamperPatch,
        ) -> Result<Option<ScamperData>, StoreError> {
            boom()
        }
    }

    fn memory_router() -> Router {
        app(ServiceState { api: NotesApi::in_memory() })
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder().uri(uri).method(method);
        let body = match body {
            Some(raw) => {
                builder = builder.header("content-type", "application/json");
                Body::from(raw.to_string())
            }
            None => Body::empty(),
        };
        let request = builder
            .body(body)
            .unwrap_or_else(|err| panic!("failed to build {method} {uri} request: {err}"));

        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={}", String::from_utf8_lossy(&bytes)),
        };
        (status, value)
    }

    fn field<'a>(value: &'a Value, key: &str) -> &'a Value {
        value.get(key).unwrap_or_else(|| panic!("missing `{key}` in payload: {value}"))
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (status, value) = send(&memory_router(), "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&value, "status"), "ok");
        assert_eq!(field(&value, "service_contract_version"), SERVICE_CONTRACT_VERSION);
    }

    #[tokio::test]
    async fn openapi_document_lists_every_route() {
        let response = match memory_router()
            .oneshot(
                Request::builder()
                    .uri("/api/openapi")
                    .method("GET")
                    .body(Body::empty())
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
        let document: serde_yaml::Value = match serde_yaml::from_slice(&bytes) {
            Ok(document) => document,
            Err(err) => panic!("openapi body is not YAML: {err}"),
        };
        assert_eq!(document["info"]["version"].as_str(), Some(SERVICE_CONTRACT_VERSION));
        for path in ["/api/notes", "/api/notes/{id}", "/api/notes/{id}/scamper", "/api/health"] {
            assert!(!document["paths"][path].is_null(), "openapi is missing {path}");
        }
    }

    #[tokio::test]
    async fn note_and_worksheet_flow_round_trip() {
        let router = memory_router();

        let (status, created) = send(&router, "POST", "/api/notes", Some(r#"{"title":"Bike"}"#)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(field(&created, "id"), 1);
        assert_eq!(field(&created, "content"), "");

        let (status, fresh) = send(&router, "GET", "/api/notes/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&fresh, "scamperProgress"), 0);
        assert!(fresh.get("scamper").is_none());

        let (status, saved) = send(
            &router,
            "POST",
            "/api/notes/1/scamper",
            Some(r#"{"substitute":"carbon frame","eliminate":"chain"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&saved, "noteId"), 1);
        assert_eq!(field(&saved, "putToOtherUse"), "");

        let (_, merged) =
            send(&router, "POST", "/api/notes/1/scamper", Some(r#"{"combine":"trailer"}"#)).await;
        assert_eq!(field(&merged, "id"), field(&saved, "id"));
        assert_eq!(field(&merged, "substitute"), "carbon frame");

        let (status, joined) = send(&router, "GET", "/api/notes/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&joined, "scamperProgress"), 3);
        assert_eq!(field(field(&joined, "scamper"), "combine"), "trailer");

        let (status, patched) = send(&router, "PATCH", "/api/notes/1", Some(r#"{"content":"notes"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&patched, "title"), "Bike");
        assert_eq!(field(&patched, "content"), "notes");

        let (status, deleted) = send(&router, "DELETE", "/api/notes/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&deleted, "message"), "Note deleted successfully");

        let (status, missing) = send(&router, "GET", "/api/notes/1/scamper", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(field(&missing, "message"), "SCAMPER data not found");

        let (status, _) = send(&router, "DELETE", "/api/notes/1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_returns_newest_first() {
        let router = memory_router();
        for title in ["first", "second", "third"] {
            let body = serde_json::json!({ "title": title }).to_string();
            let (status, _) = send(&router, "POST", "/api/notes", Some(&body)).await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (status, listed) = send(&router, "GET", "/api/notes", None).await;
        assert_eq!(status, StatusCode::OK);
        let titles = listed
            .as_array()
            .unwrap_or_else(|| panic!("expected array, got {listed}"))
            .iter()
            .map(|note| field(note, "title").as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn invalid_ids_and_bodies_are_bad_requests() {
        let router = memory_router();

        let (status, value) = send(&router, "GET", "/api/notes/abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(field(&value, "message"), "Invalid note ID");

        let (status, value) = send(&router, "POST", "/api/notes", Some(r#"{"title":42}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(field(&value, "message"), "Invalid note data");
        assert_eq!(field(&value, "errors")[0]["path"][0], "title");

        let (status, value) = send(&router, "POST", "/api/notes", Some("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(field(&value, "errors")[0]["code"], "invalid_json");

        let (status, value) = send(&router, "PATCH", "/api/notes/x", Some("{not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(field(&value, "message"), "Invalid note ID");
    }

    #[tokio::test]
    async fn requests_without_a_body_read_as_empty_objects() {
        let router = memory_router();
        let (status, created) =
            send(&router, "POST", "/api/notes", Some(r#"{"title":"Bike","content":"commute"}"#)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, patched) = send(&router, "PATCH", "/api/notes/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&patched, "title"), "Bike");
        assert_eq!(field(&patched, "content"), "commute");
        assert_eq!(field(&patched, "createdAt"), field(&created, "createdAt"));

        let (status, saved) = send(&router, "POST", "/api/notes/1/scamper", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&saved, "noteId"), 1);
        assert_eq!(field(&saved, "substitute"), "");

        let (status, joined) = send(&router, "GET", "/api/notes/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(field(&joined, "scamperProgress"), 0);
        assert!(joined.get("scamper").is_some());

        let (status, missing) = send(&router, "POST", "/api/notes/2/scamper", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(field(&missing, "message"), "Note not found");
    }

    #[tokio::test]
    async fn bodies_without_json_content_type_are_still_rejected() {
        let router = memory_router();
        let (status, _) = send(&router, "POST", "/api/notes", Some("{}")).await;
        assert_eq!(status, StatusCode::CREATED);

        let request = Request::builder()
            .uri("/api/notes/1/scamper")
            .method("POST")
            .header("content-length", "17")
            .body(Body::from(r#"{"adapt":"x"}    "#))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (status, value) = send(&router, "PATCH", "/api/notes/1", Some("not json")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(field(&value, "message"), "Invalid note data");
        assert_eq!(field(&value, "errors")[0]["code"], "invalid_json");
    }

    #[tokio::test]
    async fn worksheet_for_missing_note_is_not_found_even_with_bad_body() {
        let router = memory_router();

        let (status, value) = send(&router, "POST", "/api/notes/9/scamper", Some("[oops")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(field(&value, "message"), "Note not found");

        let (status, _) = send(&router, "POST", "/api/notes", Some("{}")).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, value) = send(&router, "POST", "/api/notes/1/scamper", Some(r#"{"adapt":7}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(field(&value, "message"), "Invalid SCAMPER data");
    }

    #[tokio::test]
    async fn store_failures_map_to_internal_errors_without_detail() {
        let router = app(ServiceState { api: NotesApi::new(Arc::new(FailingStore)) });

        let (status, value) = send(&router, "GET", "/api/notes", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(field(&value, "message"), "Failed to fetch notes");
        assert!(!value.to_string().contains("locked"));

        let (status, value) = send(&router, "POST", "/api/notes", Some("{}")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(field(&value, "message"), "Failed to create note");
    }

    #[tokio::test]
    async fn scamper_fields_endpoint_lists_prompts() {
        let (status, value) = send(&memory_router(), "GET", "/api/scamper/fields", None).await;
        assert_eq!(status, StatusCode::OK);
        let fields = value.as_array().unwrap_or_else(|| panic!("expected array, got {value}"));
        assert_eq!(fields.len(), 7);
        assert_eq!(field(&fields[4], "key"), "putToOtherUse");
        assert_eq!(field(&fields[4], "label"), "Put to Other Use");
    }
}
