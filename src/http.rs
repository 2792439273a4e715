//! The `/db/:id` JSON HTTP surface: query, execute, transaction, and health
//! endpoints, grounded on axum's extractor/router style as used throughout
//! the example pack (notably `eardogger-rs`'s router assembly).

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sirannon_pool::{ExecuteResult, Row};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::api_error::ApiError;
use crate::state::{AppState, RequestContext};
use crate::wire::{last_insert_row_id_json, params_from_json};
use crate::ws::ws_upgrade_handler;

pub fn router(state: AppState) -> Router {
   let mut router = Router::new()
      .route("/db/:id", get(ws_upgrade_handler))
      .route("/db/:id/query", post(query_handler))
      .route("/db/:id/execute", post(execute_handler))
      .route("/db/:id/transaction", post(transaction_handler))
      .route("/health", get(health_handler))
      .route("/health/ready", get(health_ready_handler))
      // axum's own `Bytes`/`Json` extractors fall back to a silent 2 MiB
      // cap (a plain-text 413) unless disabled; `enforce_body_limit` below
      // is the sole body-size gate, so it always produces the same JSON
      // error envelope as every other rejection on this surface.
      .layer(DefaultBodyLimit::disable())
      .layer(middleware::from_fn_with_state(state.clone(), enforce_body_limit))
      .with_state(state.clone());

   if !state.settings.cors_origins.is_empty() {
      router = router.layer(cors_layer(&state.settings.cors_origins));
   }

   router
}

/// Buffer the request body up to `Settings::max_body_bytes`, replacing it
/// with the buffered bytes so downstream extractors see an ordinary body.
/// Overflow short-circuits with the same `{"error":{...}}` envelope every
/// other rejection on this surface uses, instead of tower-http/axum's bare
/// default 413 response.
async fn enforce_body_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
   let limit = state.settings.max_body_bytes;
   let (parts, body) = request.into_parts();
   match axum::body::to_bytes(body, limit).await {
      Ok(bytes) => next.run(Request::from_parts(parts, Body::from(bytes))).await,
      Err(_) => ApiError::new("PAYLOAD_TOO_LARGE", "request body exceeds the maximum allowed size").into_response(),
   }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
   let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
   CorsLayer::new()
      .allow_origin(AllowOrigin::list(parsed))
      .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
      .allow_headers(tower_http::cors::Any)
}

#[derive(Deserialize)]
struct SqlStatement {
   sql: Option<String>,
   #[serde(default)]
   params: Option<JsonValue>,
}

#[derive(Serialize)]
struct QueryResponse {
   rows: Vec<Row>,
}

#[derive(Serialize)]
struct ExecuteResponse {
   changes: u64,
   #[serde(rename = "lastInsertRowId")]
   last_insert_row_id: JsonValue,
}

impl From<ExecuteResult> for ExecuteResponse {
   fn from(result: ExecuteResult) -> Self {
      Self { changes: result.changes, last_insert_row_id: last_insert_row_id_json(result.last_insert_rowid) }
   }
}

#[derive(Deserialize)]
struct TransactionRequest {
   statements: Vec<SqlStatement>,
}

#[derive(Serialize)]
struct TransactionResponse {
   results: Vec<ExecuteResponse>,
}

async fn check_hook_and_get_db(
   state: &AppState,
   method: &Method,
   path: &str,
   id: &str,
) -> Result<Arc<sirannon_core::Database>, Response> {
   let ctx = RequestContext { database_id: id.to_string(), method: method.to_string(), path: path.to_string() };
   if let Err(denial) = state.check_on_request(&ctx) {
      return Err((denial.status, Json(serde_json::json!({ "error": { "code": denial.code, "message": denial.message } }))).into_response());
   }

   match state.registry.get(id).await {
      Some(db) => Ok(db),
      None => Err(ApiError::from(&sirannon_core::Error::DatabaseNotFound(id.to_string())).into_response()),
   }
}

fn parse_body<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, ApiError> {
   if body.is_empty() {
      return Err(ApiError::empty_body());
   }
   serde_json::from_slice(body).map_err(|e| ApiError::invalid_json(e.to_string()))
}

async fn query_handler(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> Response {
   let db = match check_hook_and_get_db(&state, &Method::POST, "/db/:id/query", &id).await {
      Ok(db) => db,
      Err(resp) => return resp,
   };

   let statement: SqlStatement = match parse_body(&body) {
      Ok(s) => s,
      Err(err) => return err.into_response(),
   };
   let Some(sql) = statement.sql else {
      return ApiError::invalid_request("missing \"sql\" field").into_response();
   };
   let params = match params_from_json(statement.params) {
      Ok(p) => p,
      Err(err) => return err.into_response(),
   };

   match db.query(&sql, params).await {
      Ok(rows) => Json(QueryResponse { rows }).into_response(),
      Err(err) => ApiError::from(&err).into_response(),
   }
}

async fn execute_handler(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> Response {
   let db = match check_hook_and_get_db(&state, &Method::POST, "/db/:id/execute", &id).await {
      Ok(db) => db,
      Err(resp) => return resp,
   };

   let statement: SqlStatement = match parse_body(&body) {
      Ok(s) => s,
      Err(err) => return err.into_response(),
   };
   let Some(sql) = statement.sql else {
      return ApiError::invalid_request("missing \"sql\" field").into_response();
   };
   let params = match params_from_json(statement.params) {
      Ok(p) => p,
      Err(err) => return err.into_response(),
   };

   match db.execute(&sql, params).await {
      Ok(result) => Json(ExecuteResponse::from(result)).into_response(),
      Err(err) => ApiError::from(&err).into_response(),
   }
}

async fn transaction_handler(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> Response {
   let db = match check_hook_and_get_db(&state, &Method::POST, "/db/:id/transaction", &id).await {
      Ok(db) => db,
      Err(resp) => return resp,
   };

   let request: TransactionRequest = match parse_body(&body) {
      Ok(r) => r,
      Err(err) => return err.into_response(),
   };
   if request.statements.is_empty() {
      return ApiError::invalid_request("\"statements\" must not be empty").into_response();
   }

   let mut prepared = Vec::with_capacity(request.statements.len());
   for (index, statement) in request.statements.into_iter().enumerate() {
      let Some(sql) = statement.sql else {
         return ApiError::invalid_request(format!("missing \"sql\" field at index {index}")).into_response();
      };
      let params = match params_from_json(statement.params) {
         Ok(p) => p,
         Err(err) => return err.into_response(),
      };
      prepared.push((sql, params));
   }

   let outcome = db
      .transaction(move |tx| {
         Box::pin(async move {
            let mut results = Vec::with_capacity(prepared.len());
            for (sql, params) in &prepared {
               let result = tx.execute(sql, params).await?;
               results.push(ExecuteResponse::from(result));
            }
            Ok(results)
         })
      })
      .await;

   match outcome {
      Ok(results) => Json(TransactionResponse { results }).into_response(),
      Err(err) => {
         let mut api_err = ApiError::from(&err);
         if api_err.code == "QUERY_ERROR" {
            api_err.code = "TRANSACTION_ERROR";
         }
         api_err.into_response()
      }
   }
}

#[derive(Serialize)]
struct HealthResponse {
   status: &'static str,
}

async fn health_handler() -> Response {
   Json(HealthResponse { status: "ok" }).into_response()
}

#[derive(Serialize)]
struct DatabaseHealth {
   id: String,
   #[serde(rename = "readOnly")]
   read_only: bool,
   closed: bool,
}

#[derive(Serialize)]
struct ReadyResponse {
   status: &'static str,
   databases: Vec<DatabaseHealth>,
}

async fn health_ready_handler(State(state): State<AppState>) -> Response {
   let databases = state.registry.snapshot_health().await;
   let status = if databases.iter().any(|d| d.1) { "degraded" } else { "ok" };
   let databases = databases
      .into_iter()
      .map(|(id, closed, read_only)| DatabaseHealth { id, read_only, closed })
      .collect();
   Json(ReadyResponse { status, databases }).into_response()
}

#[cfg(test)]
mod tests {
   use super::*;
   use axum::http::{Request, StatusCode};
   use sirannon_core::{DatabaseOptions, Registry, RegistryConfig};
   use tower::ServiceExt;

   async fn test_state(dir: &tempfile::TempDir, max_body_bytes: usize) -> AppState {
      let registry = Registry::new(RegistryConfig::default());
      registry.open("t", dir.path().join("t.db"), DatabaseOptions::default()).await.unwrap();

      let mut settings = crate::settings::Settings::default();
      settings.base_dir = dir.path().to_path_buf();
      settings.max_body_bytes = max_body_bytes;
      AppState::new(registry, settings)
   }

   #[tokio::test]
   async fn oversized_body_gets_json_payload_too_large_envelope() {
      let dir = tempfile::tempdir().unwrap();
      let state = test_state(&dir, 16).await;
      let app = router(state);

      let body = serde_json::json!({ "sql": "SELECT 1 AS a, 2 AS b, 3 AS c" }).to_string();
      assert!(body.len() > 16, "fixture body must exceed the configured limit");

      let request = Request::builder()
         .method("POST")
         .uri("/db/t/query")
         .header("content-type", "application/json")
         .body(Body::from(body))
         .unwrap();

      let response = app.oneshot(request).await.unwrap();
      assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

      let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
      let json: JsonValue = serde_json::from_slice(&bytes).unwrap();
      assert_eq!(json["error"]["code"], "PAYLOAD_TOO_LARGE");
   }

   #[tokio::test]
   async fn body_within_limit_reaches_the_handler() {
      let dir = tempfile::tempdir().unwrap();
      let state = test_state(&dir, 1024 * 1024).await;
      let app = router(state);

      let request = Request::builder()
         .method("POST")
         .uri("/db/t/query")
         .header("content-type", "application/json")
         .body(Body::from(serde_json::json!({ "sql": "SELECT 1 AS a" }).to_string()))
         .unwrap();

      let response = app.oneshot(request).await.unwrap();
      assert_eq!(response.status(), StatusCode::OK);
   }
}

