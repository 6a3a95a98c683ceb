//! HTTP surface for the assistant plugin.
//!
//! - `POST /load-data`  : build a dataset from a folder
//! - `POST /query-data` : top-k passages for a query
//! - `POST /get-db-info`: `db_path` / `folder_path` of a dataset

use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::ingest::Ingestor;
use crate::registry::MetadataRegistry;
use crate::retriever::{DEFAULT_TOP_K, Retriever};

pub struct AppState {
    pub registry: Arc<MetadataRegistry>,
    pub ingestor: Ingestor,
    pub retriever: Retriever,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoadDataRequest {
    folder_path: Option<String>,
    dataset_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryDataRequest {
    query: Option<String>,
    dataset_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DbInfoRequest {
    dataset_name: Option<String>,
    query_type: Option<String>,
}

pub fn router(state: Arc<AppState>, allowed_origin: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    let cors = match HeaderValue::from_str(allowed_origin) {
        Ok(origin) => cors.allow_origin(origin),
        Err(_) => {
            warn!(origin = %allowed_origin, "invalid ALLOWED_ORIGIN, allowing any origin");
            cors.allow_origin(Any)
        }
    };

    Router::new()
        .route("/load-data", post(load_data))
        .route("/query-data", post(query_data))
        .route("/get-db-info", post(get_db_info))
        .layer(cors)
        .with_state(state)
}

fn required(value: Option<String>) -> String {
    value.unwrap_or_default()
}

async fn load_data(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoadDataRequest>,
) -> Result<String, ServiceError> {
    let folder_path = required(request.folder_path);
    let dataset_name = required(request.dataset_name);
    info!(dataset = %dataset_name, folder = %folder_path, "load-data");

    let summary = state.ingestor.ingest(&folder_path, &dataset_name).await?;
    debug!(
        dataset = %summary.dataset,
        location = %summary.index_location.display(),
        files = summary.files_loaded,
        skipped = summary.files_failed,
        segments = summary.segments,
        "load-data done"
    );
    Ok(format!("Database for {} created successfully!", summary.dataset))
}

async fn query_data(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryDataRequest>,
) -> Result<String, ServiceError> {
    let query = required(request.query);
    let dataset_name = required(request.dataset_name);

    state.retriever.query(&dataset_name, &query, DEFAULT_TOP_K).await
}

async fn get_db_info(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DbInfoRequest>,
) -> Result<Json<Value>, ServiceError> {
    let dataset_name = required(request.dataset_name);
    let query_type = required(request.query_type);
    if dataset_name.is_empty() || query_type.is_empty() {
        warn!("Both 'dataset_name' and 'query_type' are required.");
        return Err(ServiceError::Precondition(
            "Both 'dataset_name' and 'query_type' are required.".to_string(),
        ));
    }

    let Some(record) = state.registry.get(&dataset_name).await else {
        warn!(dataset = %dataset_name, "No database found");
        return Err(ServiceError::NotFound(format!("No database found for {dataset_name}")));
    };
    let Some(value) = record.field(&query_type) else {
        warn!(dataset = %dataset_name, query_type = %query_type, "field not found");
        return Err(ServiceError::NotFound(format!("No {query_type} found for {dataset_name}")));
    };

    Ok(Json(json!({ query_type: value })))
}
