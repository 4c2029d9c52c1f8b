//! REST endpoint handlers.
//!
//! Every mutating handler validates inputs, enforces the state-machine
//! guard, mutates the registry where needed, spawns the background
//! workflow, and returns immediately. Workflow errors never reach a
//! response; they land on the store record.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use storekeeper_core::audit::AuditEntry;
use storekeeper_core::lock::OperationKind;
use storekeeper_core::store::{AuditAction, EngineKind, Store, StoreStatus};

use super::error::ApiError;
use crate::state::SharedState;

/// `GET /api/health` response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `ok` when the process answers.
    pub status: &'static str,
    /// Server time.
    pub timestamp: DateTime<Utc>,
    /// Deployment environment name.
    pub environment: String,
}

/// `GET /api/stores` response.
#[derive(Debug, Serialize)]
pub struct StoresResponse {
    /// All stores, newest first.
    pub stores: Vec<Store>,
}

/// Store record plus its in-flight operation, if any.
#[derive(Debug, Serialize)]
pub struct StoreDetail {
    /// The persisted record.
    #[serde(flatten)]
    pub store: Store,
    /// Operation currently running against the store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationKind>,
}

/// `GET /api/stores/:id` response.
#[derive(Debug, Serialize)]
pub struct StoreDetailResponse {
    /// The store with live operation state.
    pub store: StoreDetail,
}

/// `POST /api/stores` response.
#[derive(Debug, Serialize)]
pub struct StoreCreatedResponse {
    /// The freshly queued store.
    pub store: Store,
}

/// `POST /api/stores` request body.
#[derive(Debug, Deserialize)]
pub struct CreateStoreRequest {
    /// Display name, 2-100 characters after trim.
    pub name: Option<String>,
    /// Engine tag; defaults to `woocommerce`.
    pub engine: Option<String>,
}

/// Accepted-for-processing response of delete and retry.
#[derive(Debug, Serialize)]
pub struct OperationAccepted {
    /// Human-readable confirmation.
    pub message: &'static str,
    /// Target store id.
    #[serde(rename = "storeId")]
    pub store_id: String,
}

/// `GET /api/audit` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    /// Entry cap, clamped to `[1, 500]`, default 100.
    pub limit: Option<i64>,
}

/// Audit listing response.
#[derive(Debug, Serialize)]
pub struct AuditResponse {
    /// Entries, newest first.
    pub audit: Vec<AuditEntry>,
}

/// `GET /api/metrics` response.
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    /// Store population.
    pub stores: StoresMetrics,
    /// Provisioning timings.
    pub provisioning: ProvisioningMetrics,
    /// Most recent failures.
    #[serde(rename = "recentFailures")]
    pub recent_failures: Vec<FailureSummary>,
}

/// Store counts by status.
#[derive(Debug, Serialize)]
pub struct StoresMetrics {
    /// All stores ever recorded (including deleted).
    pub total: u64,
    /// Count per status.
    #[serde(rename = "byStatus")]
    pub by_status: BTreeMap<String, u64>,
}

/// Aggregate provisioning timings over ready stores.
#[derive(Debug, Serialize)]
pub struct ProvisioningMetrics {
    /// Number of ready stores.
    #[serde(rename = "totalProvisioned")]
    pub total_provisioned: u64,
    /// Mean seconds from creation to ready.
    #[serde(rename = "avgDurationSeconds")]
    pub avg_duration_seconds: Option<f64>,
    /// Fastest, seconds.
    #[serde(rename = "minDurationSeconds")]
    pub min_duration_seconds: Option<f64>,
    /// Slowest, seconds.
    #[serde(rename = "maxDurationSeconds")]
    pub max_duration_seconds: Option<f64>,
}

/// One entry of the recent-failures metric.
#[derive(Debug, Serialize)]
pub struct FailureSummary {
    /// Store id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Why it failed.
    pub error_message: Option<String>,
    /// When it failed.
    pub updated_at: DateTime<Utc>,
}

impl From<Store> for FailureSummary {
    fn from(store: Store) -> Self {
        Self {
            id: store.id,
            name: store.name,
            error_message: store.error_message,
            updated_at: store.updated_at,
        }
    }
}

/// `GET /api/health`
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        environment: state.config.environment.clone(),
    })
}

/// `GET /api/stores`
pub async fn list_stores(
    State(state): State<SharedState>,
) -> Result<Json<StoresResponse>, ApiError> {
    let stores = state
        .registry
        .list()
        .map_err(|e| internal(&state, &e))?;
    Ok(Json(StoresResponse { stores }))
}

/// `GET /api/stores/:id`
pub async fn get_store(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<StoreDetailResponse>, ApiError> {
    let store = fetch_store(&state, &id)?;
    let operation = state.lock.get(&id);
    Ok(Json(StoreDetailResponse {
        store: StoreDetail { store, operation },
    }))
}

/// `POST /api/stores`
///
/// Validates the body, enforces quota, inserts the record at `queued`, and
/// fires the provision workflow in the background.
pub async fn create_store(
    State(state): State<SharedState>,
    payload: Result<Json<CreateStoreRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StoreCreatedResponse>), ApiError> {
    let Json(payload) = payload.map_err(|e| ApiError::invalid_json(e.body_text()))?;

    let name = payload.name.unwrap_or_default();
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::missing_store_name());
    }
    let length = name.chars().count();
    if !(2..=100).contains(&length) {
        return Err(ApiError::invalid_store_name());
    }

    let engine_raw = payload
        .engine
        .unwrap_or_else(|| EngineKind::Woocommerce.as_str().to_string());
    let kind: EngineKind = engine_raw
        .parse()
        .map_err(|_| ApiError::invalid_engine(&engine_raw))?;
    let engine = state
        .engines
        .get(kind)
        .ok_or_else(|| ApiError::invalid_engine(&engine_raw))?;
    let validation = engine.validate();
    if !validation.valid {
        return Err(ApiError::engine_unavailable(
            validation
                .error
                .unwrap_or_else(|| format!("Engine {engine_raw} is unavailable")),
        ));
    }

    let active = state
        .registry
        .active_count()
        .map_err(|e| internal(&state, &e))?;
    if active >= state.config.max_stores {
        return Err(ApiError::quota_exceeded(state.config.max_stores));
    }

    let store = state
        .registry
        .create(name, kind)
        .map_err(|e| internal(&state, &e))?;

    spawn_provision(&state, store.id.clone());
    Ok((StatusCode::CREATED, Json(StoreCreatedResponse { store })))
}

/// `DELETE /api/stores/:id`
///
/// Accepted from any non-terminal status that is not already deleting -
/// including `provisioning`, whose workflow the delete takes over from
/// once it releases the store's lock. The delete workflow runs in the
/// background.
pub async fn delete_store(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<OperationAccepted>), ApiError> {
    let store = fetch_store(&state, &id)?;

    match store.status {
        StoreStatus::Deleted | StoreStatus::Deleting => {
            return Err(ApiError::invalid_state_transition(format!(
                "Cannot delete store in status {}",
                store.status
            )));
        }
        StoreStatus::Queued
        | StoreStatus::Provisioning
        | StoreStatus::Ready
        | StoreStatus::Failed => {}
    }
    if state.lock.get(&id) == Some(OperationKind::Deleting) {
        return Err(ApiError::operation_in_progress(format!(
            "Deletion already in progress for store {id}"
        )));
    }

    let provisioner = Arc::clone(&state.provisioner);
    let store_id = store.id.clone();
    tokio::spawn(async move {
        provisioner.delete(&store_id).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(OperationAccepted {
            message: "Store deletion initiated",
            store_id: store.id,
        }),
    ))
}

/// `POST /api/stores/:id/retry`
///
/// Valid only from `failed` with no active operation. Re-runs the
/// provision workflow from the top; the deployer's release-exists check
/// keeps the install idempotent.
pub async fn retry_store(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<OperationAccepted>), ApiError> {
    let store = fetch_store(&state, &id)?;

    if store.status != StoreStatus::Failed {
        return Err(ApiError::invalid_state_transition(format!(
            "Can only retry failed stores, current status: {}",
            store.status
        )));
    }
    if let Some(active) = state.lock.get(&id) {
        return Err(ApiError::operation_in_progress(format!(
            "Operation {active} already in progress for store {id}"
        )));
    }

    if let Err(e) = state.audit.append(
        Some(&store.id),
        AuditAction::Retry,
        json!({ "previous_error": store.error_message }),
    ) {
        tracing::warn!(store_id = %store.id, error = %e, "audit append failed");
    }

    spawn_provision(&state, store.id.clone());
    Ok((
        StatusCode::ACCEPTED,
        Json(OperationAccepted {
            message: "Store provisioning retry initiated",
            store_id: store.id,
        }),
    ))
}

/// `GET /api/audit?limit=N`
pub async fn list_audit(
    State(state): State<SharedState>,
    query: Result<Query<AuditQuery>, QueryRejection>,
) -> Result<Json<AuditResponse>, ApiError> {
    // Lenient on malformed query strings: fall back to the default limit.
    let query = query.map(|Query(q)| q).unwrap_or_default();
    let limit = query.limit.map(|n| usize::try_from(n.max(1)).unwrap_or(1));
    let audit = state
        .audit
        .list(limit)
        .map_err(|e| internal(&state, &e))?;
    Ok(Json(AuditResponse { audit }))
}

/// `GET /api/stores/:id/audit`
pub async fn store_audit(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<AuditResponse>, ApiError> {
    // 404 for unknown stores, matching the other :id routes.
    fetch_store(&state, &id)?;
    let audit = state
        .audit
        .list_for(&id)
        .map_err(|e| internal(&state, &e))?;
    Ok(Json(AuditResponse { audit }))
}

/// `GET /api/metrics`
pub async fn metrics(
    State(state): State<SharedState>,
) -> Result<Json<MetricsResponse>, ApiError> {
    let by_status = state
        .registry
        .status_histogram()
        .map_err(|e| internal(&state, &e))?;
    let total: u64 = by_status.values().sum();
    let stats = state
        .registry
        .provisioning_stats()
        .map_err(|e| internal(&state, &e))?;
    let recent_failures = state
        .registry
        .recent_failures(5)
        .map_err(|e| internal(&state, &e))?
        .into_iter()
        .map(FailureSummary::from)
        .collect();

    Ok(Json(MetricsResponse {
        stores: StoresMetrics { total, by_status },
        provisioning: ProvisioningMetrics {
            total_provisioned: stats.total_provisioned,
            avg_duration_seconds: stats.avg_seconds,
            min_duration_seconds: stats.min_seconds,
            max_duration_seconds: stats.max_seconds,
        },
        recent_failures,
    }))
}

fn fetch_store(state: &SharedState, id: &str) -> Result<Store, ApiError> {
    state
        .registry
        .get(id)
        .map_err(|e| internal(state, &e))?
        .ok_or_else(|| ApiError::store_not_found(id))
}

fn internal<E>(state: &SharedState, error: &E) -> ApiError
where
    E: std::fmt::Display + std::fmt::Debug,
{
    ApiError::internal(error, state.config.is_production())
}

fn spawn_provision(state: &SharedState, store_id: String) {
    let provisioner = Arc::clone(&state.provisioner);
    tokio::spawn(async move {
        provisioner.provision(&store_id).await;
    });
}
