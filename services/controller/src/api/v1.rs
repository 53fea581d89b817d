//! Version 1 of the controller API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use podpool_id::{InstanceId, PoolName};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::admission::AdmissionStatus;
use crate::platform::InstanceShape;
use crate::registry::Instance;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/pools/{pool}/instances", post(provision_instance))
        .route("/pools/{pool}/admission", get(pool_admission))
        .route("/instances", get(list_instances))
        .route("/instances/{instance_id}", delete(release_instance))
}

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    /// Opaque pod shape handed to the platform.
    #[serde(default = "empty_shape")]
    pub shape: InstanceShape,
}

impl Default for ProvisionRequest {
    fn default() -> Self {
        Self {
            shape: empty_shape(),
        }
    }
}

/// An empty pod spec, left for the platform to fill with its defaults.
fn empty_shape() -> InstanceShape {
    InstanceShape::Object(serde_json::Map::new())
}

#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub instance_id: InstanceId,
    pub pool: PoolName,
}

#[derive(Debug, Serialize)]
pub struct ListInstancesResponse {
    pub items: Vec<Instance>,
}

fn parse_pool(raw: &str) -> Result<PoolName, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::bad_request("invalid_pool", format!("{e}")))
}

async fn provision_instance(
    State(state): State<AppState>,
    Path(pool): Path<String>,
    body: Option<Json<ProvisionRequest>>,
) -> Result<(StatusCode, Json<ProvisionResponse>), ApiError> {
    let pool = parse_pool(&pool)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();

    let instance_id = state.provisioner().provision(&pool, &request.shape).await?;

    Ok((
        StatusCode::CREATED,
        Json(ProvisionResponse { instance_id, pool }),
    ))
}

async fn release_instance(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let instance_id: InstanceId = instance_id
        .parse()
        .map_err(|e| ApiError::bad_request("invalid_instance_id", format!("{e}")))?;

    state.provisioner().release(&instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_instances(State(state): State<AppState>) -> Json<ListInstancesResponse> {
    Json(ListInstancesResponse {
        items: state.registry().snapshot().await,
    })
}

async fn pool_admission(
    State(state): State<AppState>,
    Path(pool): Path<String>,
) -> Result<Json<AdmissionStatus>, ApiError> {
    let pool = parse_pool(&pool)?;
    Ok(Json(state.admission().status(&pool).await))
}
