//! Disk inspection handlers.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{DiskInfo, ListDisksResponse};

/// GET /api/v1/disks - List the guest's disks and their chains.
pub async fn list_disks(State(state): State<Arc<ApiState>>) -> Json<ListDisksResponse> {
    let guest = state.guest();
    let disks = guest.disks().iter().map(DiskInfo::from).collect();
    Json(ListDisksResponse {
        guest: guest.name().to_string(),
        disks,
    })
}

/// GET /api/v1/disks/:disk - Get one disk.
pub async fn get_disk(
    State(state): State<Arc<ApiState>>,
    Path(target): Path<String>,
) -> Result<Json<DiskInfo>, ApiError> {
    let disk = state.guest().disk(&target)?;
    Ok(Json(DiskInfo::from(&disk)))
}
