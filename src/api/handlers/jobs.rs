//! Block job handlers.
//!
//! Engine calls talk to the monitor synchronously and a synchronous abort
//! waits for the emulator, so every call runs on the blocking pool.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::state::ApiState;
use crate::api::types::{
    AbortRequest, CommitRequest, CopyRequest, JobInfoResponse, JobQuery, JobStartedResponse,
    OkResponse, PullRequest, SpeedRequest,
};
use crate::blockjob::{AbortOptions, CommitOptions, CopyOptions, PullOptions};

/// POST /api/v1/disks/:disk/pull - Start a pull job.
pub async fn start_pull(
    State(state): State<Arc<ApiState>>,
    Path(target): Path<String>,
    Json(req): Json<PullRequest>,
) -> Result<(StatusCode, Json<JobStartedResponse>), ApiError> {
    let guest = state.guest();
    let opts = PullOptions::from(req);
    let job = tokio::task::spawn_blocking(move || guest.start_pull(&target, &opts)).await??;
    Ok((StatusCode::ACCEPTED, Json(JobStartedResponse { job })))
}

/// POST /api/v1/disks/:disk/commit - Start a commit or active commit job.
pub async fn start_commit(
    State(state): State<Arc<ApiState>>,
    Path(target): Path<String>,
    Json(req): Json<CommitRequest>,
) -> Result<(StatusCode, Json<JobStartedResponse>), ApiError> {
    let guest = state.guest();
    let opts = CommitOptions::from(req);
    let job = tokio::task::spawn_blocking(move || guest.start_commit(&target, &opts)).await??;
    Ok((StatusCode::ACCEPTED, Json(JobStartedResponse { job })))
}

/// POST /api/v1/disks/:disk/copy - Start a copy job.
pub async fn start_copy(
    State(state): State<Arc<ApiState>>,
    Path(target): Path<String>,
    Json(req): Json<CopyRequest>,
) -> Result<(StatusCode, Json<JobStartedResponse>), ApiError> {
    if req.destination.as_os_str().is_empty() {
        return Err(ApiError::BadRequest("destination cannot be empty".into()));
    }
    let guest = state.guest();
    let opts = CopyOptions::from(req);
    let job = tokio::task::spawn_blocking(move || guest.start_copy(&target, &opts)).await??;
    Ok((StatusCode::ACCEPTED, Json(JobStartedResponse { job })))
}

/// POST /api/v1/disks/:disk/abort - Cancel a job or pivot to its mirror.
pub async fn abort_job(
    State(state): State<Arc<ApiState>>,
    Path(target): Path<String>,
    Json(req): Json<AbortRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let guest = state.guest();
    let opts = AbortOptions::from(req);
    tokio::task::spawn_blocking(move || guest.abort(&target, &opts)).await??;
    Ok(Json(OkResponse { ok: true }))
}

/// POST /api/v1/disks/:disk/speed - Change a job's bandwidth limit.
pub async fn set_speed(
    State(state): State<Arc<ApiState>>,
    Path(target): Path<String>,
    Json(req): Json<SpeedRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    let guest = state.guest();
    tokio::task::spawn_blocking(move || guest.set_speed(&target, req.bandwidth.into())).await??;
    Ok(Json(OkResponse { ok: true }))
}

/// GET /api/v1/disks/:disk/job - Progress of the disk's job.
pub async fn get_job(
    State(state): State<Arc<ApiState>>,
    Path(target): Path<String>,
    Query(query): Query<JobQuery>,
) -> Result<Json<JobInfoResponse>, ApiError> {
    let guest = state.guest();
    let disk = target.clone();
    let job = tokio::task::spawn_blocking(move || guest.get_info(&target, query.unit)).await??;
    Ok(Json(JobInfoResponse { disk, job }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockjob::{BandwidthUnit, JobState};
    use crate::monitor::Capabilities;
    use crate::testutil::{sample_guest, FakeMonitor};
    use serde_json::json;

    fn state() -> (Arc<ApiState>, Arc<FakeMonitor>) {
        let (guest, fake) = sample_guest(Capabilities::default(), FakeMonitor::new());
        (Arc::new(ApiState::new(guest)), fake)
    }

    #[tokio::test]
    async fn test_pull_then_progress() {
        let (state, fake) = state();

        let (status, Json(started)) = start_pull(
            State(state.clone()),
            Path("vda".to_string()),
            Json(PullRequest::default()),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(started.job, "pull-vda-vda-fmt0");

        fake.reply(
            "query-block-jobs",
            json!([{"type": "stream", "device": started.job, "len": 100, "offset": 50, "speed": 0}]),
        );
        let Json(resp) = get_job(
            State(state),
            Path("vda".to_string()),
            Query(JobQuery {
                unit: BandwidthUnit::Bytes,
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.disk, "vda");
        let job = resp.job.unwrap();
        assert_eq!((job.current, job.total), (50, 100));
    }

    #[tokio::test]
    async fn test_second_job_conflicts() {
        let (state, _fake) = state();

        start_pull(
            State(state.clone()),
            Path("vda".to_string()),
            Json(PullRequest::default()),
        )
        .await
        .unwrap();
        let result = start_commit(
            State(state),
            Path("vda".to_string()),
            Json(CommitRequest::default()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_abort_without_job_is_not_found() {
        let (state, _fake) = state();

        let result = abort_job(
            State(state),
            Path("vdb".to_string()),
            Json(AbortRequest::default()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_async_abort_leaves_job_aborting() {
        let (state, fake) = state();

        start_pull(
            State(state.clone()),
            Path("vda".to_string()),
            Json(PullRequest::default()),
        )
        .await
        .unwrap();
        abort_job(
            State(state.clone()),
            Path("vda".to_string()),
            Json(AbortRequest {
                pivot: false,
                asynchronous: true,
            }),
        )
        .await
        .unwrap();

        assert!(fake.last_command("block-job-cancel").is_some());
        let job = state.guest().job("vda").unwrap();
        assert_eq!(job.state(), JobState::Aborting);
    }

    #[tokio::test]
    async fn test_empty_copy_destination_rejected() {
        let (state, fake) = state();

        let req: CopyRequest = serde_json::from_value(json!({"destination": ""})).unwrap();
        let result = start_copy(State(state), Path("vda".to_string()), Json(req)).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(fake.last_command("drive-mirror").is_none());
    }
}
