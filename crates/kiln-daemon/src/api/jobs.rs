use axum::{
    Extension,
    extract::{Path, State},
};

use super::{ApiError, ApiResult, ok};
use crate::{auth::AuthUser, broadcast::job_group, jobs::JobProgress, state::AppState};

/// Latest known progress of a provisioning job. Finished jobs are kept for a while.
pub(super) async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<JobProgress> {
    user.require(&job_group(id))?;
    state
        .jobs
        .progress(id)
        .map(ok)
        .unwrap_or_else(|| Err(ApiError::not_found(format!("job {id} not found"))))
}
