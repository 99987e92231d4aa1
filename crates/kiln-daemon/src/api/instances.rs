use axum::{
    Extension,
    extract::{Path, Query, State},
};
use kiln_process::{InstanceId, InstanceStatus};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult, Body, ok};
use crate::{
    auth::AuthUser,
    broadcast::instance_group,
    jobs::{CreateInstanceRequest, Job},
    state::AppState,
    store::Instance,
};

#[derive(Debug, Serialize)]
pub(super) struct InstanceView {
    #[serde(flatten)]
    instance: Instance,
    status: InstanceStatus,
}

fn view(state: &AppState, instance: Instance) -> InstanceView {
    InstanceView {
        status: state.instances.status(instance.id),
        instance,
    }
}

async fn find(state: &AppState, user: &AuthUser, id: u32) -> Result<Instance, ApiError> {
    let id = InstanceId(id);
    user.require(&instance_group(id))?;
    state
        .config
        .instance(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("instance {id} not found")))
}

pub(super) async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Vec<InstanceView>> {
    let instances = state
        .config
        .list_instances()
        .await
        .into_iter()
        .filter(|i| user.can_access(&instance_group(i.id)))
        .map(|i| view(&state, i))
        .collect();
    ok(instances)
}

#[derive(Debug, Serialize)]
pub(super) struct Queued {
    job_id: InstanceId,
}

/// Queues provisioning; progress is published on `job:{id}`, which is also the new
/// instance's ID.
pub(super) async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Body(request): Body<CreateInstanceRequest>,
) -> ApiResult<Queued> {
    user.require_admin()?;
    request.validate().map_err(ApiError::bad_request)?;

    let id = state.config.generate_next_id().await?;
    let jobs = state.jobs.clone();
    tokio::spawn(async move { jobs.enqueue(Job { id, request }).await }).await??;
    ok(Queued { job_id: id })
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<InstanceView> {
    let instance = find(&state, &user, id).await?;
    ok(view(&state, instance))
}

/// Full replace. Takes effect on the next start. Admin only: the record decides what
/// gets executed.
pub(super) async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
    Body(mut instance): Body<Instance>,
) -> ApiResult<InstanceView> {
    user.require_admin()?;
    let existing = find(&state, &user, id).await?;
    instance.id = existing.id;
    instance.created_at = existing.created_at;
    instance.validate().map_err(ApiError::bad_request)?;

    if !state.config.update_instance(instance.clone()).await? {
        return Err(ApiError::not_found(format!("instance {id} not found")));
    }
    ok(view(&state, instance))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<bool> {
    user.require_admin()?;
    let id = InstanceId(id);
    if state.config.instance(id).await.is_none() {
        return Err(ApiError::not_found(format!("instance {id} not found")));
    }
    state.instances.remove(id).await?;
    if !state.config.delete_instance(id).await? {
        return Err(ApiError::not_found(format!("instance {id} not found")));
    }
    let tasks = state.tasks.delete_for(id).await?;
    tracing::info!(instance = %id, tasks, "instance deleted");
    ok(true)
}

pub(super) async fn start(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<InstanceStatus> {
    let id = find(&state, &user, id).await?.id;
    let sup = state.instances.clone();
    ok(tokio::spawn(async move { sup.start(id).await }).await??)
}

pub(super) async fn stop(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<InstanceStatus> {
    let id = find(&state, &user, id).await?.id;
    let sup = state.instances.clone();
    ok(tokio::spawn(async move { sup.stop(id).await }).await??)
}

pub(super) async fn restart(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
) -> ApiResult<InstanceStatus> {
    let id = find(&state, &user, id).await?.id;
    let sup = state.instances.clone();
    ok(tokio::spawn(async move { sup.restart(id).await }).await??)
}

#[derive(Debug, Deserialize)]
pub(super) struct CommandRequest {
    command: String,
}

pub(super) async fn command(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
    Body(req): Body<CommandRequest>,
) -> ApiResult<bool> {
    let id = find(&state, &user, id).await?.id;
    if req.command.contains('\n') {
        return Err(ApiError::bad_request("command must be a single line"));
    }
    state.instances.send_command(id, &req.command).await?;
    ok(true)
}

#[derive(Debug, Deserialize)]
pub(super) struct LogQuery {
    #[serde(default)]
    cursor: u64,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub(super) struct LogPage {
    pub(super) lines: Vec<String>,
    pub(super) cursor: u64,
}

pub(super) async fn logs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<u32>,
    Query(q): Query<LogQuery>,
) -> ApiResult<LogPage> {
    let id = find(&state, &user, id).await?.id;
    let limit = q.limit.unwrap_or(200).clamp(1, 5000);
    let (lines, cursor) = state.instances.tail_logs(id, q.cursor, limit);
    ok(LogPage { lines, cursor })
}
