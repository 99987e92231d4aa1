use axum::{
    Extension,
    extract::{Path, Query, State},
};
use kiln_process::InstanceId;
use serde::Deserialize;

use super::{ApiError, ApiResult, Body, ok};
use crate::{
    auth::AuthUser,
    broadcast::instance_group,
    state::AppState,
    store::{ScheduleTask, TaskAction},
};

#[derive(Debug, Deserialize)]
pub(super) struct TaskFilter {
    instance_id: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(super) struct TaskInput {
    instance_id: InstanceId,
    name: String,
    action: TaskAction,
    cron: String,
    #[serde(default)]
    payload: String,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl TaskInput {
    fn into_task(self, id: String) -> ScheduleTask {
        ScheduleTask {
            id,
            instance_id: self.instance_id,
            name: self.name.trim().to_string(),
            action: self.action,
            cron: self.cron.trim().to_string(),
            payload: self.payload,
            enabled: self.enabled,
            last_run: None,
        }
    }
}

/// Validates `task` and checks the caller may act on its instance, which must exist.
async fn admit(state: &AppState, user: &AuthUser, task: &ScheduleTask) -> Result<(), ApiError> {
    user.require(&instance_group(task.instance_id))?;
    task.validate().map_err(ApiError::bad_request)?;
    if state.config.instance(task.instance_id).await.is_none() {
        return Err(ApiError::bad_request(format!(
            "instance {} does not exist",
            task.instance_id
        )));
    }
    Ok(())
}

async fn find(state: &AppState, user: &AuthUser, id: &str) -> Result<ScheduleTask, ApiError> {
    let task = state
        .tasks
        .get(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("task {id} not found")))?;
    user.require(&instance_group(task.instance_id))?;
    Ok(task)
}

pub(super) async fn list(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(filter): Query<TaskFilter>,
) -> ApiResult<Vec<ScheduleTask>> {
    let tasks = match filter.instance_id {
        Some(id) => state.tasks.list_for(InstanceId(id)).await,
        None => state.tasks.list().await,
    };
    ok(tasks
        .into_iter()
        .filter(|t| user.can_access(&instance_group(t.instance_id)))
        .collect())
}

pub(super) async fn create(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Body(input): Body<TaskInput>,
) -> ApiResult<ScheduleTask> {
    let task = input.into_task(uuid::Uuid::new_v4().to_string());
    admit(&state, &user, &task).await?;
    if !state.tasks.create(task.clone()).await? {
        return Err(ApiError::conflict(format!("task {} already exists", task.id)));
    }
    tracing::info!(
        task = %task.id,
        instance = %task.instance_id,
        cron = %task.cron,
        "task created"
    );
    ok(task)
}

pub(super) async fn get_one(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<ScheduleTask> {
    ok(find(&state, &user, &id).await?)
}

pub(super) async fn update(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
    Body(input): Body<TaskInput>,
) -> ApiResult<ScheduleTask> {
    let existing = find(&state, &user, &id).await?;
    let task = input.into_task(existing.id);
    admit(&state, &user, &task).await?;
    if !state.tasks.update(task.clone()).await? {
        return Err(ApiError::not_found(format!("task {id} not found")));
    }
    let stored = state.tasks.get(&task.id).await;
    ok(stored.unwrap_or(task))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<bool> {
    find(&state, &user, &id).await?;
    if !state.tasks.delete(&id).await? {
        return Err(ApiError::not_found(format!("task {id} not found")));
    }
    ok(true)
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::api::test_support::app;

    #[tokio::test]
    async fn tasks_need_a_valid_cron_and_an_existing_instance() {
        let app = app().await;
        let body = json!({"instance_id": 1, "name": "nightly", "action": "restart", "cron": "0 4 * * *"});
        let (status, resp) = app.admin(Method::POST, "/api/tasks", Some(body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["message"], "instance 1 does not exist");

        let inst = crate::store::config::test_instance(1, app._dir.path());
        app.state.config.create_instance(inst).await.unwrap();

        let bad = json!({"instance_id": 1, "name": "nightly", "action": "restart", "cron": "61 * * * *"});
        let (status, resp) = app.admin(Method::POST, "/api/tasks", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(resp["message"].as_str().unwrap().starts_with("cron:"));

        let (status, resp) = app.admin(Method::POST, "/api/tasks", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        let id = resp["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(resp["data"]["enabled"], true);

        let (_, list) = app.admin(Method::GET, "/api/tasks?instance_id=1", None).await;
        assert_eq!(list["data"].as_array().unwrap().len(), 1);
        let (_, list) = app.admin(Method::GET, "/api/tasks?instance_id=2", None).await;
        assert!(list["data"].as_array().unwrap().is_empty());

        let (status, _) = app.admin(Method::DELETE, &format!("/api/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = app.admin(Method::GET, &format!("/api/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn command_tasks_need_a_payload() {
        let app = app().await;
        let inst = crate::store::config::test_instance(1, app._dir.path());
        app.state.config.create_instance(inst).await.unwrap();
        let body = json!({"instance_id": 1, "name": "say", "action": "command", "cron": "*/5 * * * *"});
        let (status, _) = app.admin(Method::POST, "/api/tasks", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn update_keeps_the_id_and_last_run() {
        let app = app().await;
        let inst = crate::store::config::test_instance(1, app._dir.path());
        app.state.config.create_instance(inst).await.unwrap();
        let mut task = crate::store::tasks::test_task(1, "* * * * *", crate::store::TaskAction::Start);
        let ran = chrono::Utc::now();
        task.last_run = Some(ran);
        app.state.tasks.create(task.clone()).await.unwrap();

        let (status, resp) = app
            .admin(
                Method::PUT,
                &format!("/api/tasks/{}", task.id),
                Some(json!({"instance_id": 1, "name": "renamed", "action": "stop", "cron": "0 * * * *", "enabled": false})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["data"]["id"], task.id);
        assert_eq!(resp["data"]["action"], "stop");
        assert_eq!(app.state.tasks.get(&task.id).await.unwrap().last_run, Some(ran));
    }
}
