// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! REST handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::models::*;
use crate::checkpoint::Checkpoint;
use crate::coordinator::{Command, RaftNode};
use crate::engine::{
    JobStatus, RepoRef, ReplicationEngine, ReplicationJob, TagFilter, TreeReplicationOptions,
};
use crate::error::{Error, ErrorKind};
use crate::resilience::{HealthChecker, HealthStatus};

/// Where job state lives: the raft coordinator in cluster mode, a local
/// map otherwise
pub enum JobRegistry {
    /// Replicated through the coordinator
    Raft(Arc<RaftNode>),
    /// Process-local
    Local(DashMap<String, ReplicationJob>),
}

impl JobRegistry {
    async fn create(&self, job: ReplicationJob) -> crate::error::Result<()> {
        match self {
            Self::Raft(raft) => raft.apply(Command::CreateJob { job }).await,
            Self::Local(map) => {
                map.insert(job.id.clone(), job);
                Ok(())
            }
        }
    }

    async fn update(&self, job: ReplicationJob) -> crate::error::Result<()> {
        match self {
            Self::Raft(raft) => raft.apply(Command::UpdateJob { job }).await,
            Self::Local(map) => {
                map.insert(job.id.clone(), job);
                Ok(())
            }
        }
    }

    fn get(&self, id: &str) -> Option<ReplicationJob> {
        match self {
            Self::Raft(raft) => raft.get_job(id),
            Self::Local(map) => map.get(id).map(|j| j.value().clone()),
        }
    }

    fn list(&self) -> Vec<ReplicationJob> {
        match self {
            Self::Raft(raft) => raft.list_jobs(),
            Self::Local(map) => map.iter().map(|j| j.value().clone()).collect(),
        }
    }
}

/// Shared state behind the router
pub struct ApiState {
    /// The replication engine
    pub engine: Arc<ReplicationEngine>,
    /// Job persistence
    pub jobs: JobRegistry,
    /// System health
    pub health: Arc<HealthChecker>,
    /// Root token; API-spawned jobs derive from it
    pub shutdown: CancellationToken,
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyExists => StatusCode::CONFLICT,
            ErrorKind::Transient | ErrorKind::CircuitOpen | ErrorKind::NotLeader => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ErrorKind::Cancelled | ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.message().to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

/// Build the router over shared state
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/replicate", post(submit_replicate))
        .route("/api/v1/replicate-tree", post(submit_replicate_tree))
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/checkpoints", get(list_checkpoints))
        .route(
            "/api/v1/checkpoints/:id",
            get(get_checkpoint).delete(delete_checkpoint),
        )
        .route("/health", get(health))
        .route("/readiness", get(readiness))
        .route("/liveness", get(liveness))
        .route("/metrics", get(metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn submit_replicate(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ReplicateRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let filter = if request.tags.is_empty() {
        TagFilter::All
    } else {
        TagFilter::Explicit(request.tags.clone())
    };
    let mut job = ReplicationJob::new(
        RepoRef::new(&request.source_registry, &request.source_repo),
        RepoRef::new(&request.dest_registry, &request.dest_repo),
        filter,
    );
    job.force = request.force;
    job.dry_run = request.dry_run;

    state.jobs.create(job.clone()).await?;
    spawn_replicate(state.clone(), job.clone());

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job.id,
            status: JobStatus::Pending.to_string(),
        }),
    ))
}

fn spawn_replicate(state: Arc<ApiState>, job: ReplicationJob) {
    let token = state.shutdown.child_token();
    tokio::spawn(async move {
        let mut job = job;
        job.set_status(JobStatus::Running);
        let _ = state.jobs.update(job.clone()).await;

        let outcome = state.engine.replicate(&job, &token).await;
        match outcome {
            Ok(outcome) => {
                info!(job = %job.id, copied = outcome.result.tags_copied, "job finished");
                job.set_status(if outcome.result.errors > 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                });
            }
            Err(err) => {
                error!(job = %job.id, %err, "job failed");
                job.set_status(JobStatus::Failed);
            }
        }
        let _ = state.jobs.update(job).await;
    });
}

async fn submit_replicate_tree(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ReplicateTreeRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let mut job = ReplicationJob::new(
        RepoRef::new(&request.source_registry, &request.source_repo),
        RepoRef::new(&request.dest_registry, &request.dest_repo),
        TagFilter::All,
    );
    job.job_type = "replicate-tree".to_string();
    job.force = request.force;
    job.dry_run = request.dry_run;
    if let Some(resume_id) = &request.resume_id {
        job.id = resume_id.clone();
    }

    let options = TreeReplicationOptions {
        exclude_repositories: request.exclude_repos,
        exclude_tags: request.exclude_tags,
        include_tags: request.include_tags,
        dry_run: request.dry_run,
        force: request.force,
        enable_checkpoint: request.enable_checkpoint,
        checkpoint_dir: request.checkpoint_dir,
        resume_id: request.resume_id,
        ..TreeReplicationOptions::default()
    };

    state.jobs.create(job.clone()).await?;

    let token = state.shutdown.child_token();
    let spawn_state = state.clone();
    let mut spawned_job = job.clone();
    tokio::spawn(async move {
        spawned_job.set_status(JobStatus::Running);
        let _ = spawn_state.jobs.update(spawned_job.clone()).await;

        let outcome = spawn_state
            .engine
            .replicate_tree(
                spawned_job.source.clone(),
                spawned_job.destination.clone(),
                options,
                &token,
            )
            .await;
        match outcome {
            Ok(outcome) => {
                spawned_job.set_status(if outcome.result.errors > 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                });
            }
            Err(err) => {
                error!(job = %spawned_job.id, %err, "tree job failed");
                spawned_job.set_status(JobStatus::Failed);
            }
        }
        let _ = spawn_state.jobs.update(spawned_job).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job.id,
            status: JobStatus::Pending.to_string(),
        }),
    ))
}

async fn list_jobs(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<JobListQuery>,
) -> Json<Vec<JobSummary>> {
    let mut jobs = state.jobs.list();
    if let Some(job_type) = &query.job_type {
        jobs.retain(|j| &j.job_type == job_type);
    }
    if let Some(status) = &query.status {
        jobs.retain(|j| &j.status.to_string() == status);
    }
    jobs.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
    Json(jobs.iter().map(JobSummary::from).collect())
}

async fn get_job(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ReplicationJob>, ApiError> {
    state
        .jobs
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError(Error::not_found(format!("job {id} not found"))))
}

async fn list_checkpoints(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<Checkpoint>>, ApiError> {
    Ok(Json(state.engine.checkpoint_store().list().await?))
}

async fn get_checkpoint(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Checkpoint>, ApiError> {
    Ok(Json(state.engine.checkpoint_store().load(&id).await?))
}

async fn delete_checkpoint(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.checkpoint_store().delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    let status = state.health.status();
    let code = match status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(state.health.states())).into_response()
}

async fn readiness(State(state): State<Arc<ApiState>>) -> StatusCode {
    match state.health.status() {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn liveness() -> StatusCode {
    StatusCode::OK
}

async fn metrics() -> String {
    crate::metrics::render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FileCheckpointStore;
    use crate::engine::{EngineConfig, StaticRegistryProvider};
    use crate::registry::{digest_of, Manifest, MemoryRegistry, RegistryClient, MANIFEST_MEDIA_TYPE};
    use crate::resilience::{ResilienceConfig, ResilienceManager};
    use crate::scheduler::{GlobalQueue, Scheduler, SchedulerConfig};
    use axum::body::Body;
    use axum::http::Request;
    use bytes::Bytes;
    use tower::ServiceExt;

    fn seeded_state() -> (Arc<ApiState>, Arc<MemoryRegistry>, tempfile::TempDir) {
        let source = Arc::new(MemoryRegistry::new("src.example.com"));
        let dest = Arc::new(MemoryRegistry::new("dst.example.com"));
        let layer = Bytes::from_static(b"layer");
        let doc = serde_json::json!({
            "schemaVersion": 2,
            "layers": [{"digest": digest_of(&layer), "size": layer.len()}]
        });
        source.seed_blob("prod/app", &digest_of(&layer), layer);
        source.seed_manifest(
            "prod/app",
            "v1",
            Manifest::from_bytes(
                MANIFEST_MEDIA_TYPE,
                Bytes::from(serde_json::to_vec(&doc).unwrap()),
            ),
        );

        let provider = StaticRegistryProvider::new();
        provider.insert(source);
        provider.insert(dest.clone());

        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(ReplicationEngine::new(
            Arc::new(provider),
            Arc::new(FileCheckpointStore::new(dir.path()).unwrap()),
            Arc::new(Scheduler::new(
                "local",
                Arc::new(GlobalQueue::new()),
                SchedulerConfig::default(),
            )),
            Arc::new(ResilienceManager::new(ResilienceConfig::default())),
            EngineConfig { workers: 1 },
        ));

        let state = Arc::new(ApiState {
            engine,
            jobs: JobRegistry::Local(DashMap::new()),
            health: Arc::new(HealthChecker::new()),
            shutdown: CancellationToken::new(),
        });
        (state, dest, dir)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_replicate_accepted() {
        let (state, dest, _dir) = seeded_state();
        let app = router(state.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/replicate")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "source_registry": "src.example.com",
                    "source_repo": "prod/app",
                    "dest_registry": "dst.example.com",
                    "dest_repo": "proj/app",
                    "tags": ["v1"]
                })
                .to_string(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted: JobAccepted = body_json(response).await;
        assert_eq!(accepted.status, "pending");

        // Job runs in the background
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if dest
                .manifest_digest("proj/app", "v1")
                .await
                .unwrap()
                .is_some()
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never ran");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let job = state.jobs.get(&accepted.job_id).unwrap();
        assert!(matches!(
            job.status,
            JobStatus::Completed | JobStatus::Running
        ));
    }

    #[tokio::test]
    async fn test_get_missing_job_is_404_with_kind() {
        let (state, _, _dir) = seeded_state();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/jobs/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.kind, "not_found");
    }

    #[tokio::test]
    async fn test_liveness_and_metrics() {
        let (state, _, _dir) = seeded_state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/liveness").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_job_list_filters() {
        let (state, _, _dir) = seeded_state();

        let mut a = ReplicationJob::new(
            RepoRef::new("src.example.com", "prod/app"),
            RepoRef::new("dst.example.com", "proj/app"),
            TagFilter::All,
        );
        a.set_status(JobStatus::Completed);
        let mut b = ReplicationJob::new(
            RepoRef::new("src.example.com", "prod/"),
            RepoRef::new("dst.example.com", "mirror/"),
            TagFilter::All,
        );
        b.job_type = "replicate-tree".to_string();
        state.jobs.create(a).await.unwrap();
        state.jobs.create(b).await.unwrap();

        let app = router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/jobs?type=replicate-tree")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let rows: Vec<JobSummary> = body_json(response).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_type, "replicate-tree");
    }
}
