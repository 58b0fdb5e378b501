// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Replication orchestration: planning, execution, checkpointing, resume.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::copier::TagCopier;
use super::filter;
use super::types::{
    JobStatus, RepoRef, ReplicationJob, ReplicationResult, TagWorkItem, TreeReplicationOptions,
};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::error::{Error, Result};
use crate::pool::{PoolTask, WorkerPool};
use crate::registry::RegistryClient;
use crate::resilience::ResilienceManager;
use crate::scheduler::Scheduler;

/// Resolves registry endpoints to clients
pub trait RegistryProvider: Send + Sync {
    /// A client for `endpoint`, or an error when unknown
    fn client(&self, endpoint: &str) -> Result<Arc<dyn RegistryClient>>;
}

/// Provider over a fixed client map; the CLI and tests populate it
#[derive(Default)]
pub struct StaticRegistryProvider {
    clients: DashMap<String, Arc<dyn RegistryClient>>,
}

impl StaticRegistryProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under its endpoint
    pub fn insert(&self, client: Arc<dyn RegistryClient>) {
        self.clients.insert(client.endpoint().to_string(), client);
    }
}

impl RegistryProvider for StaticRegistryProvider {
    fn client(&self, endpoint: &str) -> Result<Arc<dyn RegistryClient>> {
        self.clients
            .get(endpoint)
            .map(|c| c.clone())
            .ok_or_else(|| Error::not_found(format!("no client for registry {endpoint}")))
    }
}

/// Engine sizing
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size (0 = auto)
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { workers: 0 }
    }
}

/// Outcome of a replication run
#[derive(Debug, Clone, Default)]
pub struct ReplicationOutcome {
    /// The tag keys that were planned
    pub planned: Vec<String>,
    /// Aggregate counters
    pub result: ReplicationResult,
    /// Checkpoint identifier when checkpointing was enabled
    pub checkpoint_id: Option<String>,
}

struct CheckpointHandle {
    checkpoint: Mutex<Checkpoint>,
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointHandle {
    async fn persist(&self) {
        let snapshot = self.checkpoint.lock().clone();
        if let Err(err) = self.store.save(&snapshot).await {
            warn!(id = %snapshot.id, %err, "checkpoint save failed");
        }
    }
}

struct JobRuntime {
    force: bool,
    result: Mutex<ReplicationResult>,
    checkpoint: Option<Arc<CheckpointHandle>>,
    /// Work items not yet recorded; a sibling job's worker may finish our
    /// last item after our own drain loops exit
    pending: std::sync::atomic::AtomicUsize,
}

/// The replication engine: drives jobs through
/// created → planned → executing → terminal states.
pub struct ReplicationEngine {
    registries: Arc<dyn RegistryProvider>,
    checkpoints: Arc<dyn CheckpointStore>,
    scheduler: Arc<Scheduler>,
    copier: Arc<TagCopier>,
    resilience: Arc<ResilienceManager>,
    config: EngineConfig,
    active: Arc<DashMap<String, Arc<JobRuntime>>>,
}

impl ReplicationEngine {
    /// Assemble an engine over its collaborators
    pub fn new(
        registries: Arc<dyn RegistryProvider>,
        checkpoints: Arc<dyn CheckpointStore>,
        scheduler: Arc<Scheduler>,
        resilience: Arc<ResilienceManager>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registries,
            checkpoints,
            scheduler,
            copier: Arc::new(TagCopier::new(resilience.clone())),
            resilience,
            config,
            active: Arc::new(DashMap::new()),
        }
    }

    /// The shared resilience manager (exposed for health reporting)
    pub fn resilience(&self) -> &Arc<ResilienceManager> {
        &self.resilience
    }

    /// The checkpoint store backing this engine
    pub fn checkpoint_store(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    async fn list_tags(
        &self,
        client: &Arc<dyn RegistryClient>,
        repository: &str,
        token: &CancellationToken,
    ) -> Result<Vec<String>> {
        let name = client.endpoint().to_string();
        let client = client.clone();
        let repository = repository.to_string();
        self.resilience
            .execute(&name, token, move || {
                let client = client.clone();
                let repository = repository.clone();
                async move { client.list_tags(&repository).await }
            })
            .await
    }

    /// Replicate a single repository according to the job's tag filter
    pub async fn replicate(
        &self,
        job: &ReplicationJob,
        token: &CancellationToken,
    ) -> Result<ReplicationOutcome> {
        let source = self.registries.client(&job.source.registry)?;
        let available = self
            .list_tags(&source, &job.source.repository, token)
            .await?;
        let tags = filter::resolve_tags(&available, &job.tag_filter)?;

        let items: Vec<TagWorkItem> = tags
            .iter()
            .map(|tag| {
                TagWorkItem::new(
                    &job.id,
                    &job.source.registry,
                    &job.source.repository,
                    tag,
                    &job.destination.registry,
                    &job.destination.repository,
                    tag,
                )
            })
            .collect();
        let planned: Vec<String> = items.iter().map(|i| i.tag_key()).collect();

        if job.dry_run {
            info!(job = %job.id, tags = planned.len(), "dry run: plan only");
            return Ok(ReplicationOutcome {
                planned,
                result: ReplicationResult::default(),
                checkpoint_id: None,
            });
        }

        // Destination must resolve before any work is queued
        self.registries.client(&job.destination.registry)?;

        let result = self
            .execute(&job.id, items, job.force, None, token)
            .await?;
        Ok(ReplicationOutcome {
            planned,
            result,
            checkpoint_id: None,
        })
    }

    /// Replicate a tree of repositories, optionally checkpointed and
    /// resumable
    pub async fn replicate_tree(
        &self,
        source: RepoRef,
        destination: RepoRef,
        options: TreeReplicationOptions,
        token: &CancellationToken,
    ) -> Result<ReplicationOutcome> {
        let source_client = self.registries.client(&source.registry)?;

        let (job_id, mut checkpoint, items) = if let Some(resume_id) = &options.resume_id {
            // Resume: the plan was frozen at original planning time
            let checkpoint = self.checkpoints.load(resume_id).await?;
            let remaining =
                checkpoint.remaining(options.skip_completed, options.retry_failed);
            let items = remaining
                .iter()
                .filter_map(|key| {
                    let (repo, tag) = key.rsplit_once(':')?;
                    Some(TagWorkItem::new(
                        resume_id,
                        &source.registry,
                        repo,
                        tag,
                        &destination.registry,
                        map_dest_repo(&source.repository, &destination.repository, repo),
                        tag,
                    ))
                })
                .collect::<Vec<_>>();
            info!(
                checkpoint = %resume_id,
                remaining = items.len(),
                "resuming from checkpoint"
            );
            (resume_id.clone(), checkpoint, items)
        } else {
            let job_id = uuid::Uuid::new_v4().to_string();
            let repositories = {
                let name = source_client.endpoint().to_string();
                let client = source_client.clone();
                let prefix = source.repository.clone();
                self.resilience
                    .execute(&name, token, move || {
                        let client = client.clone();
                        let prefix = prefix.clone();
                        async move { client.list_repositories(&prefix).await }
                    })
                    .await?
            };
            let repositories =
                filter::apply_repo_excludes(repositories, &options.exclude_repositories);

            let mut items = Vec::new();
            for repo in &repositories {
                let available = self.list_tags(&source_client, repo, token).await?;
                let tags = filter::apply_tag_lists(
                    available,
                    &options.include_tags,
                    &options.exclude_tags,
                );
                for tag in tags {
                    items.push(TagWorkItem::new(
                        &job_id,
                        &source.registry,
                        repo,
                        &tag,
                        &destination.registry,
                        map_dest_repo(&source.repository, &destination.repository, repo),
                        &tag,
                    ));
                }
            }

            let mut checkpoint = Checkpoint::new(
                &job_id,
                source.to_string(),
                destination.to_string(),
            );
            checkpoint.total_repositories = repositories.len() as u64;
            // The plan is frozen before any destination I/O
            checkpoint.set_plan(items.iter().map(|i| i.tag_key()).collect());
            (job_id, checkpoint, items)
        };

        let planned: Vec<String> = items.iter().map(|i| i.tag_key()).collect();

        if options.dry_run {
            info!(job = %job_id, tags = planned.len(), "dry run: plan only");
            return Ok(ReplicationOutcome {
                planned,
                result: ReplicationResult::default(),
                checkpoint_id: options.resume_id.clone(),
            });
        }

        self.registries.client(&destination.registry)?;

        let handle = if options.enable_checkpoint || options.resume_id.is_some() {
            checkpoint.status = "running".to_string();
            let handle = Arc::new(CheckpointHandle {
                checkpoint: Mutex::new(checkpoint),
                store: self.checkpoints.clone(),
            });
            handle.persist().await;
            Some(handle)
        } else {
            None
        };

        let result = self
            .execute(&job_id, items, options.force, handle.clone(), token)
            .await?;

        if let Some(handle) = &handle {
            {
                let mut cp = handle.checkpoint.lock();
                cp.status = if token.is_cancelled() {
                    JobStatus::Cancelled.to_string()
                } else if result.errors > 0 {
                    JobStatus::Failed.to_string()
                } else {
                    JobStatus::Completed.to_string()
                };
            }
            handle.persist().await;
        }

        Ok(ReplicationOutcome {
            planned,
            result,
            checkpoint_id: handle.map(|h| h.checkpoint.lock().id.clone()),
        })
    }

    /// Schedule the work items and drain them through the worker pool.
    ///
    /// Tree replication never aborts globally on a per-tag failure;
    /// failures are recorded and surfaced in the aggregate result.
    async fn execute(
        &self,
        job_id: &str,
        items: Vec<TagWorkItem>,
        force: bool,
        checkpoint: Option<Arc<CheckpointHandle>>,
        token: &CancellationToken,
    ) -> Result<ReplicationResult> {
        let runtime = Arc::new(JobRuntime {
            force,
            result: Mutex::new(ReplicationResult::default()),
            checkpoint,
            pending: std::sync::atomic::AtomicUsize::new(items.len()),
        });
        self.active.insert(job_id.to_string(), runtime.clone());

        for item in items {
            self.scheduler.submit(item).await?;
        }

        let pool = WorkerPool::new(self.config.workers);
        for worker in 0..pool.worker_count() {
            let scheduler = self.scheduler.clone();
            let copier = self.copier.clone();
            let registries = self.registries.clone();
            let active = self.active.clone();
            let task_token = token.clone();

            pool.submit(PoolTask::new(
                format!("{job_id}-worker-{worker}"),
                token.clone(),
                async move {
                    while let Some(item) = scheduler.next().await {
                        if task_token.is_cancelled() {
                            break;
                        }
                        process_item(&copier, &registries, &active, &item, &task_token)
                            .await;
                    }
                    Ok(())
                },
            ))
            .await?;
        }

        pool.wait().await;

        // A sibling job's worker may still be recording our final items
        while runtime.pending.load(std::sync::atomic::Ordering::Acquire) > 0
            && !token.is_cancelled()
        {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let runtime = self
            .active
            .remove(job_id)
            .map(|(_, r)| r)
            .ok_or_else(|| Error::internal("job runtime disappeared"))?;
        let result = runtime.result.lock().clone();
        Ok(result)
    }
}

/// Decrements the owning job's pending count once the outcome is recorded
struct PendingGuard<'a>(&'a Arc<JobRuntime>);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0
            .pending
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    }
}

/// Map a source repository path onto the destination prefix
fn map_dest_repo(source_prefix: &str, dest_prefix: &str, repo: &str) -> String {
    match repo.strip_prefix(source_prefix) {
        Some(suffix) => format!("{dest_prefix}{suffix}"),
        None => format!("{}/{}", dest_prefix.trim_end_matches('/'), repo),
    }
}

async fn process_item(
    copier: &Arc<TagCopier>,
    registries: &Arc<dyn RegistryProvider>,
    active: &Arc<DashMap<String, Arc<JobRuntime>>>,
    item: &TagWorkItem,
    token: &CancellationToken,
) {
    let runtime = active.get(&item.job_id).map(|r| r.clone());
    let force = runtime.as_ref().map(|r| r.force).unwrap_or(false);

    let outcome = async {
        let source = registries.client(&item.source_registry)?;
        let dest = registries.client(&item.dest_registry)?;
        copier.copy(source, dest, item, force, token).await
    }
    .await;

    let Some(runtime) = runtime else { return };
    let _guard = PendingGuard(&runtime);
    match outcome {
        Ok(copy) => {
            {
                let mut result = runtime.result.lock();
                if copy.skipped {
                    result.tags_skipped += 1;
                } else {
                    result.tags_copied += 1;
                }
                result.bytes_transferred += copy.bytes;
            }
            if let Some(handle) = &runtime.checkpoint {
                {
                    let mut cp = handle.checkpoint.lock();
                    cp.mark_completed(&item.tag_key(), copy.skipped, copy.bytes);
                    let repo = item.source_repository.clone();
                    cp.record_repo(&repo, |r| {
                        if copy.skipped {
                            r.tags_skipped += 1;
                        } else {
                            r.tags_copied += 1;
                        }
                    });
                }
                handle.persist().await;
            }
        }
        Err(err) => {
            warn!(tag = %item.tag_key(), %err, "tag replication failed");
            crate::metrics::tags_failed(&item.dest_registry);
            {
                let mut result = runtime.result.lock();
                result.errors += 1;
            }
            if let Some(handle) = &runtime.checkpoint {
                {
                    let mut cp = handle.checkpoint.lock();
                    cp.mark_failed(&item.tag_key(), err.to_string());
                    cp.record_repo(&item.source_repository, |r| {
                        r.errors += 1;
                        r.status = "failed".to_string();
                    });
                }
                handle.persist().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::TagFilter;
    use crate::registry::{digest_of, Manifest, MemoryRegistry, MANIFEST_MEDIA_TYPE};
    use crate::resilience::ResilienceConfig;
    use crate::scheduler::{GlobalQueue, SchedulerConfig};
    use bytes::Bytes;

    fn seed(source: &MemoryRegistry, repo: &str, tags: &[&str]) {
        for tag in tags {
            let layer = Bytes::from(format!("layer-{repo}-{tag}"));
            let doc = serde_json::json!({
                "schemaVersion": 2,
                "layers": [{"digest": digest_of(&layer), "size": layer.len()}]
            });
            let manifest = Manifest::from_bytes(
                MANIFEST_MEDIA_TYPE,
                Bytes::from(serde_json::to_vec(&doc).unwrap()),
            );
            source.seed_blob(repo, &digest_of(&layer), layer);
            source.seed_manifest(repo, tag, manifest);
        }
    }

    struct Fixture {
        engine: ReplicationEngine,
        source: Arc<MemoryRegistry>,
        dest: Arc<MemoryRegistry>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(MemoryRegistry::new("src.example.com"));
        let dest = Arc::new(MemoryRegistry::new("dst.example.com"));

        let provider = StaticRegistryProvider::new();
        provider.insert(source.clone());
        provider.insert(dest.clone());

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            crate::checkpoint::FileCheckpointStore::new(dir.path()).unwrap(),
        );
        let scheduler = Arc::new(Scheduler::new(
            "local",
            Arc::new(GlobalQueue::new()),
            SchedulerConfig::default(),
        ));
        let engine = ReplicationEngine::new(
            Arc::new(provider),
            store,
            scheduler,
            Arc::new(ResilienceManager::new(ResilienceConfig::default())),
            EngineConfig { workers: 2 },
        );
        Fixture {
            engine,
            source,
            dest,
            _dir: dir,
        }
    }

    fn job(fx: &Fixture, filter: TagFilter) -> ReplicationJob {
        let _ = fx;
        ReplicationJob::new(
            RepoRef::new("src.example.com", "prod/app"),
            RepoRef::new("dst.example.com", "proj/app"),
            filter,
        )
    }

    #[tokio::test]
    async fn test_single_repo_replication() {
        let fx = fixture();
        seed(&fx.source, "prod/app", &["v1.0", "v1.1"]);
        let token = CancellationToken::new();

        let outcome = fx
            .engine
            .replicate(&job(&fx, TagFilter::All), &token)
            .await
            .unwrap();

        assert_eq!(outcome.result.tags_copied, 2);
        assert_eq!(outcome.result.errors, 0);
        assert!(fx
            .dest
            .manifest_digest("proj/app", "v1.0")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_dry_run_plans_without_pushing() {
        let fx = fixture();
        seed(&fx.source, "prod/app", &["v1.0", "v1.1", "v2.0"]);
        let token = CancellationToken::new();

        let mut j = job(
            &fx,
            TagFilter::Explicit(vec!["v1.0".to_string(), "v1.1".to_string()]),
        );
        j.dry_run = true;

        let outcome = fx.engine.replicate(&j, &token).await.unwrap();

        assert_eq!(outcome.planned.len(), 2);
        assert_eq!(outcome.result.tags_copied, 0);
        assert_eq!(fx.dest.push_count(), 0);
    }

    #[tokio::test]
    async fn test_tree_replication_with_checkpoint() {
        let fx = fixture();
        seed(&fx.source, "prod/app", &["v1"]);
        seed(&fx.source, "prod/api", &["v1", "v2"]);
        seed(&fx.source, "other/tool", &["v1"]);
        let token = CancellationToken::new();

        let outcome = fx
            .engine
            .replicate_tree(
                RepoRef::new("src.example.com", "prod/"),
                RepoRef::new("dst.example.com", "mirror/"),
                TreeReplicationOptions {
                    enable_checkpoint: true,
                    ..TreeReplicationOptions::default()
                },
                &token,
            )
            .await
            .unwrap();

        assert_eq!(outcome.result.tags_copied, 3);
        assert_eq!(outcome.result.errors, 0);
        // Destination repository names are re-prefixed
        assert!(fx
            .dest
            .manifest_digest("mirror/app", "v1")
            .await
            .unwrap()
            .is_some());
        assert!(fx
            .dest
            .manifest_digest("mirror/api", "v2")
            .await
            .unwrap()
            .is_some());
        // The excluded prefix was never copied
        assert!(fx
            .dest
            .manifest_digest("mirror/tool", "v1")
            .await
            .unwrap()
            .is_none());

        let checkpoint_id = outcome.checkpoint_id.unwrap();
        let cp = fx.engine.checkpoints.load(&checkpoint_id).await.unwrap();
        assert_eq!(cp.status, "completed");
        assert!(cp.is_complete());
    }

    #[tokio::test]
    async fn test_resume_skips_completed() {
        let fx = fixture();
        seed(&fx.source, "prod/app", &["v1", "v2", "v3"]);
        let token = CancellationToken::new();

        // Simulate an interrupted run: plan frozen, one tag completed
        let mut cp = Checkpoint::new("resume-1", "src.example.com/prod/", "dst.example.com/mirror/");
        cp.set_plan(vec![
            "prod/app:v1".to_string(),
            "prod/app:v2".to_string(),
            "prod/app:v3".to_string(),
        ]);
        cp.mark_completed("prod/app:v1", false, 10);
        fx.engine.checkpoints.save(&cp).await.unwrap();

        let outcome = fx
            .engine
            .replicate_tree(
                RepoRef::new("src.example.com", "prod/"),
                RepoRef::new("dst.example.com", "mirror/"),
                TreeReplicationOptions {
                    resume_id: Some("resume-1".to_string()),
                    skip_completed: true,
                    ..TreeReplicationOptions::default()
                },
                &token,
            )
            .await
            .unwrap();

        // Only the two remaining tags were executed
        assert_eq!(outcome.planned.len(), 2);
        assert_eq!(outcome.result.tags_copied, 2);

        let cp = fx.engine.checkpoints.load("resume-1").await.unwrap();
        assert!(cp.is_complete());
        assert_eq!(cp.status, "completed");
    }

    #[tokio::test]
    async fn test_per_tag_failure_does_not_abort() {
        let fx = fixture();
        seed(&fx.source, "prod/app", &["good"]);
        // A manifest referencing a blob that is missing from the source
        let doc = serde_json::json!({
            "schemaVersion": 2,
            "layers": [{"digest": "sha256:missing", "size": 5}]
        });
        fx.source.seed_manifest(
            "prod/app",
            "broken",
            Manifest::from_bytes(
                MANIFEST_MEDIA_TYPE,
                Bytes::from(serde_json::to_vec(&doc).unwrap()),
            ),
        );
        let token = CancellationToken::new();

        let outcome = fx
            .engine
            .replicate(&job(&fx, TagFilter::All), &token)
            .await
            .unwrap();

        assert_eq!(outcome.result.tags_copied, 1);
        assert_eq!(outcome.result.errors, 1);
        assert!(fx
            .dest
            .manifest_digest("proj/app", "good")
            .await
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_dest_repo_mapping() {
        assert_eq!(map_dest_repo("prod/", "mirror/", "prod/app"), "mirror/app");
        assert_eq!(
            map_dest_repo("prod/", "mirror/", "elsewhere/app"),
            "mirror/elsewhere/app"
        );
    }
}
