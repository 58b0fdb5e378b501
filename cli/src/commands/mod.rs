//! Command implementations.

pub mod checkpoint;
pub mod replicate;
pub mod serve;
pub mod sync;
pub mod tree;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use freightliner_core::checkpoint::{checkpoint_dir, FileCheckpointStore};
use freightliner_core::engine::{
    EngineConfig, ReplicationEngine, StaticRegistryProvider,
};
use freightliner_core::registry::{HttpRegistryClient, RegistryCredentials};
use freightliner_core::resilience::{ResilienceConfig, ResilienceManager};
use freightliner_core::scheduler::{GlobalQueue, Scheduler, SchedulerConfig};

/// Build a standalone engine talking to the given registry endpoints.
///
/// Credentials come from the environment; the clustered service wires
/// richer per-registry configuration instead.
pub fn build_engine(
    endpoints: &[String],
    workers: usize,
    insecure: bool,
    checkpoint_directory: Option<PathBuf>,
) -> Result<ReplicationEngine> {
    let provider = StaticRegistryProvider::new();
    for endpoint in endpoints {
        let credentials = RegistryCredentials::default().with_env_fallback();
        provider.insert(Arc::new(HttpRegistryClient::new(
            endpoint.clone(),
            credentials,
            insecure,
        )?));
    }

    let directory = checkpoint_directory.unwrap_or_else(checkpoint_dir);
    let store = Arc::new(FileCheckpointStore::new(directory)?);

    Ok(ReplicationEngine::new(
        Arc::new(provider),
        store,
        Arc::new(Scheduler::new(
            "local",
            Arc::new(GlobalQueue::new()),
            SchedulerConfig::default(),
        )),
        Arc::new(ResilienceManager::new(ResilienceConfig::default())),
        EngineConfig { workers },
    ))
}

/// A token cancelled by ctrl-c
pub fn cancellation_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            signal_token.cancel();
        }
    });
    token
}

/// Exit code from an aggregate result: 1 when any failure was recorded
pub fn exit_code(errors: u64) -> i32 {
    if errors > 0 {
        1
    } else {
        0
    }
}
