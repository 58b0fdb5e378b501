//! `sync` - batch replication from a YAML spec.

use anyhow::{Context, Result};
use clap::Args;
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use freightliner_core::config::SyncConfig;
use freightliner_core::engine::{
    RepoRef, ReplicationJob, ReplicationOutcome, ReplicationResult, TagFilter,
};

use crate::output;

/// Arguments for `sync`
#[derive(Args)]
pub struct SyncArgs {
    /// Path to the YAML sync spec
    #[arg(long)]
    pub config: PathBuf,

    /// Plan without pushing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Concurrent image syncs (overrides the spec)
    #[arg(long)]
    pub parallel: Option<usize>,
}

/// Run the command, returning the process exit code
pub async fn execute(args: SyncArgs, json: bool) -> Result<i32> {
    let config = SyncConfig::load(&args.config)
        .with_context(|| format!("loading sync spec {}", args.config.display()))?;
    let parallel = args.parallel.unwrap_or(config.parallel).max(1);

    let engine = Arc::new(super::build_engine(
        &[
            config.source.registry.clone(),
            config.destination.registry.clone(),
        ],
        0,
        config.source.insecure || config.destination.insecure,
        None,
    )?);
    let token = super::cancellation_token();

    info!(
        images = config.images.len(),
        parallel,
        "starting sync batch"
    );

    let mut pending = FuturesUnordered::new();
    let mut images = config.images.iter();
    let mut aggregate = ReplicationResult::default();
    let mut all_planned = Vec::new();

    loop {
        // Keep up to `parallel` image syncs in flight
        while pending.len() < parallel {
            let Some(image) = images.next() else { break };
            let engine = engine.clone();
            let token = token.clone();
            // `limit` caps an otherwise-unbounded selection
            let mut filter = image.tag_filter();
            if let (TagFilter::All, Some(n)) = (&filter, image.limit) {
                filter = TagFilter::LatestN(n);
            }
            let mut job = ReplicationJob::new(
                RepoRef::new(&config.source.registry, &image.repository),
                RepoRef::new(&config.destination.registry, image.destination()),
                filter,
            );
            job.job_type = "sync".to_string();
            job.dry_run = args.dry_run;
            let repository = image.repository.clone();

            pending.push(async move {
                let outcome = engine.replicate(&job, &token).await;
                (repository, outcome)
            });
        }

        let Some((repository, outcome)) = pending.next().await else {
            break;
        };
        match outcome {
            Ok(ReplicationOutcome {
                planned, result, ..
            }) => {
                info!(
                    repository,
                    copied = result.tags_copied,
                    errors = result.errors,
                    "image sync finished"
                );
                aggregate.merge(&result);
                all_planned.extend(planned);
            }
            Err(err) => {
                error!(repository, %err, "image sync failed");
                aggregate.errors += 1;
            }
        }
    }

    let outcome = ReplicationOutcome {
        planned: all_planned,
        result: aggregate.clone(),
        checkpoint_id: None,
    };
    output::print_outcome(&outcome, args.dry_run, json);
    Ok(super::exit_code(aggregate.errors))
}
