//! `replicate-tree` - copy a whole tree of repositories.

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use freightliner_core::engine::{RepoRef, TreeReplicationOptions};

use crate::output;

/// Arguments for `replicate-tree`
#[derive(Args)]
pub struct TreeArgs {
    /// Source as <registry>/<repository-prefix>
    pub source: String,

    /// Destination as <registry>/<repository-prefix>
    pub destination: String,

    /// Worker pool size (0 = auto)
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Repositories to exclude (repeatable)
    #[arg(long = "exclude-repo")]
    pub exclude_repos: Vec<String>,

    /// Tags to exclude (repeatable)
    #[arg(long = "exclude-tag")]
    pub exclude_tags: Vec<String>,

    /// Tags to include (repeatable; default all)
    #[arg(long = "include-tag")]
    pub include_tags: Vec<String>,

    /// Plan without pushing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Copy even when the destination digest already matches
    #[arg(long)]
    pub force: bool,

    /// Persist a checkpoint for resume
    #[arg(long)]
    pub checkpoint: bool,

    /// Checkpoint directory (default ~/.freightliner/checkpoints)
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,

    /// Resume from a checkpoint id
    #[arg(long)]
    pub resume: Option<String>,

    /// On resume, skip tags already completed
    #[arg(long, default_value_t = true)]
    pub skip_completed: bool,

    /// On resume, retry tags that previously failed
    #[arg(long)]
    pub retry_failed: bool,

    /// Use plain HTTP to the registries
    #[arg(long)]
    pub insecure: bool,
}

/// Run the command, returning the process exit code
pub async fn execute(args: TreeArgs, json: bool) -> Result<i32> {
    let source = RepoRef::parse(&args.source).context("invalid source reference")?;
    let destination =
        RepoRef::parse(&args.destination).context("invalid destination reference")?;

    let engine = super::build_engine(
        &[source.registry.clone(), destination.registry.clone()],
        args.workers,
        args.insecure,
        args.checkpoint_dir.clone(),
    )?;
    let token = super::cancellation_token();

    let options = TreeReplicationOptions {
        workers: args.workers,
        exclude_repositories: args.exclude_repos,
        exclude_tags: args.exclude_tags,
        include_tags: args.include_tags,
        dry_run: args.dry_run,
        force: args.force,
        enable_checkpoint: args.checkpoint,
        checkpoint_dir: args
            .checkpoint_dir
            .map(|p| p.to_string_lossy().to_string()),
        resume_id: args.resume,
        skip_completed: args.skip_completed,
        retry_failed: args.retry_failed,
    };

    let spinner = if json || args.dry_run {
        None
    } else {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("replicating {} -> {}", args.source, args.destination));
        bar.enable_steady_tick(Duration::from_millis(120));
        Some(bar)
    };

    let outcome = engine
        .replicate_tree(source, destination, options, &token)
        .await?;

    if let Some(bar) = spinner {
        bar.finish_and_clear();
    }
    output::print_outcome(&outcome, args.dry_run, json);
    Ok(super::exit_code(outcome.result.errors))
}
