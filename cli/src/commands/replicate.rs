//! `replicate` - copy a single repository between registries.

use anyhow::{Context, Result};
use clap::Args;

use freightliner_core::engine::{RepoRef, ReplicationJob, TagFilter};

use crate::output;

/// Arguments for `replicate`
#[derive(Args)]
pub struct ReplicateArgs {
    /// Source as <registry>/<repository>
    pub source: String,

    /// Destination as <registry>/<repository>
    pub destination: String,

    /// Copy even when the destination digest already matches
    #[arg(long)]
    pub force: bool,

    /// Plan without pushing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Comma-separated tags to copy (default: all)
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Worker pool size (0 = auto)
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Use plain HTTP to the registries
    #[arg(long)]
    pub insecure: bool,
}

/// Run the command, returning the process exit code
pub async fn execute(args: ReplicateArgs, json: bool) -> Result<i32> {
    let source = RepoRef::parse(&args.source).context("invalid source reference")?;
    let destination =
        RepoRef::parse(&args.destination).context("invalid destination reference")?;

    let filter = if args.tags.is_empty() {
        TagFilter::All
    } else {
        TagFilter::Explicit(args.tags.clone())
    };

    let engine = super::build_engine(
        &[source.registry.clone(), destination.registry.clone()],
        args.workers,
        args.insecure,
        None,
    )?;
    let token = super::cancellation_token();

    let mut job = ReplicationJob::new(source, destination, filter);
    job.force = args.force;
    job.dry_run = args.dry_run;

    let outcome = engine.replicate(&job, &token).await?;
    output::print_outcome(&outcome, args.dry_run, json);
    Ok(super::exit_code(outcome.result.errors))
}
