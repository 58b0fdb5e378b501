//! `checkpoint` - list, show, delete, export, and import checkpoints.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use freightliner_core::checkpoint::{
    checkpoint_dir, Checkpoint, CheckpointStore, FileCheckpointStore,
};

use crate::output;

/// Shared flags for checkpoint subcommands
#[derive(Args)]
pub struct StoreArgs {
    /// Checkpoint directory (default ~/.freightliner/checkpoints)
    #[arg(long)]
    pub checkpoint_dir: Option<PathBuf>,
}

impl StoreArgs {
    fn open(&self) -> Result<FileCheckpointStore> {
        let directory = self.checkpoint_dir.clone().unwrap_or_else(checkpoint_dir);
        FileCheckpointStore::new(&directory)
            .with_context(|| format!("opening checkpoint store {}", directory.display()))
    }
}

/// Checkpoint lifecycle subcommands
#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// List stored checkpoints
    List(StoreArgs),

    /// Show one checkpoint in full
    Show {
        /// Checkpoint identifier
        id: String,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Delete a checkpoint
    Delete {
        /// Checkpoint identifier
        id: String,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Export a checkpoint to a JSON file (or stdout)
    Export {
        /// Checkpoint identifier
        id: String,
        /// Output path; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Import a checkpoint from a JSON file
    Import {
        /// Input path
        input: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
    },
}

/// Run the subcommand, returning the process exit code
pub async fn execute(command: CheckpointCommands, json: bool) -> Result<i32> {
    match command {
        CheckpointCommands::List(store_args) => {
            let store = store_args.open()?;
            let checkpoints = store.list().await?;
            output::print_checkpoint_list(&checkpoints, json);
        }
        CheckpointCommands::Show { id, store } => {
            let store = store.open()?;
            let checkpoint = store.load(&id).await?;
            output::print_checkpoint(&checkpoint, json);
        }
        CheckpointCommands::Delete { id, store } => {
            let store = store.open()?;
            store.delete(&id).await?;
            println!("Deleted checkpoint {id}");
        }
        CheckpointCommands::Export { id, output, store } => {
            let store = store.open()?;
            let checkpoint = store.load(&id).await?;
            let payload = serde_json::to_string_pretty(&checkpoint)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, payload)
                        .with_context(|| format!("writing {}", path.display()))?;
                    println!("Exported checkpoint {id} to {}", path.display());
                }
                None => println!("{payload}"),
            }
        }
        CheckpointCommands::Import { input, store } => {
            let store = store.open()?;
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let checkpoint: Checkpoint =
                serde_json::from_str(&raw).context("parsing checkpoint document")?;
            store.save(&checkpoint).await?;
            println!("Imported checkpoint {}", checkpoint.id);
        }
    }
    Ok(0)
}
