// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The replicated state machine: active jobs and checkpoints.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::command::Command;
use crate::checkpoint::Checkpoint;
use crate::engine::{JobId, ReplicationJob};
use crate::error::Result;

/// Serialized snapshot of the state machine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FsmSnapshot {
    /// Active jobs by identifier
    pub jobs: HashMap<JobId, ReplicationJob>,
    /// Active checkpoints by job identifier
    pub checkpoints: HashMap<JobId, Checkpoint>,
}

/// Deterministic state machine over two maps.
///
/// Apply is side-effect-free beyond mutating the maps, so replaying the
/// committed log from any snapshot always converges to the same state.
#[derive(Debug, Default)]
pub struct Fsm {
    jobs: HashMap<JobId, ReplicationJob>,
    checkpoints: HashMap<JobId, Checkpoint>,
}

impl Fsm {
    /// Create an empty state machine
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a committed command
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::CreateJob { job } | Command::UpdateJob { job } => {
                self.jobs.insert(job.id.clone(), job);
            }
            Command::CompleteJob { id } => {
                self.jobs.remove(&id);
            }
            Command::UpdateCheckpoint { checkpoint } => {
                self.checkpoints.insert(checkpoint.id.clone(), checkpoint);
            }
            Command::DeleteCheckpoint { id } => {
                self.checkpoints.remove(&id);
            }
        }
    }

    /// Look up a job
    pub fn job(&self, id: &str) -> Option<ReplicationJob> {
        self.jobs.get(id).cloned()
    }

    /// All active jobs
    pub fn jobs(&self) -> Vec<ReplicationJob> {
        self.jobs.values().cloned().collect()
    }

    /// Look up a checkpoint
    pub fn checkpoint(&self, id: &str) -> Option<Checkpoint> {
        self.checkpoints.get(id).cloned()
    }

    /// All active checkpoints
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.values().cloned().collect()
    }

    /// Clone both maps into a serializable snapshot
    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            jobs: self.jobs.clone(),
            checkpoints: self.checkpoints.clone(),
        }
    }

    /// Replace state atomically from a snapshot
    pub fn restore(&mut self, snapshot: FsmSnapshot) {
        self.jobs = snapshot.jobs;
        self.checkpoints = snapshot.checkpoints;
    }

    /// Serialize the snapshot as one document
    pub fn snapshot_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.snapshot())?)
    }

    /// Restore from a serialized snapshot
    pub fn restore_bytes(&mut self, data: &[u8]) -> Result<()> {
        let snapshot: FsmSnapshot = serde_json::from_slice(data)?;
        self.restore(snapshot);
        Ok(())
    }
}
