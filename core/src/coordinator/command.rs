// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Commands appended to the replicated log.

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::engine::{JobId, ReplicationJob};

/// A state-machine command.
///
/// The committed log is the authoritative order of state changes; applying
/// a command mutates the in-memory maps and nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Insert a job into the jobs map
    CreateJob { job: ReplicationJob },
    /// Overwrite an existing job
    UpdateJob { job: ReplicationJob },
    /// Remove a job from the active-job map
    CompleteJob { id: JobId },
    /// Overwrite the checkpoint for its job
    UpdateCheckpoint { checkpoint: Checkpoint },
    /// Remove a checkpoint
    DeleteCheckpoint { id: JobId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RepoRef, TagFilter};

    #[test]
    fn test_command_serialization_is_tagged() {
        let cmd = Command::CompleteJob {
            id: "job-1".to_string(),
        };
        let encoded = serde_json::to_string(&cmd).unwrap();
        assert!(encoded.contains("\"op\":\"complete_job\""));

        let decoded: Command = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Command::CompleteJob { id } => assert_eq!(id, "job-1"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_create_job_round_trip() {
        let job = ReplicationJob::new(
            RepoRef::new("ecr.example.com", "prod"),
            RepoRef::new("gcr.io", "proj"),
            TagFilter::All,
        );
        let cmd = Command::CreateJob { job: job.clone() };
        let decoded: Command =
            serde_json::from_slice(&serde_json::to_vec(&cmd).unwrap()).unwrap();
        match decoded {
            Command::CreateJob { job: decoded_job } => assert_eq!(decoded_job.id, job.id),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
