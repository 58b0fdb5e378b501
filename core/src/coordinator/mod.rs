// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Distributed job coordinator
//!
//! A replicated state machine over a raft consensus log. The committed log
//! is the authoritative order of state changes; the in-memory state is two
//! maps (active jobs, active checkpoints). All writes go through the
//! current leader; followers reject with a not-leader error so callers can
//! redirect via [`RaftNode::leader`].
//!
//! Durable stores live under the node's data directory:
//! `raft-log.db` and `raft-stable.db` (sled) plus file-based `snapshots/`.

pub mod command;
pub mod fsm;
pub mod node;
pub mod storage;

pub use command::Command;
pub use fsm::{Fsm, FsmSnapshot};
pub use node::{
    AppendEntriesArgs, AppendEntriesReply, EntryPayload, InstallSnapshotArgs,
    InstallSnapshotReply, LogEntry, RaftConfig, RaftNode, RaftPeer, RaftTransport,
    RequestVoteArgs, RequestVoteReply,
};
pub use storage::{LogStore, SnapshotFile, SnapshotStore, StableStore};
