// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Raft node: leader election, log replication, and commit.
//!
//! All writes go through the current leader as committed log entries;
//! followers reject writes with a not-leader error so callers can redirect.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command::Command;
use super::fsm::Fsm;
use super::storage::{LogStore, SnapshotFile, SnapshotStore, StableStore};
use crate::checkpoint::Checkpoint;
use crate::engine::ReplicationJob;
use crate::error::{Error, Result};

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftPeer {
    /// Node identifier
    pub id: String,
    /// RPC address
    pub address: String,
}

/// What a log entry carries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntryPayload {
    /// Leader-establishment marker
    Noop,
    /// A state-machine command
    Command(Command),
    /// New cluster membership (one change at a time)
    Config(Vec<RaftPeer>),
}

/// One replicated log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log (1-based)
    pub index: u64,
    /// Term the entry was created in
    pub term: u64,
    /// Payload
    pub payload: EntryPayload,
}

/// RequestVote RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// RequestVote RPC reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments (also the heartbeat)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// AppendEntries RPC reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    /// Hint for faster conflict backoff
    pub conflict_index: u64,
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: u64,
    pub leader_id: String,
    pub snapshot: SnapshotFile,
}

/// InstallSnapshot RPC reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: u64,
}

/// Transport to raft peers; the mesh provides the production
/// implementation, tests provide an in-memory one.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, target: &RaftPeer, args: RequestVoteArgs)
        -> Result<RequestVoteReply>;
    async fn append_entries(
        &self,
        target: &RaftPeer,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply>;
    async fn install_snapshot(
        &self,
        target: &RaftPeer,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotReply>;
}

/// Raft timing and sizing knobs
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Leader heartbeat cadence
    pub heartbeat_interval: Duration,
    /// Base election timeout; each election randomizes up to +50%
    pub election_timeout: Duration,
    /// Leader lease used for read freshness
    pub lease: Duration,
    /// Per-RPC deadline during replication and voting
    pub commit_timeout: Duration,
    /// Bound on a blocking apply
    pub apply_deadline: Duration,
    /// Take a snapshot after this many applied entries
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            election_timeout: Duration::from_secs(3),
            lease: Duration::from_millis(500),
            commit_timeout: Duration::from_millis(500),
            apply_deadline: Duration::from_secs(10),
            snapshot_threshold: 8192,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

struct RaftState {
    role: Role,
    current_term: u64,
    voted_for: Option<String>,
    leader_id: Option<String>,
    commit_index: u64,
    last_applied: u64,
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    membership: Vec<RaftPeer>,
    election_deadline: Instant,
    applied_since_snapshot: u64,
    /// Index/term folded into the latest snapshot
    snapshot_index: u64,
    snapshot_term: u64,
}

/// A raft consensus participant owning the replicated job state
pub struct RaftNode {
    node_id: String,
    config: RaftConfig,
    log: LogStore,
    stable: StableStore,
    snapshots: SnapshotStore,
    fsm: Mutex<Fsm>,
    state: Mutex<RaftState>,
    transport: Arc<dyn RaftTransport>,
    commit_tx: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Open or recover a node from `data_dir`.
    ///
    /// `initial_members` seeds membership on first boot; recovered
    /// membership from the stable store or snapshot takes precedence.
    pub fn new(
        node_id: impl Into<String>,
        data_dir: impl AsRef<Path>,
        initial_members: Vec<RaftPeer>,
        transport: Arc<dyn RaftTransport>,
        config: RaftConfig,
    ) -> Result<Arc<Self>> {
        let node_id = node_id.into();
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let log = LogStore::open(data_dir)?;
        let stable = StableStore::open(data_dir)?;
        let snapshots = SnapshotStore::open(data_dir)?;

        let mut fsm = Fsm::new();
        let mut snapshot_index = 0;
        let mut snapshot_term = 0;
        let mut membership = initial_members;

        if let Some(snapshot) = snapshots.latest()? {
            fsm.restore(snapshot.fsm);
            snapshot_index = snapshot.last_included_index;
            snapshot_term = snapshot.last_included_term;
            membership = snapshot.membership;
        }
        if let Some(stored) = stable.membership()? {
            membership = stored;
        }

        let current_term = stable.term()?;
        let voted_for = stable.voted_for()?;
        let (commit_tx, _) = watch::channel(snapshot_index);

        let deadline = Instant::now() + randomized_timeout(config.election_timeout);
        let node = Arc::new(Self {
            node_id,
            config,
            log,
            stable,
            snapshots,
            fsm: Mutex::new(fsm),
            state: Mutex::new(RaftState {
                role: Role::Follower,
                current_term,
                voted_for,
                leader_id: None,
                commit_index: snapshot_index,
                last_applied: snapshot_index,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                membership,
                election_deadline: deadline,
                applied_since_snapshot: 0,
                snapshot_index,
                snapshot_term,
            }),
            transport,
            commit_tx,
            shutdown: CancellationToken::new(),
        });
        Ok(node)
    }

    /// This node's identifier
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Start the election and heartbeat loops
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.shutdown.cancelled() => return,
                }
                let due = {
                    let state = this.state.lock();
                    state.role != Role::Leader && Instant::now() >= state.election_deadline
                };
                if due {
                    this.clone().run_election().await;
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = this.shutdown.cancelled() => return,
                }
                let is_leader = { this.state.lock().role == Role::Leader };
                if is_leader {
                    this.clone().replicate_once().await;
                }
            }
        });
    }

    /// Stop background loops
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Whether this node currently leads
    pub fn is_leader(&self) -> bool {
        self.state.lock().role == Role::Leader
    }

    /// The known leader, if any
    pub fn leader(&self) -> Option<RaftPeer> {
        let state = self.state.lock();
        let id = state.leader_id.clone()?;
        state.membership.iter().find(|p| p.id == id).cloned()
    }

    /// Current membership
    pub fn membership(&self) -> Vec<RaftPeer> {
        self.state.lock().membership.clone()
    }

    /// Poll every 100 ms until a leader is known or `timeout` elapses
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<RaftPeer> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leader() {
                return Ok(leader);
            }
            if Instant::now() >= deadline {
                return Err(Error::deadline_exceeded("no leader elected"));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // ---- client surface ----

    /// Submit a command; leader-only, blocks until committed and applied
    pub async fn apply(&self, command: Command) -> Result<()> {
        self.append_and_wait(EntryPayload::Command(command)).await?;
        Ok(())
    }

    /// Add a voting member; leader-only
    pub async fn add_voter(&self, id: impl Into<String>, address: impl Into<String>) -> Result<()> {
        let peer = RaftPeer {
            id: id.into(),
            address: address.into(),
        };
        let mut members = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return Err(self.not_leader_error(&state));
            }
            state.membership.clone()
        };
        if members.iter().any(|p| p.id == peer.id) {
            return Err(Error::already_exists(format!("{} is already a member", peer.id)));
        }
        members.push(peer);
        self.append_and_wait(EntryPayload::Config(members)).await?;
        Ok(())
    }

    /// Remove a member; leader-only
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let members: Vec<RaftPeer> = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return Err(self.not_leader_error(&state));
            }
            state
                .membership
                .iter()
                .filter(|p| p.id != id)
                .cloned()
                .collect()
        };
        if members.len() == self.state.lock().membership.len() {
            return Err(Error::not_found(format!("{id} is not a member")));
        }
        self.append_and_wait(EntryPayload::Config(members)).await?;
        Ok(())
    }

    /// Read a job from the local state machine
    pub fn get_job(&self, id: &str) -> Option<ReplicationJob> {
        self.fsm.lock().job(id)
    }

    /// All active jobs
    pub fn list_jobs(&self) -> Vec<ReplicationJob> {
        self.fsm.lock().jobs()
    }

    /// Read a checkpoint from the local state machine
    pub fn get_checkpoint(&self, id: &str) -> Option<Checkpoint> {
        self.fsm.lock().checkpoint(id)
    }

    /// All active checkpoints
    pub fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.fsm.lock().checkpoints()
    }

    fn not_leader_error(&self, state: &RaftState) -> Error {
        match &state.leader_id {
            Some(leader) => Error::not_leader(format!("not leader; leader is {leader}")),
            None => Error::not_leader("not leader; no leader known"),
        }
    }

    async fn append_and_wait(&self, payload: EntryPayload) -> Result<u64> {
        let index = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return Err(self.not_leader_error(&state));
            }
            let index = self.log.last_index()?.max(state.snapshot_index) + 1;
            self.log.append(&LogEntry {
                index,
                term: state.current_term,
                payload,
            })?;
            index
        };

        self.commit_if_single_node();

        let mut rx = self.commit_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow() >= index {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(Error::internal("commit watch closed"));
                }
            }
        };
        tokio::time::timeout(self.config.apply_deadline, wait)
            .await
            .map_err(|_| Error::deadline_exceeded("apply was not committed in time"))??;
        Ok(index)
    }

    /// A single-node cluster commits its own appends immediately;
    /// multi-node replication rides the heartbeat loop
    fn commit_if_single_node(&self) {
        let single = {
            let state = self.state.lock();
            state.membership.len() <= 1
        };
        if single {
            self.advance_commit();
        }
    }

    // ---- election ----

    async fn run_election(self: Arc<Self>) {
        let (term, last_log_index, last_log_term, peers, single) = {
            let mut state = self.state.lock();
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.node_id.clone());
            state.leader_id = None;
            state.election_deadline =
                Instant::now() + randomized_timeout(self.config.election_timeout);
            if let Err(err) = self
                .stable
                .set_term_and_vote(state.current_term, Some(&self.node_id))
            {
                warn!(%err, "failed to persist term");
            }
            let last_log_index = self.log.last_index().unwrap_or(0).max(state.snapshot_index);
            let last_log_term = self.last_log_term(&state);
            let peers: Vec<RaftPeer> = state
                .membership
                .iter()
                .filter(|p| p.id != self.node_id)
                .cloned()
                .collect();
            let single = peers.is_empty();
            (state.current_term, last_log_index, last_log_term, peers, single)
        };

        debug!(term, "starting election");

        if single {
            self.become_leader(term);
            return;
        }

        let args = RequestVoteArgs {
            term,
            candidate_id: self.node_id.clone(),
            last_log_index,
            last_log_term,
        };

        let mut votes = 1usize; // own vote
        let needed = (peers.len() + 1) / 2 + 1;

        let mut requests = Vec::new();
        for peer in peers {
            let transport = self.transport.clone();
            let args = args.clone();
            let rpc_timeout = self.config.commit_timeout;
            requests.push(tokio::spawn(async move {
                tokio::time::timeout(rpc_timeout, transport.request_vote(&peer, args)).await
            }));
        }

        for request in requests {
            match request.await {
                Ok(Ok(Ok(reply))) => {
                    if reply.term > term {
                        self.step_down(reply.term);
                        return;
                    }
                    if reply.vote_granted {
                        votes += 1;
                    }
                }
                Ok(Ok(Err(err))) => debug!(%err, "vote request failed"),
                Ok(Err(_)) => debug!("vote request timed out"),
                Err(err) => debug!(%err, "vote task failed"),
            }
        }

        let still_candidate = {
            let state = self.state.lock();
            state.role == Role::Candidate && state.current_term == term
        };
        if still_candidate && votes >= needed {
            self.become_leader(term);
            self.clone().replicate_once().await;
        }
    }

    fn become_leader(&self, term: u64) {
        let mut state = self.state.lock();
        if state.current_term != term {
            return;
        }
        state.role = Role::Leader;
        state.leader_id = Some(self.node_id.clone());
        let next = self.log.last_index().unwrap_or(0).max(state.snapshot_index) + 1;
        state.next_index.clear();
        state.match_index.clear();
        let peer_ids: Vec<_> = state
            .membership
            .iter()
            .filter(|peer| peer.id != self.node_id)
            .map(|peer| peer.id.clone())
            .collect();
        for peer_id in peer_ids {
            state.next_index.insert(peer_id.clone(), next);
            state.match_index.insert(peer_id, 0);
        }
        // Establish the new term in the log
        let entry = LogEntry {
            index: next,
            term,
            payload: EntryPayload::Noop,
        };
        if let Err(err) = self.log.append(&entry) {
            warn!(%err, "failed to append noop");
        }
        info!(term, node = %self.node_id, "became leader");
        drop(state);
        // A single-node cluster can commit the noop immediately
        self.advance_commit();
    }

    fn step_down(&self, term: u64) {
        let mut state = self.state.lock();
        if term > state.current_term {
            state.current_term = term;
            state.voted_for = None;
            if let Err(err) = self.stable.set_term_and_vote(term, None) {
                warn!(%err, "failed to persist term");
            }
        }
        state.role = Role::Follower;
        state.election_deadline =
            Instant::now() + randomized_timeout(self.config.election_timeout);
    }

    fn last_log_term(&self, state: &RaftState) -> u64 {
        let last = self.log.last_index().unwrap_or(0);
        if last == 0 || last <= state.snapshot_index {
            state.snapshot_term
        } else {
            self.log.term_at(last).unwrap_or(None).unwrap_or(state.snapshot_term)
        }
    }

    // ---- replication (leader) ----

    /// One replication round to every follower
    pub async fn replicate_once(self: Arc<Self>) {
        let (term, peers) = {
            let state = self.state.lock();
            if state.role != Role::Leader {
                return;
            }
            let peers: Vec<RaftPeer> = state
                .membership
                .iter()
                .filter(|p| p.id != self.node_id)
                .cloned()
                .collect();
            (state.current_term, peers)
        };

        let mut tasks = Vec::new();
        for peer in peers {
            let this = self.clone();
            tasks.push(tokio::spawn(async move {
                this.replicate_to(peer, term).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        self.advance_commit();
    }

    async fn replicate_to(self: Arc<Self>, peer: RaftPeer, term: u64) {
        let (prev_log_index, prev_log_term, entries, needs_snapshot) = {
            let state = self.state.lock();
            if state.role != Role::Leader || state.current_term != term {
                return;
            }
            let next = *state.next_index.get(&peer.id).unwrap_or(&1);
            let first = self.log.first_index().unwrap_or(0);

            // Peer is behind the compaction horizon
            if state.snapshot_index > 0 && next <= state.snapshot_index && (first == 0 || next < first)
            {
                (0, 0, Vec::new(), true)
            } else {
                let last = self.log.last_index().unwrap_or(0);
                let prev = next.saturating_sub(1);
                let prev_term = if prev == 0 {
                    0
                } else if prev == state.snapshot_index {
                    state.snapshot_term
                } else {
                    self.log.term_at(prev).unwrap_or(None).unwrap_or(0)
                };
                let entries = if next <= last {
                    self.log.range(next, last).unwrap_or_default()
                } else {
                    Vec::new()
                };
                (prev, prev_term, entries, false)
            }
        };

        if needs_snapshot {
            self.send_snapshot(&peer, term).await;
            return;
        }

        let sent_up_to = prev_log_index + entries.len() as u64;
        let args = AppendEntriesArgs {
            term,
            leader_id: self.node_id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.state.lock().commit_index,
        };

        let reply = tokio::time::timeout(
            self.config.commit_timeout,
            self.transport.append_entries(&peer, args),
        )
        .await;

        match reply {
            Ok(Ok(reply)) => {
                if reply.term > term {
                    self.step_down(reply.term);
                    return;
                }
                let mut state = self.state.lock();
                if state.role != Role::Leader || state.current_term != term {
                    return;
                }
                if reply.success {
                    state.match_index.insert(peer.id.clone(), sent_up_to);
                    state.next_index.insert(peer.id.clone(), sent_up_to + 1);
                } else {
                    let fallback = reply.conflict_index.max(1);
                    state.next_index.insert(peer.id.clone(), fallback);
                }
            }
            Ok(Err(err)) => debug!(peer = %peer.id, %err, "append entries failed"),
            Err(_) => debug!(peer = %peer.id, "append entries timed out"),
        }
    }

    async fn send_snapshot(&self, peer: &RaftPeer, term: u64) {
        let snapshot = match self.snapshots.latest() {
            Ok(Some(snapshot)) => snapshot,
            _ => return,
        };
        let last_included = snapshot.last_included_index;
        let args = InstallSnapshotArgs {
            term,
            leader_id: self.node_id.clone(),
            snapshot,
        };
        match tokio::time::timeout(
            self.config.apply_deadline,
            self.transport.install_snapshot(peer, args),
        )
        .await
        {
            Ok(Ok(reply)) => {
                if reply.term > term {
                    self.step_down(reply.term);
                    return;
                }
                let mut state = self.state.lock();
                state.match_index.insert(peer.id.clone(), last_included);
                state.next_index.insert(peer.id.clone(), last_included + 1);
            }
            Ok(Err(err)) => debug!(peer = %peer.id, %err, "install snapshot failed"),
            Err(_) => debug!(peer = %peer.id, "install snapshot timed out"),
        }
    }

    /// Advance the commit index to the highest majority-replicated entry of
    /// the current term, then apply
    fn advance_commit(&self) {
        let committed = {
            let mut state = self.state.lock();
            if state.role != Role::Leader {
                return;
            }
            let last = self.log.last_index().unwrap_or(0);
            let members = state.membership.len().max(1);
            let majority = members / 2 + 1;

            let mut candidate = state.commit_index;
            for n in (state.commit_index + 1)..=last {
                let mut count = 1; // self
                for peer in &state.membership {
                    if peer.id == self.node_id {
                        continue;
                    }
                    if *state.match_index.get(&peer.id).unwrap_or(&0) >= n {
                        count += 1;
                    }
                }
                let term_ok = self
                    .log
                    .term_at(n)
                    .unwrap_or(None)
                    .map(|t| t == state.current_term)
                    .unwrap_or(false);
                if count >= majority && term_ok {
                    candidate = n;
                }
            }
            if candidate > state.commit_index {
                state.commit_index = candidate;
                Some(candidate)
            } else {
                None
            }
        };

        if committed.is_some() {
            self.apply_committed();
        }
    }

    /// Apply entries in `(last_applied, commit_index]` to the FSM
    fn apply_committed(&self) {
        loop {
            let next = {
                let state = self.state.lock();
                if state.last_applied >= state.commit_index {
                    break;
                }
                state.last_applied + 1
            };

            let entry = match self.log.get(next) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    // Compacted into a snapshot; skip ahead
                    let mut state = self.state.lock();
                    if next <= state.snapshot_index {
                        state.last_applied = state.snapshot_index;
                        continue;
                    }
                    warn!(index = next, "missing committed log entry");
                    break;
                }
                Err(err) => {
                    warn!(%err, "log read failed during apply");
                    break;
                }
            };

            match entry.payload {
                EntryPayload::Noop => {}
                EntryPayload::Command(command) => {
                    self.fsm.lock().apply(command);
                }
                EntryPayload::Config(members) => {
                    let mut state = self.state.lock();
                    state.membership = members.clone();
                    drop(state);
                    if let Err(err) = self.stable.set_membership(&members) {
                        warn!(%err, "failed to persist membership");
                    }
                    info!(members = members.len(), "membership changed");
                }
            }

            let should_snapshot = {
                let mut state = self.state.lock();
                state.last_applied = next;
                state.applied_since_snapshot += 1;
                state.applied_since_snapshot >= self.config.snapshot_threshold
            };
            // send_replace keeps the value fresh even with no waiters
            self.commit_tx.send_replace(next);

            if should_snapshot {
                if let Err(err) = self.take_snapshot() {
                    warn!(%err, "snapshot failed");
                }
            }
        }
    }

    /// Fold applied state into a snapshot file and compact the log
    pub fn take_snapshot(&self) -> Result<()> {
        let (index, term, membership) = {
            let state = self.state.lock();
            let term = if state.last_applied == state.snapshot_index {
                state.snapshot_term
            } else {
                self.log
                    .term_at(state.last_applied)?
                    .unwrap_or(state.snapshot_term)
            };
            (state.last_applied, term, state.membership.clone())
        };
        if index == 0 {
            return Ok(());
        }

        let fsm = self.fsm.lock().snapshot();
        self.snapshots.save(&SnapshotFile {
            last_included_index: index,
            last_included_term: term,
            membership,
            fsm,
        })?;
        self.log.truncate_to(index)?;

        let mut state = self.state.lock();
        state.snapshot_index = index;
        state.snapshot_term = term;
        state.applied_since_snapshot = 0;
        info!(index, "snapshot taken");
        Ok(())
    }

    // ---- RPC handlers (server side) ----

    /// Handle an incoming RequestVote RPC
    pub fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock();

        if args.term > state.current_term {
            state.current_term = args.term;
            state.voted_for = None;
            state.role = Role::Follower;
            if let Err(err) = self.stable.set_term_and_vote(args.term, None) {
                warn!(%err, "failed to persist term");
            }
        }

        if args.term < state.current_term {
            return RequestVoteReply {
                term: state.current_term,
                vote_granted: false,
            };
        }

        let our_last_index = self.log.last_index().unwrap_or(0).max(state.snapshot_index);
        let our_last_term = self.last_log_term(&state);
        let log_ok = args.last_log_term > our_last_term
            || (args.last_log_term == our_last_term && args.last_log_index >= our_last_index);
        let vote_free = state
            .voted_for
            .as_ref()
            .map(|v| v == &args.candidate_id)
            .unwrap_or(true);

        if log_ok && vote_free {
            state.voted_for = Some(args.candidate_id.clone());
            state.election_deadline =
                Instant::now() + randomized_timeout(self.config.election_timeout);
            if let Err(err) = self
                .stable
                .set_term_and_vote(state.current_term, Some(&args.candidate_id))
            {
                warn!(%err, "failed to persist vote");
            }
            RequestVoteReply {
                term: state.current_term,
                vote_granted: true,
            }
        } else {
            RequestVoteReply {
                term: state.current_term,
                vote_granted: false,
            }
        }
    }

    /// Handle an incoming AppendEntries RPC
    pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let result = {
            let mut state = self.state.lock();

            if args.term < state.current_term {
                return AppendEntriesReply {
                    term: state.current_term,
                    success: false,
                    conflict_index: 0,
                };
            }

            if args.term > state.current_term {
                state.current_term = args.term;
                state.voted_for = None;
                if let Err(err) = self.stable.set_term_and_vote(args.term, None) {
                    warn!(%err, "failed to persist term");
                }
            }
            state.role = Role::Follower;
            state.leader_id = Some(args.leader_id.clone());
            state.election_deadline =
                Instant::now() + randomized_timeout(self.config.election_timeout);

            // Log consistency check
            let last = self.log.last_index().unwrap_or(0).max(state.snapshot_index);
            if args.prev_log_index > last {
                return AppendEntriesReply {
                    term: state.current_term,
                    success: false,
                    conflict_index: last + 1,
                };
            }
            if args.prev_log_index > 0 && args.prev_log_index > state.snapshot_index {
                let local_term = self.log.term_at(args.prev_log_index).unwrap_or(None);
                if local_term != Some(args.prev_log_term) {
                    return AppendEntriesReply {
                        term: state.current_term,
                        success: false,
                        conflict_index: args.prev_log_index,
                    };
                }
            }

            // Append, truncating on conflict
            for entry in &args.entries {
                let local_term = self.log.term_at(entry.index).unwrap_or(None);
                match local_term {
                    Some(t) if t == entry.term => continue,
                    Some(_) => {
                        if let Err(err) = self.log.truncate_from(entry.index) {
                            warn!(%err, "log truncate failed");
                        }
                    }
                    None => {}
                }
                if let Err(err) = self.log.append(entry) {
                    warn!(%err, "log append failed");
                    return AppendEntriesReply {
                        term: state.current_term,
                        success: false,
                        conflict_index: entry.index,
                    };
                }
            }

            let last_new = if args.entries.is_empty() {
                args.prev_log_index
            } else {
                args.entries.last().map(|e| e.index).unwrap_or(args.prev_log_index)
            };
            if args.leader_commit > state.commit_index {
                state.commit_index = args.leader_commit.min(last_new);
            }

            AppendEntriesReply {
                term: state.current_term,
                success: true,
                conflict_index: 0,
            }
        };

        self.apply_committed();
        result
    }

    /// Handle an incoming InstallSnapshot RPC
    pub fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let term = {
            let mut state = self.state.lock();
            if args.term < state.current_term {
                return InstallSnapshotReply {
                    term: state.current_term,
                };
            }
            if args.term > state.current_term {
                state.current_term = args.term;
                state.voted_for = None;
                if let Err(err) = self.stable.set_term_and_vote(args.term, None) {
                    warn!(%err, "failed to persist term");
                }
            }
            state.role = Role::Follower;
            state.leader_id = Some(args.leader_id.clone());
            state.election_deadline =
                Instant::now() + randomized_timeout(self.config.election_timeout);

            let snapshot = &args.snapshot;
            state.snapshot_index = snapshot.last_included_index;
            state.snapshot_term = snapshot.last_included_term;
            state.commit_index = state.commit_index.max(snapshot.last_included_index);
            state.last_applied = snapshot.last_included_index;
            state.membership = snapshot.membership.clone();
            state.current_term
        };

        self.fsm.lock().restore(args.snapshot.fsm.clone());
        if let Err(err) = self.snapshots.save(&args.snapshot) {
            warn!(%err, "failed to persist installed snapshot");
        }
        if let Err(err) = self.log.truncate_to(args.snapshot.last_included_index) {
            warn!(%err, "failed to compact after snapshot install");
        }
        self.commit_tx.send_replace(args.snapshot.last_included_index);

        InstallSnapshotReply { term }
    }
}

fn randomized_timeout(base: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RepoRef, TagFilter};
    use dashmap::DashMap;
    use std::collections::HashSet;

    /// In-memory transport with a partition set
    struct MemoryTransport {
        nodes: DashMap<String, Arc<RaftNode>>,
        partitioned: parking_lot::RwLock<HashSet<String>>,
    }

    impl MemoryTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                nodes: DashMap::new(),
                partitioned: parking_lot::RwLock::new(HashSet::new()),
            })
        }

        fn register(&self, node: Arc<RaftNode>) {
            self.nodes.insert(node.node_id().to_string(), node);
        }

        fn partition(&self, id: &str) {
            self.partitioned.write().insert(id.to_string());
        }

        fn reachable(&self, target: &str) -> Result<Arc<RaftNode>> {
            let blocked = self.partitioned.read();
            if blocked.contains(target) {
                return Err(Error::transient("partitioned"));
            }
            self.nodes
                .get(target)
                .map(|n| n.clone())
                .ok_or_else(|| Error::not_found("unknown node"))
        }
    }

    #[async_trait]
    impl RaftTransport for MemoryTransport {
        async fn request_vote(
            &self,
            target: &RaftPeer,
            args: RequestVoteArgs,
        ) -> Result<RequestVoteReply> {
            if self.partitioned.read().contains(&args.candidate_id) {
                return Err(Error::transient("partitioned"));
            }
            Ok(self.reachable(&target.id)?.handle_request_vote(args))
        }

        async fn append_entries(
            &self,
            target: &RaftPeer,
            args: AppendEntriesArgs,
        ) -> Result<AppendEntriesReply> {
            if self.partitioned.read().contains(&args.leader_id) {
                return Err(Error::transient("partitioned"));
            }
            Ok(self.reachable(&target.id)?.handle_append_entries(args))
        }

        async fn install_snapshot(
            &self,
            target: &RaftPeer,
            args: InstallSnapshotArgs,
        ) -> Result<InstallSnapshotReply> {
            Ok(self.reachable(&target.id)?.handle_install_snapshot(args))
        }
    }

    fn fast_config() -> RaftConfig {
        RaftConfig {
            heartbeat_interval: Duration::from_millis(40),
            election_timeout: Duration::from_millis(200),
            lease: Duration::from_millis(50),
            commit_timeout: Duration::from_millis(100),
            apply_deadline: Duration::from_secs(5),
            snapshot_threshold: 10_000,
        }
    }

    fn job(id: &str) -> ReplicationJob {
        let mut job = ReplicationJob::new(
            RepoRef::new("ecr.example.com", "prod"),
            RepoRef::new("gcr.io", "proj"),
            TagFilter::All,
        );
        job.id = id.to_string();
        job
    }

    async fn cluster(
        n: usize,
        transport: &Arc<MemoryTransport>,
        dir: &std::path::Path,
    ) -> Vec<Arc<RaftNode>> {
        let members: Vec<RaftPeer> = (0..n)
            .map(|i| RaftPeer {
                id: format!("node-{i}"),
                address: format!("127.0.0.1:{}", 7000 + i),
            })
            .collect();

        let mut nodes = Vec::new();
        for member in &members {
            let node = RaftNode::new(
                member.id.clone(),
                dir.join(&member.id),
                members.clone(),
                transport.clone() as Arc<dyn RaftTransport>,
                fast_config(),
            )
            .unwrap();
            transport.register(node.clone());
            node.start();
            nodes.push(node);
        }
        nodes
    }

    async fn find_leader(nodes: &[Arc<RaftNode>], timeout: Duration) -> Arc<RaftNode> {
        let deadline = Instant::now() + timeout;
        loop {
            for node in nodes {
                if node.is_leader() {
                    return node.clone();
                }
            }
            assert!(Instant::now() < deadline, "no leader elected in time");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_single_node_applies_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let nodes = cluster(1, &transport, dir.path()).await;
        let leader = find_leader(&nodes, Duration::from_secs(3)).await;

        leader.apply(Command::CreateJob { job: job("j1") }).await.unwrap();
        assert!(leader.get_job("j1").is_some());

        leader
            .apply(Command::CompleteJob {
                id: "j1".to_string(),
            })
            .await
            .unwrap();
        assert!(leader.get_job("j1").is_none());
        for node in nodes {
            node.stop();
        }
    }

    #[tokio::test]
    async fn test_followers_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let nodes = cluster(3, &transport, dir.path()).await;
        let leader = find_leader(&nodes, Duration::from_secs(5)).await;

        let follower = nodes
            .iter()
            .find(|n| n.node_id() != leader.node_id())
            .unwrap();
        let err = follower
            .apply(Command::CreateJob { job: job("j1") })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotLeader);
        for node in nodes {
            node.stop();
        }
    }

    #[tokio::test]
    async fn test_commits_replicate_to_followers() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let nodes = cluster(3, &transport, dir.path()).await;
        let leader = find_leader(&nodes, Duration::from_secs(5)).await;

        leader.apply(Command::CreateJob { job: job("j1") }).await.unwrap();

        // Followers converge within a few heartbeats
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let replicated = nodes
                .iter()
                .filter(|n| n.get_job("j1").is_some())
                .count();
            if replicated == nodes.len() {
                break;
            }
            assert!(Instant::now() < deadline, "job did not replicate");
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        for node in nodes {
            node.stop();
        }
    }

    #[tokio::test]
    async fn test_leader_failover_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let nodes = cluster(3, &transport, dir.path()).await;
        let leader = find_leader(&nodes, Duration::from_secs(5)).await;

        leader.apply(Command::CreateJob { job: job("j1") }).await.unwrap();

        // Ensure the entry reaches a majority before the partition
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            let replicated = nodes
                .iter()
                .filter(|n| n.get_job("j1").is_some())
                .count();
            if replicated >= 2 {
                break;
            }
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        transport.partition(leader.node_id());

        let survivors: Vec<Arc<RaftNode>> = nodes
            .iter()
            .filter(|n| n.node_id() != leader.node_id())
            .cloned()
            .collect();
        // Within 2x election timeout a survivor takes over
        let new_leader = find_leader(&survivors, Duration::from_secs(5)).await;
        assert_ne!(new_leader.node_id(), leader.node_id());

        // The new leader applies inherited entries once its noop commits
        let deadline = Instant::now() + Duration::from_secs(3);
        while new_leader.get_job("j1").is_none() {
            assert!(Instant::now() < deadline, "job lost across failover");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        for node in nodes {
            node.stop();
        }
    }

    #[tokio::test]
    async fn test_wait_for_leader_times_out_without_quorum() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let members = vec![
            RaftPeer {
                id: "node-0".into(),
                address: "127.0.0.1:7000".into(),
            },
            RaftPeer {
                id: "node-1".into(),
                address: "127.0.0.1:7001".into(),
            },
            RaftPeer {
                id: "node-2".into(),
                address: "127.0.0.1:7002".into(),
            },
        ];
        // Only one node of three: no quorum, no leader
        let node = RaftNode::new(
            "node-0",
            dir.path().join("node-0"),
            members,
            transport.clone() as Arc<dyn RaftTransport>,
            fast_config(),
        )
        .unwrap();
        transport.register(node.clone());
        node.start();

        let err = node.wait_for_leader(Duration::from_millis(600)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DeadlineExceeded);
        node.stop();
    }

    #[tokio::test]
    async fn test_snapshot_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let nodes = cluster(1, &transport, dir.path()).await;
        let leader = find_leader(&nodes, Duration::from_secs(3)).await;

        for i in 0..5 {
            leader
                .apply(Command::CreateJob {
                    job: job(&format!("j{i}")),
                })
                .await
                .unwrap();
        }
        leader.take_snapshot().unwrap();
        leader.stop();
        drop(leader);
        drop(nodes);
        // The transport also holds the node; release it so sled unlocks
        transport.nodes.clear();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let recovered = RaftNode::new(
            "node-0",
            dir.path().join("node-0"),
            vec![RaftPeer {
                id: "node-0".into(),
                address: "127.0.0.1:7000".into(),
            }],
            transport.clone() as Arc<dyn RaftTransport>,
            fast_config(),
        )
        .unwrap();

        assert_eq!(recovered.list_jobs().len(), 5);
    }

    #[tokio::test]
    async fn test_membership_change() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let nodes = cluster(1, &transport, dir.path()).await;
        let leader = find_leader(&nodes, Duration::from_secs(3)).await;

        leader.add_voter("node-9", "127.0.0.1:7999").await.unwrap();
        assert!(leader
            .membership()
            .iter()
            .any(|p| p.id == "node-9"));

        let err = leader.add_voter("node-9", "127.0.0.1:7999").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AlreadyExists);
        leader.stop();
    }
}
