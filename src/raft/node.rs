//! Raft consensus node
//!
//! Every term, vote, log and commit mutation happens under `RaftNode::state`. The ticker
//! and the per-peer RPC tasks run concurrently and re-check role and term under that lock
//! before acting, so a stale timer or a late response changes nothing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::common::{Config, Error, RaftConfig, Result, METRICS};
use crate::kv::{decode_snapshot, encode_snapshot, KVMap, KeyRanges, MemoryKVStore, Mutations};

use super::messages::{
    AppendRequest, AppendResponse, CommitOutcome, CommitRequest, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use super::transport::RaftTransport;
use super::{HardState, HardStateStore, LogEntry, LogStore, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Point-in-time view of a node, served on `/status`
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub snapshot_index: u64,
    pub peers: Vec<NodeId>,
}

/// A local write waiting for its entry to be applied: `(term it was appended in, reply)`
type PendingCommit = (u64, oneshot::Sender<Result<()>>);

enum Outbound {
    Append(AppendRequest),
    Snapshot(SnapshotRequest),
}

struct RaftState {
    role: RaftRole,
    hard: HardState,
    leader_id: Option<NodeId>,
    log: LogStore,
    commit_index: u64,
    last_applied: u64,
    election_deadline: Instant,
    next_heartbeat: Instant,
    last_leader_contact: Option<Instant>,
    votes: HashSet<NodeId>,
    // Leader bookkeeping, reset on every election win
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    last_ack: HashMap<NodeId, Instant>,
    leader_since: Instant,
    pending: BTreeMap<u64, PendingCommit>,
    /// Set by shutdown or by an entry that cannot be applied
    halted: bool,
}

pub struct RaftNode {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport>,
    hard_store: HardStateStore,
    state: Mutex<RaftState>,
    store: MemoryKVStore,
    applied_tx: watch::Sender<u64>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftNode {
    /// Open the node's log, hard state and snapshot under `dir`.
    ///
    /// The state machine starts at the snapshot; committed entries after it are
    /// re-applied once the node learns the commit index again.
    pub fn open(
        id: impl Into<NodeId>,
        peers: Vec<NodeId>,
        config: RaftConfig,
        dir: impl AsRef<Path>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let log = LogStore::open(dir, config.sync_policy)?;
        let hard_store = HardStateStore::new(dir);
        let hard = hard_store.load()?;

        let store = MemoryKVStore::new();
        if let Some(snapshot) = log.load_snapshot()? {
            store.replace(decode_snapshot(&snapshot.data)?);
        }
        let applied = log.snapshot_index();
        let peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != id).collect();

        tracing::info!(
            "Raft node {} opened: term {}, log {}..={}, snapshot at {}",
            id,
            hard.current_term,
            log.first_index(),
            log.last_index(),
            applied
        );

        let now = Instant::now();
        let state = RaftState {
            role: RaftRole::Follower,
            hard,
            leader_id: None,
            log,
            commit_index: applied,
            last_applied: applied,
            election_deadline: now + config.random_election_timeout(),
            next_heartbeat: now,
            last_leader_contact: None,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_ack: HashMap::new(),
            leader_since: now,
            pending: BTreeMap::new(),
            halted: false,
        };
        let (applied_tx, _) = watch::channel(applied);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            id,
            peers,
            config,
            transport,
            hard_store,
            state: Mutex::new(state),
            store,
            applied_tx,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn from_config(config: &Config, transport: Arc<dyn RaftTransport>) -> Result<Arc<Self>> {
        Self::open(
            config.node_id.clone(),
            config.peer_ids(),
            config.raft.clone(),
            config.raft_dir(),
            transport,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn RaftTransport> {
        &self.transport
    }

    /// Start the election/heartbeat ticker
    pub fn start(self: &Arc<Self>) {
        let handle = start_raft_tasks(self.clone());
        self.tasks.lock().push(handle);
    }

    /// Stop ticking and refuse further RPCs. Outstanding local commits become indeterminate.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        let mut st = self.state.lock();
        st.halted = true;
        st.role = RaftRole::Follower;
        st.leader_id = None;
        for (index, (_, tx)) in std::mem::take(&mut st.pending) {
            let _ = tx.send(Err(Error::CommitIndeterminate(format!(
                "node stopped before entry {} resolved",
                index
            ))));
        }
        tracing::info!("Raft node {} stopped", self.id);
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().role == RaftRole::Leader
    }

    pub fn get_role(&self) -> RaftRole {
        self.state.lock().role
    }

    pub fn get_leader(&self) -> Option<NodeId> {
        self.state.lock().leader_id.clone()
    }

    pub fn get_term(&self) -> u64 {
        self.state.lock().hard.current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().commit_index
    }

    pub fn last_applied(&self) -> u64 {
        self.state.lock().last_applied
    }

    /// Copy of the log entries still held (not compacted), for inspection
    pub fn log_entries(&self) -> Vec<LogEntry> {
        let st = self.state.lock();
        st.log.entries_from(st.log.first_index(), usize::MAX)
    }

    pub fn status(&self) -> NodeStatus {
        let st = self.state.lock();
        NodeStatus {
            node_id: self.id.clone(),
            role: st.role,
            term: st.hard.current_term,
            leader_id: st.leader_id.clone(),
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            last_log_index: st.log.last_index(),
            last_log_term: st.log.last_term(),
            snapshot_index: st.log.snapshot_index(),
            peers: self.peers.clone(),
        }
    }

    /// Applied state together with the `(term, index)` it reflects
    pub fn read_state(&self) -> (Arc<KVMap>, u64, u64) {
        let st = self.state.lock();
        let term = st.log.term_at(st.last_applied).unwrap_or(0);
        (self.store.snapshot(), term, st.last_applied)
    }

    /// Whether this node has recently been in contact with a working majority
    pub fn has_quorum_contact(&self) -> bool {
        let st = self.state.lock();
        if st.halted {
            return false;
        }
        let now = Instant::now();
        let window = self.config.election_timeout_max();
        match st.role {
            RaftRole::Leader => {
                now.duration_since(st.leader_since) <= window
                    || self.acked_within(&st, now, window) + 1 >= self.quorum()
            }
            RaftRole::Follower => {
                st.leader_id.is_some()
                    && st
                        .last_leader_contact
                        .is_some_and(|t| now.duration_since(t) <= window)
            }
            RaftRole::Candidate => false,
        }
    }

    /// Resolve once the local state machine has applied `index`
    pub async fn wait_applied(&self, index: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.applied_tx.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() >= index {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(Error::Internal("raft node dropped".into()));
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            Error::CommitIndeterminate(format!(
                "index {} not applied locally within {:?}",
                index, timeout
            ))
        })?
    }

    fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn acked_within(&self, st: &RaftState, now: Instant, window: Duration) -> usize {
        self.peers
            .iter()
            .filter(|p| {
                st.last_ack
                    .get(*p)
                    .is_some_and(|t| now.duration_since(*t) <= window)
            })
            .count()
    }

    fn persist_hard_state(&self, st: &RaftState) -> Result<()> {
        self.hard_store.save(&st.hard)?;
        METRICS.current_term.set(st.hard.current_term);
        Ok(())
    }

    /// Adopt `term` (if newer) and become a follower of `leader`
    fn become_follower(&self, st: &mut RaftState, term: u64, leader: Option<NodeId>) -> Result<()> {
        if term > st.hard.current_term {
            st.hard.current_term = term;
            st.hard.voted_for = None;
            self.persist_hard_state(st)?;
        }
        if st.role != RaftRole::Follower {
            tracing::info!(
                "Node {} stepping down from {} in term {}",
                self.id,
                st.role,
                st.hard.current_term
            );
        }
        st.role = RaftRole::Follower;
        st.leader_id = leader;
        st.votes.clear();
        st.election_deadline = Instant::now() + self.config.random_election_timeout();
        Ok(())
    }

    // ---- timers ----

    fn tick(self: &Arc<Self>) {
        let now = Instant::now();
        let (heartbeat, election) = {
            let mut st = self.state.lock();
            if st.halted {
                return;
            }
            let role = st.role;
            match role {
                RaftRole::Leader => {
                    let window = self.config.election_timeout_max();
                    if now.duration_since(st.leader_since) > window
                        && self.acked_within(&st, now, window) + 1 < self.quorum()
                    {
                        tracing::warn!(
                            "Leader {} lost contact with a majority in term {}",
                            self.id,
                            st.hard.current_term
                        );
                        let term = st.hard.current_term;
                        if let Err(e) = self.become_follower(&mut st, term, None) {
                            tracing::error!("Node {} failed to step down: {}", self.id, e);
                        }
                        (false, false)
                    } else if now >= st.next_heartbeat {
                        st.next_heartbeat = now + self.config.heartbeat_interval();
                        (true, false)
                    } else {
                        (false, false)
                    }
                }
                _ => (false, now >= st.election_deadline),
            }
        };
        if heartbeat {
            self.broadcast_append();
        }
        if election {
            self.start_election();
        }
    }

    // ---- elections ----

    fn start_election(self: &Arc<Self>) {
        let request = {
            let mut st = self.state.lock();
            if st.halted || st.role == RaftRole::Leader || Instant::now() < st.election_deadline {
                return;
            }
            let previous = st.hard.clone();
            st.hard.current_term += 1;
            st.hard.voted_for = Some(self.id.clone());
            if let Err(e) = self.persist_hard_state(&st) {
                tracing::error!("Node {} cannot persist its vote: {}", self.id, e);
                st.hard = previous;
                st.election_deadline = Instant::now() + self.config.random_election_timeout();
                return;
            }
            st.role = RaftRole::Candidate;
            st.leader_id = None;
            st.votes.clear();
            st.votes.insert(self.id.clone());
            st.election_deadline = Instant::now() + self.config.random_election_timeout();
            METRICS.elections_started.inc();
            tracing::info!(
                "Node {} starting election for term {}",
                self.id,
                st.hard.current_term
            );

            if st.votes.len() >= self.quorum() {
                let won = self.become_leader(&mut st);
                drop(st);
                if won {
                    self.broadcast_append();
                }
                return;
            }
            VoteRequest {
                term: st.hard.current_term,
                candidate_id: self.id.clone(),
                last_log_index: st.log.last_index(),
                last_log_term: st.log.last_term(),
            }
        };

        for peer in &self.peers {
            let node = self.clone();
            let peer = peer.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let term = request.term;
                let result = tokio::time::timeout(
                    node.config.rpc_timeout(),
                    node.transport.request_vote(&peer, request),
                )
                .await;
                match result {
                    Ok(Ok(response)) => node.handle_vote_response(&peer, term, response),
                    Ok(Err(e)) => tracing::debug!("RequestVote to {} failed: {}", peer, e),
                    Err(_) => tracing::debug!("RequestVote to {} timed out", peer),
                }
            });
        }
    }

    fn handle_vote_response(self: &Arc<Self>, peer: &str, election_term: u64, resp: VoteResponse) {
        let won = {
            let mut st = self.state.lock();
            if st.halted {
                return;
            }
            if resp.term > st.hard.current_term {
                if let Err(e) = self.become_follower(&mut st, resp.term, None) {
                    tracing::error!("Node {} failed to adopt term {}: {}", self.id, resp.term, e);
                }
                return;
            }
            if st.role != RaftRole::Candidate
                || st.hard.current_term != election_term
                || !resp.vote_granted
            {
                return;
            }
            st.votes.insert(peer.to_string());
            tracing::debug!(
                "Node {} got vote from {} ({}/{})",
                self.id,
                peer,
                st.votes.len(),
                self.quorum()
            );
            st.votes.len() >= self.quorum() && self.become_leader(&mut st)
        };
        if won {
            self.broadcast_append();
        }
    }

    /// Take leadership of the current term and append its no-op entry
    fn become_leader(&self, st: &mut RaftState) -> bool {
        let term = st.hard.current_term;
        let next = st.log.last_index() + 1;
        if let Err(e) = st.log.append(&[LogEntry::new(term, next, Vec::new())]) {
            tracing::error!("Node {} could not append its no-op entry: {}", self.id, e);
            return false;
        }

        let now = Instant::now();
        st.role = RaftRole::Leader;
        st.leader_id = Some(self.id.clone());
        st.votes.clear();
        st.next_index = self.peers.iter().map(|p| (p.clone(), next)).collect();
        st.match_index = self.peers.iter().map(|p| (p.clone(), 0)).collect();
        st.last_ack.clear();
        st.leader_since = now;
        st.next_heartbeat = now + self.config.heartbeat_interval();

        METRICS.leaderships_won.inc();
        tracing::info!("Node {} became leader for term {}", self.id, term);

        self.advance_commit(st);
        true
    }

    // ---- replication (leader side) ----

    fn broadcast_append(self: &Arc<Self>) {
        for peer in &self.peers {
            self.spawn_replicate(peer.clone());
        }
    }

    fn spawn_replicate(self: &Arc<Self>, peer: NodeId) {
        let node = self.clone();
        tokio::spawn(async move {
            node.replicate_to(&peer).await;
        });
    }

    async fn replicate_to(self: &Arc<Self>, peer: &str) -> bool {
        let message = {
            let st = self.state.lock();
            if st.halted || st.role != RaftRole::Leader {
                return false;
            }
            self.build_message(&st, peer)
        };
        match message {
            Some(message) => self.send_message(peer, message).await,
            None => false,
        }
    }

    fn build_message(&self, st: &RaftState, peer: &str) -> Option<Outbound> {
        let term = st.hard.current_term;
        let next = st
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(st.log.last_index() + 1)
            .clamp(1, st.log.last_index() + 1);

        if next <= st.log.snapshot_index() {
            return match st.log.load_snapshot() {
                Ok(Some(snapshot)) => Some(Outbound::Snapshot(SnapshotRequest {
                    term,
                    leader_id: self.id.clone(),
                    last_included_index: snapshot.index,
                    last_included_term: snapshot.term,
                    data: snapshot.data,
                })),
                Ok(None) => {
                    tracing::error!(
                        "Node {} compacted through {} but has no snapshot file",
                        self.id,
                        st.log.snapshot_index()
                    );
                    None
                }
                Err(e) => {
                    tracing::error!("Node {} cannot load snapshot for {}: {}", self.id, peer, e);
                    None
                }
            };
        }

        let prev_log_index = next - 1;
        let prev_log_term = st.log.term_at(prev_log_index)?;
        Some(Outbound::Append(AppendRequest {
            term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries: st
                .log
                .entries_from(next, self.config.max_entries_per_append.max(1)),
            leader_commit: st.commit_index,
        }))
    }

    /// Deliver one message; true if the peer acknowledged us as leader of the sending term
    async fn send_message(self: &Arc<Self>, peer: &str, message: Outbound) -> bool {
        match message {
            Outbound::Append(req) => {
                let term = req.term;
                let carried = !req.entries.is_empty();
                let result = tokio::time::timeout(
                    self.config.rpc_timeout(),
                    self.transport.append_entries(peer, req),
                )
                .await;
                match result {
                    Ok(Ok(resp)) => self.handle_append_response(peer, term, carried, resp),
                    Ok(Err(e)) => {
                        tracing::debug!("AppendEntries to {} failed: {}", peer, e);
                        false
                    }
                    Err(_) => {
                        tracing::debug!("AppendEntries to {} timed out", peer);
                        false
                    }
                }
            }
            Outbound::Snapshot(req) => {
                let term = req.term;
                let index = req.last_included_index;
                tracing::info!("Sending snapshot at {} to {}", index, peer);
                let result = tokio::time::timeout(
                    self.config.commit_timeout(),
                    self.transport.install_snapshot(peer, req),
                )
                .await;
                match result {
                    Ok(Ok(resp)) => self.handle_snapshot_response(peer, term, index, resp),
                    Ok(Err(e)) => {
                        tracing::warn!("InstallSnapshot to {} failed: {}", peer, e);
                        false
                    }
                    Err(_) => {
                        tracing::warn!("InstallSnapshot to {} timed out", peer);
                        false
                    }
                }
            }
        }
    }

    fn handle_append_response(
        self: &Arc<Self>,
        peer: &str,
        sent_term: u64,
        carried_entries: bool,
        resp: AppendResponse,
    ) -> bool {
        let retry = {
            let mut st = self.state.lock();
            if st.halted {
                return false;
            }
            if resp.term > st.hard.current_term {
                if let Err(e) = self.become_follower(&mut st, resp.term, None) {
                    tracing::error!("Node {} failed to adopt term {}: {}", self.id, resp.term, e);
                }
                return false;
            }
            if st.role != RaftRole::Leader || st.hard.current_term != sent_term {
                return false;
            }
            st.last_ack.insert(peer.to_string(), Instant::now());

            if resp.success {
                let matched = st.match_index.get(peer).copied().unwrap_or(0).max(resp.match_index);
                st.match_index.insert(peer.to_string(), matched);
                let next = st
                    .next_index
                    .get(peer)
                    .copied()
                    .unwrap_or(0)
                    .max(matched + 1);
                st.next_index.insert(peer.to_string(), next);
                self.advance_commit(&mut st);
                carried_entries && next <= st.log.last_index()
            } else {
                METRICS.append_rejections.inc();
                let floor = st.match_index.get(peer).copied().unwrap_or(0) + 1;
                let current = st.next_index.get(peer).copied().unwrap_or(floor);
                let hint = if resp.conflict_index > 0 && resp.conflict_index < current {
                    resp.conflict_index
                } else {
                    current.saturating_sub(1)
                };
                let next = hint.max(floor).max(1);
                st.next_index.insert(peer.to_string(), next);
                tracing::debug!("{} rejected append; retrying from {}", peer, next);
                next != current
            }
        };
        if retry {
            self.spawn_replicate(peer.to_string());
        }
        true
    }

    fn handle_snapshot_response(
        self: &Arc<Self>,
        peer: &str,
        sent_term: u64,
        index: u64,
        resp: SnapshotResponse,
    ) -> bool {
        let retry = {
            let mut st = self.state.lock();
            if st.halted {
                return false;
            }
            if resp.term > st.hard.current_term {
                if let Err(e) = self.become_follower(&mut st, resp.term, None) {
                    tracing::error!("Node {} failed to adopt term {}: {}", self.id, resp.term, e);
                }
                return false;
            }
            if st.role != RaftRole::Leader || st.hard.current_term != sent_term {
                return false;
            }
            st.last_ack.insert(peer.to_string(), Instant::now());
            let matched = st.match_index.get(peer).copied().unwrap_or(0).max(index);
            st.match_index.insert(peer.to_string(), matched);
            let next = st.next_index.get(peer).copied().unwrap_or(0).max(index + 1);
            st.next_index.insert(peer.to_string(), next);
            self.advance_commit(&mut st);
            next <= st.log.last_index()
        };
        if retry {
            self.spawn_replicate(peer.to_string());
        }
        true
    }

    /// Commit the highest index held by a majority, if it belongs to the current term
    fn advance_commit(&self, st: &mut RaftState) {
        if st.role != RaftRole::Leader {
            return;
        }
        let mut matched: Vec<u64> = self
            .peers
            .iter()
            .map(|p| st.match_index.get(p).copied().unwrap_or(0))
            .collect();
        matched.push(st.log.last_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum() - 1];
        if candidate > st.commit_index && st.log.term_at(candidate) == Some(st.hard.current_term)
        {
            st.commit_index = candidate;
            METRICS.commit_index.set(candidate);
            self.apply_committed(st);
        }
    }

    // ---- apply pipeline ----

    /// Apply committed entries in index order, resolving local waiters as they land
    fn apply_committed(&self, st: &mut RaftState) {
        if st.halted {
            return;
        }
        while st.last_applied < st.commit_index {
            let index = st.last_applied + 1;
            let (term, decoded) = match st.log.get(index) {
                Some(entry) if entry.is_noop() => (entry.term, None),
                Some(entry) => (entry.term, Some(Mutations::decode(&entry.command))),
                None => {
                    tracing::error!("Node {}: committed entry {} is missing", self.id, index);
                    st.halted = true;
                    return;
                }
            };
            match decoded {
                Some(Ok(mutations)) => self.store.apply(&mutations),
                Some(Err(e)) => {
                    tracing::error!(
                        "Node {}: committed entry {} cannot be decoded, halting apply: {}",
                        self.id,
                        index,
                        e
                    );
                    st.halted = true;
                    return;
                }
                None => {}
            }
            st.last_applied = index;
            METRICS.entries_committed.inc();

            if let Some((pending_term, tx)) = st.pending.remove(&index) {
                let result = if pending_term == term {
                    Ok(())
                } else {
                    Err(Error::NotLeader(st.leader_id.clone()))
                };
                let _ = tx.send(result);
            }
        }
        self.applied_tx.send_replace(st.last_applied);
        self.maybe_compact(st);
    }

    fn maybe_compact(&self, st: &mut RaftState) {
        let threshold = self.config.snapshot_threshold;
        if threshold == 0 || st.last_applied - st.log.snapshot_index() <= threshold {
            return;
        }
        let Some(term) = st.log.term_at(st.last_applied) else {
            return;
        };
        let data = encode_snapshot(&self.store.snapshot());
        match st.log.install_snapshot(st.last_applied, term, &data) {
            Ok(()) => tracing::info!(
                "Node {} compacted log through {} ({} bytes)",
                self.id,
                st.last_applied,
                data.len()
            ),
            Err(e) => tracing::warn!("Node {} failed to compact log: {}", self.id, e),
        }
    }

    /// Fail local waiters for entries at or after `index`, which are being discarded
    fn fail_pending_from(&self, st: &mut RaftState, index: u64) {
        let failed = st.pending.split_off(&index);
        for (_, (_, tx)) in failed {
            let _ = tx.send(Err(Error::NotLeader(st.leader_id.clone())));
        }
    }

    // ---- RPC handlers ----

    pub fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut st = self.state.lock();
        if st.halted {
            return Err(Error::Unavailable(format!("node {} is stopped", self.id)));
        }
        if req.term > st.hard.current_term {
            // A newer term alone leaves a running election timer alone; only a granted vote resets it
            let running_timer = (st.role != RaftRole::Leader).then_some(st.election_deadline);
            self.become_follower(&mut st, req.term, None)?;
            if let Some(deadline) = running_timer {
                st.election_deadline = deadline;
            }
        }
        let term = st.hard.current_term;
        if req.term < term {
            return Ok(VoteResponse {
                term,
                vote_granted: false,
            });
        }

        let free = st
            .hard
            .voted_for
            .as_deref()
            .map_or(true, |v| v == req.candidate_id);
        let up_to_date =
            (req.last_log_term, req.last_log_index) >= (st.log.last_term(), st.log.last_index());
        let vote_granted = free && up_to_date;

        if vote_granted {
            st.hard.voted_for = Some(req.candidate_id.clone());
            self.persist_hard_state(&st)?;
            st.election_deadline = Instant::now() + self.config.random_election_timeout();
            tracing::debug!(
                "Node {} voted for {} in term {}",
                self.id,
                req.candidate_id,
                term
            );
        }
        Ok(VoteResponse { term, vote_granted })
    }

    pub fn handle_append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        let mut st = self.state.lock();
        if st.halted {
            return Err(Error::Unavailable(format!("node {} is stopped", self.id)));
        }
        let current = st.hard.current_term;
        if req.term < current {
            return Ok(AppendResponse {
                term: current,
                success: false,
                match_index: 0,
                conflict_index: 0,
            });
        }
        self.become_follower(&mut st, req.term, Some(req.leader_id.clone()))?;
        st.last_leader_contact = Some(Instant::now());
        let term = st.hard.current_term;
        let snapshot_index = st.log.snapshot_index();

        // Anything at or below our snapshot is committed and therefore matches
        if req.prev_log_index >= snapshot_index {
            let matches = st.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
            if !matches {
                return Ok(AppendResponse {
                    term,
                    success: false,
                    match_index: 0,
                    conflict_index: conflict_hint(&st.log, req.prev_log_index),
                });
            }
        }

        let last_new = req.prev_log_index + req.entries.len() as u64;
        let mut to_append = Vec::new();
        for entry in req.entries {
            if entry.index <= snapshot_index {
                continue;
            }
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match st.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => {}
                Some(_) => {
                    if entry.index <= st.commit_index {
                        tracing::error!(
                            "Node {}: leader {} conflicts with committed entry {}",
                            self.id,
                            req.leader_id,
                            entry.index
                        );
                        return Err(Error::Internal(format!(
                            "refusing to truncate committed entry {}",
                            entry.index
                        )));
                    }
                    tracing::warn!(
                        "Node {} truncating conflicting log suffix from {}",
                        self.id,
                        entry.index
                    );
                    st.log.truncate_from(entry.index)?;
                    self.fail_pending_from(&mut st, entry.index);
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }
        st.log.append(&to_append)?;

        let commit = req.leader_commit.min(last_new);
        if commit > st.commit_index {
            st.commit_index = commit;
            METRICS.commit_index.set(commit);
            self.apply_committed(&mut st);
        }

        Ok(AppendResponse {
            term,
            success: true,
            match_index: last_new.max(snapshot_index),
            conflict_index: 0,
        })
    }

    pub fn handle_install_snapshot(&self, req: SnapshotRequest) -> Result<SnapshotResponse> {
        let mut st = self.state.lock();
        if st.halted {
            return Err(Error::Unavailable(format!("node {} is stopped", self.id)));
        }
        let current = st.hard.current_term;
        if req.term < current {
            return Ok(SnapshotResponse { term: current });
        }
        self.become_follower(&mut st, req.term, Some(req.leader_id.clone()))?;
        st.last_leader_contact = Some(Instant::now());
        let term = st.hard.current_term;

        let index = req.last_included_index;
        if index <= st.last_applied {
            return Ok(SnapshotResponse { term });
        }

        let map = decode_snapshot(&req.data)?;
        st.log
            .install_snapshot(index, req.last_included_term, &req.data)?;
        self.store.replace(map);
        if index > st.commit_index {
            st.commit_index = index;
            METRICS.commit_index.set(index);
        }
        st.last_applied = index;

        // Waiters covered by the snapshot cannot tell whether their entry survived
        let survivors = st.pending.split_off(&(index + 1));
        for (pending_index, (_, tx)) in std::mem::replace(&mut st.pending, survivors) {
            let _ = tx.send(Err(Error::CommitIndeterminate(format!(
                "entry {} was superseded by a snapshot",
                pending_index
            ))));
        }

        self.applied_tx.send_replace(index);
        METRICS.snapshots_installed.inc();
        tracing::info!(
            "Node {} installed snapshot at {} from {}",
            self.id,
            index,
            req.leader_id
        );
        Ok(SnapshotResponse { term })
    }

    pub async fn handle_forward_commit(self: &Arc<Self>, req: CommitRequest) -> CommitOutcome {
        let mutations = if req.mutations.is_empty() {
            Mutations::new()
        } else {
            match Mutations::decode(&req.mutations) {
                Ok(m) => m,
                Err(e) => return CommitOutcome::Failed(format!("undecodable mutations: {}", e)),
            }
        };
        match self
            .submit(req.base_term, req.base_index, &req.reads, mutations)
            .await
        {
            Ok((term, index)) => CommitOutcome::Committed { term, index },
            Err(e) => CommitOutcome::from_error(e),
        }
    }

    // ---- transactions ----

    /// Validate a transaction that read state `(base_term, base_index)` and, if it wrote
    /// anything, replicate its mutations as one entry.
    ///
    /// Returns the `(term, index)` of the committed entry, or for a read-only transaction
    /// the base it was validated at. Leader only.
    pub async fn submit(
        self: &Arc<Self>,
        base_term: u64,
        base_index: u64,
        reads: &KeyRanges,
        mutations: Mutations,
    ) -> Result<(u64, u64)> {
        let started = Instant::now();
        let waiting = {
            let mut st = self.state.lock();
            if st.halted || st.role != RaftRole::Leader {
                return Err(Error::NotLeader(st.leader_id.clone()));
            }
            self.check_conflicts(&st, base_term, base_index, reads)?;

            if mutations.is_empty() {
                None
            } else {
                let term = st.hard.current_term;
                let index = st.log.last_index() + 1;
                st.log
                    .append(&[LogEntry::new(term, index, mutations.encode())])?;
                let (tx, rx) = oneshot::channel();
                st.pending.insert(index, (term, tx));
                self.advance_commit(&mut st);
                Some((term, index, rx))
            }
        };

        let Some((term, index, rx)) = waiting else {
            self.confirm_leadership().await?;
            return Ok((base_term, base_index));
        };

        self.broadcast_append();
        let timeout = self.config.commit_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                METRICS.commit_latency.observe(started.elapsed());
                Ok((term, index))
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::CommitIndeterminate(format!(
                "entry {} was abandoned before it resolved",
                index
            ))),
            Err(_) => {
                METRICS.commit_timeouts.inc();
                tracing::warn!("Entry {} not committed within {:?}", index, timeout);
                Err(Error::CommitIndeterminate(format!(
                    "entry {} not committed within {:?}",
                    index, timeout
                )))
            }
        }
    }

    fn check_conflicts(
        &self,
        st: &RaftState,
        base_term: u64,
        base_index: u64,
        reads: &KeyRanges,
    ) -> Result<()> {
        if reads.is_empty() {
            return Ok(());
        }
        if base_index < st.log.snapshot_index() {
            return Err(Error::Conflict(format!(
                "transaction base {} has been compacted",
                base_index
            )));
        }
        if st.log.term_at(base_index) != Some(base_term) {
            return Err(Error::Conflict(format!(
                "transaction base {}@{} is no longer in the log",
                base_index, base_term
            )));
        }
        for entry in st.log.entries_between(base_index, st.log.last_index()) {
            if entry.is_noop() {
                continue;
            }
            if Mutations::decode(&entry.command)?.conflicts_with(reads) {
                METRICS.transaction_conflicts.inc();
                return Err(Error::Conflict(format!(
                    "read set overlaps entry {}",
                    entry.index
                )));
            }
        }
        Ok(())
    }

    /// Succeeds once a majority has acknowledged a round of appends sent after this call
    pub async fn confirm_leadership(self: &Arc<Self>) -> Result<()> {
        let (term, messages) = {
            let st = self.state.lock();
            if st.halted || st.role != RaftRole::Leader {
                return Err(Error::NotLeader(st.leader_id.clone()));
            }
            let messages: Vec<(NodeId, Outbound)> = self
                .peers
                .iter()
                .filter_map(|p| self.build_message(&st, p).map(|m| (p.clone(), m)))
                .collect();
            (st.hard.current_term, messages)
        };

        let needed = self.quorum() - 1;
        if needed == 0 {
            return Ok(());
        }
        let mut inflight: FuturesUnordered<_> = messages
            .into_iter()
            .map(|(peer, message)| {
                let node = self.clone();
                async move { node.send_message(&peer, message).await }
            })
            .collect();

        let mut acks = 0;
        while let Some(acked) = inflight.next().await {
            if acked {
                acks += 1;
                if acks >= needed {
                    return Ok(());
                }
            }
        }
        tracing::debug!(
            "Node {} could not confirm leadership of term {}",
            self.id,
            term
        );
        Err(Error::NotLeader(None))
    }
}

/// Where a leader should resume after `prev` failed to match: the start of the
/// conflicting term's run, or just past our last entry
fn conflict_hint(log: &LogStore, prev: u64) -> u64 {
    let last = log.last_index();
    if prev > last {
        return last + 1;
    }
    let term = log.term_at(prev);
    let mut index = prev;
    while index > log.first_index() && log.term_at(index - 1) == term {
        index -= 1;
    }
    index.max(1)
}

/// Drive elections and heartbeats until the node shuts down
pub fn start_raft_tasks(node: Arc<RaftNode>) -> JoinHandle<()> {
    let mut shutdown = node.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let tick = (node.config.heartbeat_interval() / 2).max(Duration::from_millis(5));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            node.tick();
        }
        tracing::debug!("Raft tasks for {} finished", node.id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::MemoryNetwork;
    use tempfile::{tempdir, TempDir};

    fn test_config() -> RaftConfig {
        let mut config = Config::new("n1", "/tmp").raft;
        config.election_timeout_min_ms = 50;
        config.election_timeout_max_ms = 100;
        config.heartbeat_interval_ms = 10;
        config.commit_timeout_ms = 2000;
        config
    }

    fn open_node(dir: &TempDir, id: &str, peers: &[&str]) -> Arc<RaftNode> {
        let network = MemoryNetwork::new();
        RaftNode::open(
            id,
            peers.iter().map(|p| p.to_string()).collect(),
            test_config(),
            dir.path(),
            network.transport(id),
        )
        .unwrap()
    }

    fn put(key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut m = Mutations::new();
        m.put(key, value);
        m.encode()
    }

    fn append(term: u64, prev: (u64, u64), entries: Vec<LogEntry>, commit: u64) -> AppendRequest {
        AppendRequest {
            term,
            leader_id: "n2".into(),
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries,
            leader_commit: commit,
        }
    }

    async fn wait_for_leader(node: &RaftNode) {
        for _ in 0..200 {
            if node.is_leader() && node.commit_index() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never became leader");
    }

    #[test]
    fn test_vote_once_per_term() {
        let dir = tempdir().unwrap();
        let node = open_node(&dir, "n1", &["n2", "n3"]);

        let vote = |candidate: &str, term: u64| VoteRequest {
            term,
            candidate_id: candidate.into(),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert!(node.handle_request_vote(vote("n2", 1)).unwrap().vote_granted);
        assert!(node.handle_request_vote(vote("n2", 1)).unwrap().vote_granted);
        assert!(!node.handle_request_vote(vote("n3", 1)).unwrap().vote_granted);
        assert!(node.handle_request_vote(vote("n3", 2)).unwrap().vote_granted);

        let stale = node.handle_request_vote(vote("n2", 1)).unwrap();
        assert!(!stale.vote_granted);
        assert_eq!(stale.term, 2);
    }

    #[test]
    fn test_vote_refused_to_stale_log() {
        let dir = tempdir().unwrap();
        let node = open_node(&dir, "n1", &["n2", "n3"]);
        node.handle_append_entries(append(3, (0, 0), vec![LogEntry::new(3, 1, vec![])], 0))
            .unwrap();

        let resp = node
            .handle_request_vote(VoteRequest {
                term: 4,
                candidate_id: "n3".into(),
                last_log_index: 5,
                last_log_term: 2,
            })
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 4);
        assert_eq!(node.get_term(), 4);
    }

    #[test]
    fn test_refused_vote_keeps_election_timer() {
        let dir = tempdir().unwrap();
        let node = open_node(&dir, "n1", &["n2", "n3"]);
        node.handle_append_entries(append(3, (0, 0), vec![LogEntry::new(3, 1, vec![])], 0))
            .unwrap();
        let deadline = node.state.lock().election_deadline;

        let resp = node
            .handle_request_vote(VoteRequest {
                term: 4,
                candidate_id: "n3".into(),
                last_log_index: 1,
                last_log_term: 2,
            })
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(node.get_term(), 4);
        assert_eq!(node.state.lock().election_deadline, deadline);

        std::thread::sleep(Duration::from_millis(110));
        let resp = node
            .handle_request_vote(VoteRequest {
                term: 5,
                candidate_id: "n3".into(),
                last_log_index: 1,
                last_log_term: 3,
            })
            .unwrap();
        assert!(resp.vote_granted);
        assert!(node.state.lock().election_deadline > deadline);
    }

    #[test]
    fn test_vote_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let node = open_node(&dir, "n1", &["n2", "n3"]);
            node.handle_request_vote(VoteRequest {
                term: 5,
                candidate_id: "n2".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        }
        let node = open_node(&dir, "n1", &["n2", "n3"]);
        assert_eq!(node.get_term(), 5);
        let resp = node
            .handle_request_vote(VoteRequest {
                term: 5,
                candidate_id: "n3".into(),
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!resp.vote_granted);
    }

    #[test]
    fn test_append_applies_up_to_leader_commit() {
        let dir = tempdir().unwrap();
        let node = open_node(&dir, "n1", &["n2", "n3"]);

        let entries = vec![
            LogEntry::new(1, 1, put(b"a", b"1")),
            LogEntry::new(1, 2, put(b"b", b"2")),
        ];
        let resp = node.handle_append_entries(append(1, (0, 0), entries, 1)).unwrap();
        assert!(resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(node.commit_index(), 1);
        assert_eq!(node.last_applied(), 1);
        assert_eq!(node.get_leader().as_deref(), Some("n2"));

        let (state, term, index) = node.read_state();
        assert_eq!((term, index), (1, 1));
        assert_eq!(state.get(b"a".as_slice()), Some(&b"1".to_vec()));
        assert!(!state.contains_key(b"b".as_slice()));

        // leader_commit beyond what was sent is capped at the last new entry
        let resp = node.handle_append_entries(append(1, (2, 1), vec![], 10)).unwrap();
        assert!(resp.success);
        assert_eq!(node.commit_index(), 2);
    }

    #[test]
    fn test_append_rejects_mismatch_with_hint() {
        let dir = tempdir().unwrap();
        let node = open_node(&dir, "n1", &["n2", "n3"]);
        let entries = (1..=3).map(|i| LogEntry::new(1, i, vec![])).collect();
        node.handle_append_entries(append(1, (0, 0), entries, 0)).unwrap();

        let resp = node.handle_append_entries(append(2, (6, 2), vec![], 0)).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 4);

        let resp = node.handle_append_entries(append(2, (3, 2), vec![], 0)).unwrap();
        assert!(!resp.success);
        assert_eq!(resp.conflict_index, 1);

        let stale = node.handle_append_entries(append(1, (3, 1), vec![], 0)).unwrap();
        assert!(!stale.success);
        assert_eq!(stale.term, 2);
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let dir = tempdir().unwrap();
        let node = open_node(&dir, "n1", &["n2", "n3"]);
        let entries = vec![
            LogEntry::new(1, 1, vec![]),
            LogEntry::new(1, 2, put(b"x", b"old")),
            LogEntry::new(1, 3, put(b"y", b"old")),
        ];
        node.handle_append_entries(append(1, (0, 0), entries, 1)).unwrap();

        let replacement = vec![LogEntry::new(2, 2, put(b"x", b"new"))];
        let resp = node
            .handle_append_entries(append(2, (1, 1), replacement, 2))
            .unwrap();
        assert!(resp.success);

        let log = node.log_entries();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 2);
        let (state, _, _) = node.read_state();
        assert_eq!(state.get(b"x".as_slice()), Some(&b"new".to_vec()));
        assert!(!state.contains_key(b"y".as_slice()));
    }

    #[tokio::test]
    async fn test_single_node_commits_and_detects_conflicts() {
        let dir = tempdir().unwrap();
        let node = open_node(&dir, "n1", &[]);
        node.start();
        wait_for_leader(&node).await;

        let (_, base_term, base_index) = node.read_state();
        let mut reads = KeyRanges::new();
        reads.add_key(b"k");
        let mut m = Mutations::new();
        m.put(b"k", b"v1");
        let (_, index) = node.submit(base_term, base_index, &reads, m).await.unwrap();
        assert_eq!(node.last_applied(), index);

        // a second transaction that read `k` before the first committed
        let mut m = Mutations::new();
        m.put(b"k", b"v2");
        let err = node.submit(base_term, base_index, &reads, m).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // read-only commit at the current base succeeds
        let (_, term, index) = node.read_state();
        assert_eq!(
            node.submit(term, index, &reads, Mutations::new()).await.unwrap(),
            (term, index)
        );
        node.shutdown();
    }

    #[tokio::test]
    async fn test_restart_replays_committed_entries() {
        let dir = tempdir().unwrap();
        {
            let node = open_node(&dir, "n1", &[]);
            node.start();
            wait_for_leader(&node).await;
            for i in 0..5u8 {
                let mut m = Mutations::new();
                m.put(&[i], &[i]);
                node.submit(0, 0, &KeyRanges::new(), m).await.unwrap();
            }
            node.shutdown();
        }

        let node = open_node(&dir, "n1", &[]);
        node.start();
        wait_for_leader(&node).await;
        let (state, _, _) = node.read_state();
        assert_eq!(state.len(), 5);
        assert!(node.get_term() >= 2);
        node.shutdown();
    }

    #[test]
    fn test_snapshot_makes_covered_waiters_indeterminate() {
        let dir = tempdir().unwrap();
        let node = open_node(&dir, "n1", &["n2", "n3"]);
        let (covered_tx, mut covered_rx) = oneshot::channel();
        let (later_tx, mut later_rx) = oneshot::channel();
        {
            let mut st = node.state.lock();
            st.pending.insert(2, (1, covered_tx));
            st.pending.insert(5, (1, later_tx));
        }

        let mut map = KVMap::new();
        map.insert(b"k".to_vec(), b"v".to_vec());
        node.handle_install_snapshot(SnapshotRequest {
            term: 2,
            leader_id: "n2".into(),
            last_included_index: 3,
            last_included_term: 2,
            data: encode_snapshot(&map),
        })
        .unwrap();

        assert!(matches!(
            covered_rx.try_recv(),
            Ok(Err(Error::CommitIndeterminate(_)))
        ));
        assert!(matches!(
            later_rx.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ));
        assert_eq!(node.last_applied(), 3);
        let (state, _, _) = node.read_state();
        assert_eq!(state.get(b"k".as_slice()), Some(&b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_follower_refuses_submit() {
        let dir = tempdir().unwrap();
        let node = open_node(&dir, "n1", &["n2", "n3"]);
        node.handle_append_entries(append(1, (0, 0), vec![], 0)).unwrap();
        let err = node
            .submit(0, 0, &KeyRanges::new(), Mutations::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotLeader(Some(ref l)) if l == "n2"));
    }
}
