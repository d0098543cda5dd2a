//! Consensus drive loop.
//!
//! One dedicated task per node owns the raft `RawNode`, the disk-backed
//! storage, and the SQL state machine. Everything else in the crate talks to
//! consensus through [`ConsensusHandle`]: submit a command, ask who leads,
//! ask the local role. Committed entries are applied to the state machine
//! strictly in log order on this single task, which is what serializes
//! access to the embedded engine.

#![allow(clippy::field_reassign_with_default)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use slog::{o, Drain};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::{self, Duration, Instant};

use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole, INVALID_ID};

use crate::command::JoinRequest;
use crate::raft::proposal::{Proposal, ProposalResult};
use crate::raft::storage::DiskStorage;
use crate::raft::StateMachine;
use crate::raft_client::PeerRegistry;

const TICK_INTERVAL: Duration = Duration::from_millis(40);
// Election timeout ~200ms, heartbeat ~80ms, in ticks.
const ELECTION_TICKS: usize = 5;
const HEARTBEAT_TICKS: usize = 2;
const LOGGER_CHANNEL_SIZE: usize = 4096;
const OUT_MAILBOX_DEPTH: usize = 1000;
const PROPOSAL_DEPTH: usize = 256;

fn drive_config(id: u64) -> Config {
    Config {
        id,
        election_tick: ELECTION_TICKS,
        heartbeat_tick: HEARTBEAT_TICKS,
        ..Default::default()
    }
}

/// Local node role as exposed to the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl Role {
    fn from_u8(raw: u8) -> Role {
        match raw {
            2 => Role::Leader,
            1 => Role::Candidate,
            _ => Role::Follower,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Role::Follower => 0,
            Role::Candidate => 1,
            Role::Leader => 2,
        }
    }
}

#[derive(Default)]
struct NodeStatus {
    leader: AtomicU64,
    role: AtomicU8,
}

/// Narrow interface to the consensus engine held by the request handlers.
#[derive(Clone)]
pub struct ConsensusHandle {
    proposals: Sender<Proposal>,
    status: Arc<NodeStatus>,
    log_was_empty: bool,
}

impl ConsensusHandle {
    /// Submits a normal entry and blocks until it is committed and applied
    /// locally, returning the apply result.
    pub async fn submit(&self, data: Vec<u8>) -> ProposalResult {
        let (proposal, rx) = Proposal::normal(data);
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| "consensus engine is not running".to_string())?;
        rx.await
            .map_err(|_| "proposal dropped before commit".to_string())?
    }

    /// Submits a configuration change and blocks until it is committed.
    pub async fn submit_conf_change(&self, cc: ConfChange) -> ProposalResult {
        let (proposal, rx) = Proposal::conf_change(&cc);
        self.proposals
            .send(proposal)
            .await
            .map_err(|_| "consensus engine is not running".to_string())?;
        rx.await
            .map_err(|_| "proposal dropped before commit".to_string())?
    }

    /// Identity of the current leader, if one has been elected.
    pub fn leader(&self) -> Option<u64> {
        match self.status.leader.load(Ordering::Relaxed) {
            INVALID_ID => None,
            id => Some(id),
        }
    }

    pub fn state(&self) -> Role {
        Role::from_u8(self.status.role.load(Ordering::Relaxed))
    }

    /// Whether the on-disk log held no entries when this node started.
    pub fn is_log_empty(&self) -> bool {
        self.log_was_empty
    }
}

pub struct Node<S: StateMachine> {
    raft_group: RawNode<DiskStorage>,
    out_mailbox: Sender<Message>,
    my_mailbox: Receiver<Message>,
    state_machine: S,
    proposals: Receiver<Proposal>,
    proposed: VecDeque<Proposal>,
    apply_results: HashMap<u64, ProposalResult>,
    status: Arc<NodeStatus>,
    peers: PeerRegistry,
}

impl<S: StateMachine + Send + 'static> Node<S> {
    /// Opens storage, builds the raft group, and spawns the drive task.
    ///
    /// `bootstrap` seeds a brand-new single-voter cluster (ignored when the
    /// data directory already holds state). Returns the handle used to
    /// submit commands and the outbound mailbox the transport drains.
    pub fn start_raft(
        id: u64,
        bootstrap: bool,
        base_path: &str,
        state_machine: S,
        my_mailbox: Receiver<Message>,
        peers: PeerRegistry,
    ) -> anyhow::Result<(ConsensusHandle, Receiver<Message>)> {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        let logger = slog::Logger::root(drain, o!("tag" => format!("peer_{}", id)));

        let log_was_empty = DiskStorage::log_is_empty(base_path);
        let storage = DiskStorage::new(base_path, bootstrap.then_some(id))?;
        let raft_group = RawNode::new(&drive_config(id), storage, &logger)?;

        let (out_tx, out_rx) = mpsc::channel(OUT_MAILBOX_DEPTH);
        let (proposal_tx, proposal_rx) = mpsc::channel(PROPOSAL_DEPTH);
        let status = Arc::new(NodeStatus::default());

        let mut node = Node {
            raft_group,
            out_mailbox: out_tx,
            my_mailbox,
            state_machine,
            proposals: proposal_rx,
            proposed: VecDeque::new(),
            apply_results: HashMap::new(),
            status: status.clone(),
            peers,
        };
        tokio::spawn(async move {
            node.run().await;
        });

        Ok((
            ConsensusHandle {
                proposals: proposal_tx,
                status,
                log_was_empty,
            },
            out_rx,
        ))
    }

    async fn run(&mut self) {
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                Some(msg) = self.my_mailbox.recv() => {
                    let _ = self.raft_group.step(msg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        let _ = self.raft_group.step(msg);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    self.propose(proposal);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        self.propose(proposal);
                    }
                }
                _ = time::sleep(Duration::from_millis(1)) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raft_group.tick();
                last_tick = Instant::now();
            }

            self.on_ready();
            self.publish_status();
            self.fail_abandoned_proposals();
        }
    }

    fn propose(&mut self, mut proposal: Proposal) {
        if self.raft_group.raft.state != StateRole::Leader {
            proposal.respond(Err("not leader".to_string()));
            return;
        }

        let proposed_index = self.raft_group.raft.raft_log.last_index() + 1;
        let accepted = if let Some(ref data) = proposal.normal {
            self.raft_group.propose(vec![], data.clone()).is_ok()
        } else if let Some(ref cc) = proposal.conf_change {
            self.raft_group.propose_conf_change(vec![], cc.clone()).is_ok()
        } else {
            false
        };

        let new_index = self.raft_group.raft.raft_log.last_index() + 1;
        if !accepted || new_index == proposed_index {
            proposal.respond(Err("submission rejected by consensus engine".to_string()));
        } else {
            proposal.proposed = proposed_index;
            self.proposed.push_back(proposal);
        }
    }

    fn on_ready(&mut self) {
        if !self.raft_group.has_ready() {
            return;
        }

        let mut ready = self.raft_group.ready();

        // Step 1: hand outbound messages to the transport.
        if !ready.messages().is_empty() {
            Self::send_messages(&self.out_mailbox, &ready.take_messages());
        }

        // Step 2: install a snapshot if the leader sent one. Snapshots carry
        // no engine data here; the joiner's engine is rebuilt by the entries
        // that follow.
        if *ready.snapshot() != Snapshot::default() {
            let snapshot = ready.snapshot().clone();
            let store = &mut self.raft_group.raft.raft_log.store;
            if let Err(e) = store.apply_snapshot(&snapshot) {
                log::error!("failed to install snapshot: {:?}", e);
                return;
            }
        }

        // Step 3: apply entries committed so far.
        let mut applied = Self::handle_committed_entries(
            &mut self.raft_group,
            ready.take_committed_entries(),
            &mut self.state_machine,
            &mut self.apply_results,
            &self.peers,
        );

        // Step 4: persist new entries and hard state before acking them.
        {
            let store = &mut self.raft_group.raft.raft_log.store;
            if let Err(e) = store.append_entries(ready.entries()) {
                log::error!("failed to persist raft log: {:?}", e);
                return;
            }
            if let Some(hs) = ready.hs() {
                store.set_hardstate(hs.clone());
            }
        }
        if !ready.persisted_messages().is_empty() {
            Self::send_messages(&self.out_mailbox, &ready.take_persisted_messages());
        }

        // Step 5: advance, record the new commit point, apply the rest.
        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.raft.raft_log.store.set_commit(commit);
        }
        Self::send_messages(&self.out_mailbox, light_rd.messages());
        applied = applied.max(Self::handle_committed_entries(
            &mut self.raft_group,
            light_rd.take_committed_entries(),
            &mut self.state_machine,
            &mut self.apply_results,
            &self.peers,
        ));

        self.notice_proposed(applied);
        self.raft_group.advance_apply();
    }

    /// Applies committed entries in order and returns the last applied
    /// index. Apply results are parked by index until `notice_proposed`
    /// matches them with waiting submitters.
    fn handle_committed_entries(
        raft_group: &mut RawNode<DiskStorage>,
        entries: Vec<Entry>,
        state_machine: &mut S,
        apply_results: &mut HashMap<u64, ProposalResult>,
        peers: &PeerRegistry,
    ) -> u64 {
        let mut last_applied = 0u64;
        for entry in entries {
            last_applied = entry.index;
            if entry.data.is_empty() {
                // Leader no-op appended on election.
                continue;
            }

            match entry.get_entry_type() {
                EntryType::EntryConfChange => {
                    let mut cc = ConfChange::default();
                    if let Err(e) = cc.merge_from_bytes(&entry.data) {
                        log::error!("undecodable conf change at index {}: {}", entry.index, e);
                        continue;
                    }
                    match raft_group.apply_conf_change(&cc) {
                        Ok(cs) => {
                            raft_group.raft.raft_log.store.set_conf_state(cs);
                            Self::record_peer(peers, &cc);
                            apply_results.insert(entry.index, Ok(Vec::new()));
                        }
                        Err(e) => {
                            apply_results.insert(
                                entry.index,
                                Err(format!("configuration change rejected: {}", e)),
                            );
                        }
                    }
                }
                _ => {
                    let result = state_machine.apply(entry.index, entry.data.as_ref());
                    if let Err(ref e) = result {
                        log::warn!("apply failed at index {}: {}", entry.index, e);
                    }
                    apply_results.insert(entry.index, result);
                }
            }
        }
        last_applied
    }

    /// Learns a joiner's dial address from the conf-change context.
    fn record_peer(peers: &PeerRegistry, cc: &ConfChange) {
        if cc.get_context().is_empty() {
            return;
        }
        match bincode::deserialize::<JoinRequest>(cc.get_context()) {
            Ok(join) => {
                log::info!("node {} joined as {}", cc.node_id, join.name);
                peers.record(cc.node_id, join.connection_string);
            }
            Err(e) => log::warn!("conf change for node {} carried undecodable context: {}", cc.node_id, e),
        }
    }

    /// Resolves submitters whose entries have been applied, then drops
    /// results nobody was waiting for (followers apply every entry).
    fn notice_proposed(&mut self, last_applied: u64) {
        if last_applied == 0 {
            return;
        }

        let mut i = 0;
        while i < self.proposed.len() {
            if self.proposed[i].proposed <= last_applied {
                let mut proposal = self.proposed.remove(i).unwrap();
                let result = self
                    .apply_results
                    .remove(&proposal.proposed)
                    .unwrap_or_else(|| Err("entry superseded before apply".to_string()));
                proposal.respond(result);
            } else {
                i += 1;
            }
        }
        self.apply_results.retain(|&index, _| index > last_applied);
    }

    /// A leader that loses its term can no longer answer for pending
    /// proposals; failing them beats leaving the submitters hung.
    fn fail_abandoned_proposals(&mut self) {
        if self.raft_group.raft.state == StateRole::Leader || self.proposed.is_empty() {
            return;
        }
        while let Some(mut proposal) = self.proposed.pop_front() {
            proposal.respond(Err("leadership lost before commit".to_string()));
        }
    }

    fn publish_status(&self) {
        let role = match self.raft_group.raft.state {
            StateRole::Leader => Role::Leader,
            StateRole::Candidate | StateRole::PreCandidate => Role::Candidate,
            StateRole::Follower => Role::Follower,
        };
        self.status
            .leader
            .store(self.raft_group.raft.leader_id, Ordering::Relaxed);
        self.status.role.store(role.as_u8(), Ordering::Relaxed);
    }

    fn send_messages(sender: &Sender<Message>, messages: &[Message]) {
        for msg in messages {
            if let Err(e) = sender.try_send(msg.clone()) {
                log::error!("failed to queue raft message {:?}, raft will retry", e);
            }
        }
    }
}
