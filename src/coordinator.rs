//! Coordinator state machine
//!
//! One coordinator runs per transaction that originates at this site. It owns
//! the client channel handed over by the daemon, the RM session bound to the
//! transaction, and a channel per remote participant. The machine is:
//!
//! INITIALIZE -> ACTIVE -> POLLING -> COMMIT | ABORT -> (WAITING) -> FINISHED
//!
//! A single-site transaction skips POLLING. Once the decision record is
//! durable the outcome is fixed; WAITING then redelivers it until every
//! participant has acknowledged, reconnecting through the peer daemons as
//! needed.

use crate::error::Error;
use crate::plog::{ProtocolLog, TransactionRole};
use crate::rm::ResourceManager;
use crate::site::{NodeId, SiteDirectory};
use crate::wire::{Channel, Frame, ResponseCode};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// States of the coordinator machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Initialize,
    Active,
    Polling,
    Abort,
    Commit,
    Waiting,
    Finished,
}

/// The fixed transaction outcome once its record is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Commit,
    Abort,
}

/// Participants are polled in parallel, bounded by this worker count.
pub const POLL_POOL_SIZE: usize = 4;

pub struct Coordinator {
    tid: Uuid,
    node_id: NodeId,
    state: CoordinatorState,
    decision: Option<Decision>,
    decision_logged: bool,

    /// Absent for machines resumed by crash recovery.
    client: Option<Channel>,

    /// Participant node -> channel. `None` marks a peer whose connection is
    /// currently down; WAITING keeps retrying those until they acknowledge.
    active: HashMap<NodeId, Option<Channel>>,

    rm: Box<dyn ResourceManager>,
    plog: ProtocolLog,
    sites: Arc<SiteDirectory>,
    failure_time: Duration,

    prepared_locally: bool,
    txn_open: bool,
    recovered: bool,
}

impl Coordinator {
    /// A coordinator for a client-originated transaction.
    pub fn new(
        node_id: NodeId,
        client: Channel,
        rm: Box<dyn ResourceManager>,
        plog: ProtocolLog,
        sites: Arc<SiteDirectory>,
        failure_time: Duration,
    ) -> Self {
        Self {
            tid: Uuid::new_v4(),
            node_id,
            state: CoordinatorState::Initialize,
            decision: None,
            decision_logged: false,
            client: Some(client),
            active: HashMap::new(),
            rm,
            plog,
            sites,
            failure_time,
            prepared_locally: false,
            txn_open: false,
            recovered: false,
        }
    }

    /// A coordinator resumed by the daemon's crash recovery. `state` is
    /// `Polling` inside the uncertain window, or `Commit`/`Abort` when the
    /// decision is already in the log and only delivery remains
    /// (`decision_logged` suppresses a duplicate decision record).
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        tid: Uuid,
        state: CoordinatorState,
        decision_logged: bool,
        prepared_locally: bool,
        active: HashMap<NodeId, Option<Channel>>,
        node_id: NodeId,
        rm: Box<dyn ResourceManager>,
        plog: ProtocolLog,
        sites: Arc<SiteDirectory>,
        failure_time: Duration,
    ) -> Self {
        let decision = match state {
            CoordinatorState::Commit => Some(Decision::Commit),
            CoordinatorState::Abort => Some(Decision::Abort),
            _ => None,
        };
        Self {
            tid,
            node_id,
            state,
            decision,
            decision_logged,
            client: None,
            active,
            rm,
            plog,
            sites,
            failure_time,
            prepared_locally,
            txn_open: false,
            recovered: true,
        }
    }

    pub fn tid(&self) -> Uuid {
        self.tid
    }

    /// Drive the machine to FINISHED. An error return means the protocol log
    /// (or the RM, before anything was logged) failed; the worker halts
    /// rather than advance without a durable record.
    pub async fn run(mut self) -> crate::Result<()> {
        loop {
            debug!(tid = %self.tid, state = ?self.state, "coordinator transition");
            match self.state {
                CoordinatorState::Initialize => self.initialize().await?,
                CoordinatorState::Active => self.active_step().await?,
                CoordinatorState::Polling => self.poll().await,
                CoordinatorState::Commit => self.decide(Decision::Commit).await?,
                CoordinatorState::Abort => self.decide(Decision::Abort).await?,
                CoordinatorState::Waiting => self.waiting().await,
                CoordinatorState::Finished => return self.finish().await,
            }
        }
    }

    async fn initialize(&mut self) -> crate::Result<()> {
        self.rm.begin().await.map_err(Error::Rm)?;
        self.txn_open = true;
        self.plog
            .log_initialize(self.tid, TransactionRole::Coordinator)?;
        info!(tid = %self.tid, "transaction started");

        if let Some(client) = self.client.as_mut() {
            if client
                .send(&Frame::StartTransaction {
                    tid: Some(self.tid),
                })
                .await
                .is_err()
            {
                warn!(tid = %self.tid, "client vanished before the transaction id was issued");
                self.state = CoordinatorState::Abort;
                return Ok(());
            }
        }
        self.state = CoordinatorState::Active;
        Ok(())
    }

    async fn active_step(&mut self) -> crate::Result<()> {
        let message = match self.client.as_mut() {
            Some(client) => client.recv().await,
            None => None,
        };
        let Some(message) = message else {
            warn!(tid = %self.tid, "client channel lost; aborting");
            self.state = CoordinatorState::Abort;
            return Ok(());
        };

        match message {
            Frame::InsertFromClient {
                tid,
                statement,
                key,
            } => {
                if tid != self.tid {
                    warn!(expected = %self.tid, got = %tid, "insert for a different transaction");
                    self.reply_client(ResponseCode::Fail).await;
                } else {
                    self.handle_insert(&statement, &key).await?;
                }
            }
            Frame::AbortTransaction { .. } => {
                info!(tid = %self.tid, "client requested abort");
                self.state = CoordinatorState::Abort;
            }
            Frame::CommitTransaction { .. } => self.handle_commit_request().await?,
            Frame::NoOp => {}
            other => warn!(?other, "unexpected message in ACTIVE; ignoring"),
        }
        Ok(())
    }

    async fn handle_insert(&mut self, statement: &str, key: &str) -> crate::Result<()> {
        let endpoint = self.sites.route(key);
        debug!(tid = %self.tid, key, endpoint, "routed insert");

        if endpoint == self.node_id {
            match self.rm.execute(statement).await {
                Ok(()) => self.reply_client(ResponseCode::Ok).await,
                Err(e) => {
                    warn!(tid = %self.tid, "local insert failed: {e}; aborting");
                    self.reply_client(ResponseCode::Fail).await;
                    self.state = CoordinatorState::Abort;
                }
            }
        } else {
            let accepted = self.remote_insert(endpoint, statement).await?;
            if accepted {
                self.reply_client(ResponseCode::Ok).await;
            } else {
                // The participant aborts unilaterally on a failed insert, so
                // the whole transaction is already lost.
                self.reply_client(ResponseCode::Fail).await;
                self.state = CoordinatorState::Abort;
            }
        }
        Ok(())
    }

    /// Run one insert on a remote participant, attaching the participant to
    /// the transaction first if this is its first statement.
    async fn remote_insert(&mut self, endpoint: NodeId, statement: &str) -> crate::Result<bool> {
        if !self.active.contains_key(&endpoint) {
            let Some(site) = self.sites.site(endpoint) else {
                warn!(endpoint, "statement routed to a node outside the site list");
                return Ok(false);
            };
            let (hostname, port) = (site.hostname.clone(), site.port);

            let mut channel = match Channel::connect(&hostname, port).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(endpoint, "unable to attach participant: {e}");
                    return Ok(false);
                }
            };
            channel.set_read_timeout(self.failure_time);

            self.plog.add_participant(self.tid, endpoint)?;
            if channel
                .send(&Frame::InitiateParticipant {
                    tid: self.tid,
                    coordinator: self.node_id,
                })
                .await
                .is_err()
            {
                warn!(endpoint, "participant handshake failed");
                return Ok(false);
            }
            info!(tid = %self.tid, endpoint, "participant attached");
            self.active.insert(endpoint, Some(channel));
        }

        let Some(Some(channel)) = self.active.get_mut(&endpoint) else {
            return Ok(false);
        };
        if channel
            .send(&Frame::InsertFromCoordinator {
                statement: statement.to_string(),
            })
            .await
            .is_err()
        {
            return Ok(false);
        }
        Ok(matches!(
            channel.recv().await,
            Some(Frame::Response(ResponseCode::Ok))
        ))
    }

    async fn handle_commit_request(&mut self) -> crate::Result<()> {
        match self.rm.prepare(self.tid).await {
            Ok(()) => {
                self.plog.log_prepare(self.tid)?;
                self.prepared_locally = true;
                self.txn_open = false;
                if self.active.is_empty() {
                    info!(tid = %self.tid, "RM prepared and no remote participants; committing");
                    self.state = CoordinatorState::Commit;
                } else {
                    info!(tid = %self.tid, "RM prepared; polling participants");
                    self.state = CoordinatorState::Polling;
                }
            }
            Err(e) => {
                warn!(tid = %self.tid, "RM refused prepare: {e}; aborting");
                if let Err(e) = self.rm.rollback().await {
                    warn!(tid = %self.tid, "rollback after failed prepare: {e}");
                }
                self.txn_open = false;
                self.state = CoordinatorState::Abort;
            }
        }
        Ok(())
    }

    /// Collect a vote from every participant; any NO, loss, or timeout forces
    /// abort. A machine resumed into POLLING has no live channel into the
    /// remote state machines, so it asks each peer daemon for the durable
    /// vote instead (`P` with no decision in the peer's log is a YES).
    async fn poll(&mut self) {
        let tid = self.tid;
        let recovered = self.recovered;
        let peers: Vec<(NodeId, Option<Channel>)> = self.active.drain().collect();

        let votes: Vec<(NodeId, Option<Channel>, bool)> =
            stream::iter(peers.into_iter().map(|(node, channel)| async move {
                let Some(mut channel) = channel else {
                    return (node, None, false);
                };
                let poll_frame = if recovered {
                    Frame::TransactionStatus { tid }
                } else {
                    Frame::PrepareToCommit
                };
                if channel.send(&poll_frame).await.is_err() {
                    return (node, None, false);
                }
                let yes = matches!(
                    channel.recv().await,
                    Some(Frame::Response(ResponseCode::PreparedFromParticipant))
                );
                // A status poll is a one-shot conversation with the peer
                // daemon; the decision travels on a fresh channel later.
                let channel = if recovered { None } else { Some(channel) };
                (node, channel, yes)
            }))
            .buffer_unordered(POLL_POOL_SIZE)
            .collect()
            .await;

        let mut all_yes = true;
        for (node, channel, yes) in votes {
            debug!(tid = %self.tid, node, yes, "vote collected");
            all_yes &= yes;
            self.active.insert(node, channel);
        }

        if all_yes {
            info!(tid = %self.tid, "all participants voted to commit");
            self.state = CoordinatorState::Commit;
        } else {
            info!(tid = %self.tid, "at least one participant is lost or voted to abort");
            self.state = CoordinatorState::Abort;
        }
    }

    /// Fix the outcome, apply it to the local RM, and multicast it. The log
    /// record precedes the RM commit and every message: it is the point of no
    /// return.
    async fn decide(&mut self, decision: Decision) -> crate::Result<()> {
        self.decision = Some(decision);
        match decision {
            Decision::Commit => {
                if !self.decision_logged {
                    self.plog.log_commit(self.tid)?;
                    self.decision_logged = true;
                }
                if let Err(e) = self.rm.commit_prepared(self.tid).await {
                    // The decision is durable; the prepared transaction will
                    // be committed by recovery on the next start.
                    tracing::error!(tid = %self.tid, "RM commit failed: {e}");
                }
            }
            Decision::Abort => {
                if !self.decision_logged {
                    self.plog.log_abort(self.tid)?;
                    self.decision_logged = true;
                }
                if self.prepared_locally {
                    if let Err(e) = self.rm.rollback_prepared(self.tid).await {
                        warn!(tid = %self.tid, "RM rollback of prepared transaction: {e}");
                    }
                } else if self.txn_open {
                    if let Err(e) = self.rm.rollback().await {
                        warn!(tid = %self.tid, "RM rollback: {e}");
                    }
                    self.txn_open = false;
                }
            }
        }

        self.multicast_decision().await;
        self.state = if self.active.is_empty() {
            CoordinatorState::Finished
        } else {
            CoordinatorState::Waiting
        };
        Ok(())
    }

    /// Send the decision to every unacknowledged participant and drop the
    /// ones that acknowledge.
    async fn multicast_decision(&mut self) {
        let frame = match self.decision {
            Some(Decision::Commit) => Frame::CommitFromCoordinator { tid: self.tid },
            _ => Frame::RollbackFromCoordinator { tid: self.tid },
        };

        let mut acknowledged = Vec::new();
        for (node, channel) in self.active.iter_mut() {
            let Some(channel) = channel else { continue };
            debug!(tid = %self.tid, node, ?frame, "sending decision");
            if channel.send(&frame).await.is_err() {
                warn!(tid = %self.tid, node, "decision send failed; will retry");
                continue;
            }
            if Self::await_acknowledgement(channel, &frame).await {
                debug!(tid = %self.tid, node, "participant acknowledged");
                acknowledged.push(*node);
            }
        }
        for node in acknowledged {
            self.active.remove(&node);
        }
    }

    /// Read until the participant acknowledges or the channel dies. A
    /// participant replaying its uncertain window asks for the transaction
    /// status first; answer it by re-sending the decision.
    async fn await_acknowledgement(channel: &mut Channel, decision: &Frame) -> bool {
        loop {
            match channel.recv().await {
                None => return false,
                Some(Frame::Response(ResponseCode::AcknowledgeEnd)) => return true,
                Some(Frame::TransactionStatus { .. }) => {
                    if channel.send(decision).await.is_err() {
                        return false;
                    }
                }
                Some(other) => debug!(?other, "ignoring while awaiting acknowledgement"),
            }
        }
    }

    /// Redeliver the decision every `failure_time` until the active map
    /// drains. This loop is the delivery guarantee participants rely on once
    /// they are prepared.
    async fn waiting(&mut self) {
        while !self.active.is_empty() {
            info!(
                tid = %self.tid,
                remaining = self.active.len(),
                "redelivering decision to unacknowledged participants"
            );

            let nodes: Vec<NodeId> = self.active.keys().copied().collect();
            for node in nodes {
                let Some(site) = self.sites.site(node) else { continue };
                let (hostname, port) = (site.hostname.clone(), site.port);
                let fresh = match Channel::connect(&hostname, port).await {
                    Ok(mut channel) => {
                        channel.set_read_timeout(self.failure_time);
                        Some(channel)
                    }
                    Err(e) => {
                        warn!(tid = %self.tid, node, "participant site unreachable: {e}");
                        None
                    }
                };
                self.active.insert(node, fresh);
            }

            self.multicast_decision().await;
            if !self.active.is_empty() {
                sleep(self.failure_time).await;
            }
        }
        self.state = CoordinatorState::Finished;
    }

    async fn finish(&mut self) -> crate::Result<()> {
        self.plog.log_completion(self.tid)?;

        let outcome = match self.decision {
            Some(Decision::Commit) => ResponseCode::TransactionCommitted,
            _ => ResponseCode::TransactionAborted,
        };
        if let Some(client) = self.client.as_mut() {
            if client.send(&Frame::Response(outcome)).await.is_ok() {
                // Give the client a moment to drain before the socket drops.
                sleep(Duration::from_secs(1)).await;
            }
        }
        info!(tid = %self.tid, ?outcome, "transaction finished");
        Ok(())
    }

    async fn reply_client(&mut self, code: ResponseCode) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        if client.send(&Frame::Response(code)).await.is_err() {
            warn!(tid = %self.tid, "client channel lost while replying; aborting");
            self.state = CoordinatorState::Abort;
        }
    }
}
