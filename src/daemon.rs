//! TM daemon: the per-site accept loop and crash recovery
//!
//! The daemon is the only place an inbound socket's disposition is decided.
//! It accepts a connection, reads exactly one message, and either spawns a
//! state machine bound to that channel, injects the channel into a waiting
//! participant, answers from the protocol log, or acknowledges and closes.
//! On startup it first replays its responsibilities from the protocol log and
//! the RM's prepared-transaction list.

use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::Error;
use crate::participant::{Participant, ParticipantState};
use crate::plog::{ProtocolLog, TransactionRole};
use crate::rm::RmConnector;
use crate::site::{NodeId, SiteDirectory};
use crate::wire::{Channel, Frame, ResponseCode};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// States of the daemon itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Recovery,
    Initialize,
    Active,
    Finished,
}

struct ChildHandle {
    /// The one-slot injection queue; absent for coordinators, which reconnect
    /// on their own.
    inject: Option<mpsc::Sender<Channel>>,
    task: JoinHandle<()>,
}

pub struct Daemon {
    node_id: NodeId,
    port: u16,
    failure_time: Duration,
    plog: ProtocolLog,
    sites: Arc<SiteDirectory>,
    connector: Arc<dyn RmConnector>,

    state: DaemonState,
    listener: Option<TcpListener>,
    children: HashMap<Uuid, ChildHandle>,
}

impl Daemon {
    pub fn new(
        node_id: NodeId,
        port: u16,
        failure_time: Duration,
        plog: ProtocolLog,
        sites: Arc<SiteDirectory>,
        connector: Arc<dyn RmConnector>,
    ) -> Self {
        Self {
            node_id,
            port,
            failure_time,
            plog,
            sites,
            connector,
            state: DaemonState::Recovery,
            listener: None,
            children: HashMap::new(),
        }
    }

    pub async fn run(&mut self) -> crate::Result<()> {
        loop {
            match self.state {
                DaemonState::Recovery => {
                    info!(node = self.node_id, "entering RECOVERY");
                    self.recover().await?;
                    self.state = DaemonState::Initialize;
                }
                DaemonState::Initialize => {
                    let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
                    info!(node = self.node_id, port = self.port, "listening for requests");
                    self.listener = Some(listener);
                    self.state = DaemonState::Active;
                }
                DaemonState::Active => self.active_step().await,
                DaemonState::Finished => break,
            }
        }

        self.listener = None;
        self.drain().await;
        Ok(())
    }

    /// Accept one connection and dispatch on its first message.
    async fn active_step(&mut self) {
        let accepted = {
            let Some(listener) = self.listener.as_ref() else {
                self.state = DaemonState::Finished;
                return;
            };
            listener.accept().await
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                return;
            }
        };
        debug!(%peer, "connection accepted");

        let mut channel = Channel::new(stream);
        channel.set_read_timeout(self.failure_time);
        let Some(message) = channel.recv().await else {
            return;
        };

        match message {
            Frame::NoOp | Frame::Stop => {}
            Frame::Shutdown => {
                info!("shutdown requested; no longer accepting connections");
                self.state = DaemonState::Finished;
            }
            Frame::StartTransaction { .. } => self.spawn_coordinator(channel).await,
            Frame::InitiateParticipant { tid, coordinator } => {
                self.spawn_participant(tid, coordinator, channel).await;
            }
            Frame::CommitFromCoordinator { tid } | Frame::RollbackFromCoordinator { tid } => {
                self.route_decision(tid, channel);
            }
            Frame::TransactionStatus { tid } => self.answer_status(tid, channel),
            other => warn!(?other, "unsupported operation at dispatch; ignoring"),
        }
    }

    /// A transaction originating here: spawn a coordinator owning the client
    /// channel.
    async fn spawn_coordinator(&mut self, channel: Channel) {
        let rm = match self.connector.connect().await {
            Ok(rm) => rm,
            Err(e) => {
                // Dropping the channel reads as an abort on the client side.
                error!("cannot reach the resource manager: {e}");
                return;
            }
        };

        let coordinator = Coordinator::new(
            self.node_id,
            channel,
            rm,
            self.plog.clone(),
            self.sites.clone(),
            self.failure_time,
        );
        let tid = coordinator.tid();
        info!(%tid, "spawning coordinator");

        let task = tokio::spawn(async move {
            if let Err(e) = coordinator.run().await {
                error!(%tid, "coordinator worker halted: {e}");
            }
        });
        self.children.insert(tid, ChildHandle { inject: None, task });
    }

    /// A transaction routed here by a remote coordinator: spawn a participant
    /// bound to the inbound channel.
    async fn spawn_participant(&mut self, tid: Uuid, coordinator: NodeId, channel: Channel) {
        if self.children.contains_key(&tid) {
            warn!(%tid, "duplicate INITIATE_PARTICIPANT; dropping connection");
            return;
        }
        let rm = match self.connector.connect().await {
            Ok(rm) => rm,
            Err(e) => {
                error!("cannot reach the resource manager: {e}");
                return;
            }
        };

        info!(%tid, coordinator, "spawning participant");
        let (inject, slot) = mpsc::channel(1);
        let participant = Participant::new(
            tid,
            coordinator,
            channel,
            slot,
            rm,
            self.plog.clone(),
            self.failure_time,
        );
        let task = tokio::spawn(async move {
            if let Err(e) = participant.run().await {
                error!(%tid, "participant worker halted: {e}");
            }
        });
        self.children.insert(
            tid,
            ChildHandle {
                inject: Some(inject),
                task,
            },
        );
    }

    /// A decision arrived for `tid`. If a participant is waiting here, hand
    /// it the channel. Otherwise the transaction is unknown or finished:
    /// presumed abort (and commit, for an ack-loss resend) makes an immediate
    /// acknowledgement correct.
    fn route_decision(&mut self, tid: Uuid, channel: Channel) {
        let Some(inject) = self
            .children
            .get(&tid)
            .and_then(|child| child.inject.clone())
        else {
            debug!(%tid, "decision for an unknown transaction; acknowledging");
            acknowledge_and_close(channel);
            return;
        };

        match inject.try_send(channel) {
            Ok(()) => debug!(%tid, "channel injected into waiting participant"),
            Err(mpsc::error::TrySendError::Full(channel)) => {
                warn!(%tid, "injection slot already holds a channel; dropping this one");
                drop(channel);
            }
            Err(mpsc::error::TrySendError::Closed(channel)) => {
                // The machine finished after its registry entry was created.
                debug!(%tid, "participant already finished; acknowledging");
                self.children.remove(&tid);
                acknowledge_and_close(channel);
            }
        }
    }

    /// Answer a status request from the durable record. A participant's `P`
    /// with no decision is its YES vote; a coordinator's undecided window
    /// gets no answer (its resumed machine will decide and multicast).
    fn answer_status(&mut self, tid: Uuid, channel: Channel) {
        let (history, role) = match (self.plog.states_of(tid), self.plog.get_role(tid)) {
            (Ok(history), Ok(role)) => (history, role),
            (Err(e), _) | (_, Err(e)) => {
                warn!(%tid, "cannot answer status request: {e}");
                return;
            }
        };

        let reply = if history.contains('C') {
            Some(ResponseCode::TransactionCommitted)
        } else if history.contains('A') || !history.contains('P') {
            // Unknown or never prepared: presumed abort.
            Some(ResponseCode::TransactionAborted)
        } else if role == Some(TransactionRole::Participant) {
            Some(ResponseCode::PreparedFromParticipant)
        } else {
            None
        };

        debug!(%tid, history, ?reply, "status request");
        match reply {
            Some(code) => respond_and_close(channel, code),
            None => drop(channel),
        }
    }

    /// Reattach the transactions a crash left behind. The protocol log drives
    /// presumed abort; the RM's own prepared list is the authoritative source
    /// for the in-doubt set.
    async fn recover(&mut self) -> crate::Result<()> {
        for tid in self.plog.get_abortable_transactions()? {
            info!(%tid, "recovering transaction under presumed abort");
            match self.plog.get_role(tid)? {
                Some(TransactionRole::Coordinator) => {
                    let active = self.connect_participants(tid).await?;
                    self.resume_coordinator(tid, CoordinatorState::Abort, false, false, active)
                        .await;
                }
                Some(TransactionRole::Participant) => {
                    self.resume_participant(tid, ParticipantState::Abort).await?;
                }
                None => warn!(%tid, "state records without a role row; skipping"),
            }
        }

        let mut rm = self.connector.connect().await.map_err(Error::Rm)?;
        for tid in rm.prepared_transactions().await.map_err(Error::Rm)? {
            if self.children.contains_key(&tid) {
                continue;
            }
            info!(%tid, "recovering in-doubt transaction from the RM's prepared list");
            match self.plog.get_role(tid)? {
                Some(TransactionRole::Coordinator) => {
                    let history = self.plog.states_of(tid)?;
                    let (state, decision_logged) = if history.contains('C') {
                        (CoordinatorState::Commit, true)
                    } else if history.contains('A') {
                        (CoordinatorState::Abort, true)
                    } else {
                        (CoordinatorState::Polling, false)
                    };
                    let active = self.connect_participants(tid).await?;
                    self.resume_coordinator(tid, state, decision_logged, true, active)
                        .await;
                }
                Some(TransactionRole::Participant) => {
                    self.resume_participant(tid, ParticipantState::Prepared).await?;
                }
                None => {
                    // The RM prepared it but the crash beat the log record;
                    // the vote was never sent, so presumed abort applies.
                    warn!(%tid, "prepared transaction unknown to the protocol log; rolling back");
                    if let Err(e) = rm.rollback_prepared(tid).await {
                        error!(%tid, "rollback of orphaned prepared transaction failed: {e}");
                    }
                }
            }
        }

        Ok(())
    }

    async fn resume_coordinator(
        &mut self,
        tid: Uuid,
        state: CoordinatorState,
        decision_logged: bool,
        prepared_locally: bool,
        active: HashMap<NodeId, Option<Channel>>,
    ) {
        let rm = match self.connector.connect().await {
            Ok(rm) => rm,
            Err(e) => {
                error!(%tid, "cannot reach the resource manager; leaving for the next start: {e}");
                return;
            }
        };

        let coordinator = Coordinator::resume(
            tid,
            state,
            decision_logged,
            prepared_locally,
            active,
            self.node_id,
            rm,
            self.plog.clone(),
            self.sites.clone(),
            self.failure_time,
        );
        let task = tokio::spawn(async move {
            if let Err(e) = coordinator.run().await {
                error!(%tid, "coordinator worker halted: {e}");
            }
        });
        self.children.insert(tid, ChildHandle { inject: None, task });
    }

    async fn resume_participant(
        &mut self,
        tid: Uuid,
        state: ParticipantState,
    ) -> crate::Result<()> {
        let Some(coordinator) = self.plog.get_coordinator(tid)? else {
            warn!(%tid, "participant record without a coordinator site; skipping");
            return Ok(());
        };

        let channel = match self.sites.site(coordinator) {
            Some(site) => {
                let (hostname, port) = (site.hostname.clone(), site.port);
                match Channel::connect(&hostname, port).await {
                    Ok(mut channel) => {
                        channel.set_read_timeout(self.failure_time);
                        Some(channel)
                    }
                    Err(e) => {
                        warn!(%tid, coordinator, "coordinator site unreachable: {e}");
                        None
                    }
                }
            }
            None => {
                warn!(%tid, coordinator, "coordinator site outside the site list");
                None
            }
        };

        let rm = match self.connector.connect().await {
            Ok(rm) => rm,
            Err(e) => {
                error!(%tid, "cannot reach the resource manager; leaving for the next start: {e}");
                return Ok(());
            }
        };

        let (inject, slot) = mpsc::channel(1);
        let participant = Participant::resume(
            tid,
            coordinator,
            state,
            channel,
            slot,
            rm,
            self.plog.clone(),
            self.failure_time,
        );
        let task = tokio::spawn(async move {
            if let Err(e) = participant.run().await {
                error!(%tid, "participant worker halted: {e}");
            }
        });
        self.children.insert(
            tid,
            ChildHandle {
                inject: Some(inject),
                task,
            },
        );
        Ok(())
    }

    /// Channels to every participant a recovered coordinator once attached.
    /// Unreachable sites become empty entries the WAITING loop retries.
    async fn connect_participants(
        &self,
        tid: Uuid,
    ) -> crate::Result<HashMap<NodeId, Option<Channel>>> {
        let mut active = HashMap::new();
        for node in self.plog.get_participants(tid)? {
            let entry = match self.sites.site(node) {
                Some(site) => {
                    let (hostname, port) = (site.hostname.clone(), site.port);
                    match Channel::connect(&hostname, port).await {
                        Ok(mut channel) => {
                            channel.set_read_timeout(self.failure_time);
                            Some(channel)
                        }
                        Err(e) => {
                            warn!(%tid, node, "participant site unreachable: {e}");
                            None
                        }
                    }
                }
                None => None,
            };
            active.insert(node, entry);
        }
        Ok(active)
    }

    /// Let running transactions finish; they are never aborted from here. A
    /// participant still blocked on its coordinator keeps this from
    /// returning, which is the blocking guarantee at work.
    async fn drain(&mut self) {
        if !self.children.is_empty() {
            info!(workers = self.children.len(), "waiting for transaction workers");
        }
        for (tid, child) in self.children.drain() {
            if let Err(e) = child.task.await {
                warn!(%tid, "transaction worker panicked: {e}");
            }
        }
        info!("daemon finished");
    }
}

/// Acknowledge on a detached task so the dispatch loop never blocks on a
/// peer's read side.
fn acknowledge_and_close(channel: Channel) {
    respond_and_close(channel, ResponseCode::AcknowledgeEnd);
}

fn respond_and_close(mut channel: Channel, code: ResponseCode) {
    tokio::spawn(async move {
        let _ = channel.send(&Frame::Response(code)).await;
        // Give the peer a moment to read before the socket drops.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });
}
