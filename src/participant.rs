//! Participant state machine
//!
//! One participant runs per transaction routed to this site by a remote
//! coordinator. It owns the inbound channel the daemon accepted, the RM
//! session bound to the transaction, and a one-slot injection queue through
//! which the daemon hands it a replacement channel after a connection loss:
//!
//! INITIALIZE -> ACTIVE -> PREPARED -> COMMIT | ABORT -> (WAITING) -> FINISHED
//!
//! Once prepared, a participant never aborts on its own; it either hears the
//! decision or blocks in WAITING until the coordinator's redelivery reaches
//! it through the daemon.

use crate::error::Error;
use crate::plog::{ProtocolLog, TransactionRole};
use crate::rm::ResourceManager;
use crate::site::NodeId;
use crate::wire::{Channel, Frame, ResponseCode};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// States of the participant machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Initialize,
    Active,
    Prepared,
    Abort,
    Commit,
    Waiting,
    Finished,
}

/// What to replay on the next channel the daemon injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplayEdge {
    /// A terminal acknowledgement whose send failed.
    Acknowledge,
    /// The uncertain window: ask for the transaction status.
    Status,
}

pub struct Participant {
    tid: Uuid,
    coordinator: NodeId,
    state: ParticipantState,

    channel: Option<Channel>,
    injected: mpsc::Receiver<Channel>,

    rm: Box<dyn ResourceManager>,
    plog: ProtocolLog,
    failure_time: Duration,

    is_prepared: bool,
    txn_open: bool,
    edge: Option<ReplayEdge>,
}

impl Participant {
    pub fn new(
        tid: Uuid,
        coordinator: NodeId,
        channel: Channel,
        injected: mpsc::Receiver<Channel>,
        rm: Box<dyn ResourceManager>,
        plog: ProtocolLog,
        failure_time: Duration,
    ) -> Self {
        Self {
            tid,
            coordinator,
            state: ParticipantState::Initialize,
            channel: Some(channel),
            injected,
            rm,
            plog,
            failure_time,
            is_prepared: false,
            txn_open: false,
            edge: None,
        }
    }

    /// A participant resumed by the daemon's crash recovery: `Prepared` for a
    /// transaction in the RM's prepared list, `Abort` under presumed abort.
    /// The channel points at the recorded coordinator's daemon and may be
    /// absent when that site is unreachable.
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        tid: Uuid,
        coordinator: NodeId,
        state: ParticipantState,
        channel: Option<Channel>,
        injected: mpsc::Receiver<Channel>,
        rm: Box<dyn ResourceManager>,
        plog: ProtocolLog,
        failure_time: Duration,
    ) -> Self {
        Self {
            tid,
            coordinator,
            state,
            channel,
            injected,
            rm,
            plog,
            failure_time,
            is_prepared: state == ParticipantState::Prepared,
            txn_open: false,
            edge: None,
        }
    }

    /// Drive the machine to FINISHED. An error return means the protocol log
    /// failed (or the daemon disappeared); the worker halts rather than
    /// advance without a durable record.
    pub async fn run(mut self) -> crate::Result<()> {
        loop {
            debug!(tid = %self.tid, state = ?self.state, "participant transition");
            match self.state {
                ParticipantState::Initialize => self.initialize().await?,
                ParticipantState::Active => self.active_step().await?,
                ParticipantState::Prepared => self.prepared_step().await,
                ParticipantState::Commit => self.commit_step().await?,
                ParticipantState::Abort => self.abort_step().await?,
                ParticipantState::Waiting => self.waiting_step().await?,
                ParticipantState::Finished => return self.finish(),
            }
        }
    }

    async fn initialize(&mut self) -> crate::Result<()> {
        self.rm.begin().await.map_err(Error::Rm)?;
        self.txn_open = true;
        self.plog
            .log_initialize(self.tid, TransactionRole::Participant)?;
        self.plog.add_coordinator(self.tid, self.coordinator)?;
        info!(tid = %self.tid, coordinator = self.coordinator, "joined transaction");
        self.state = ParticipantState::Active;
        Ok(())
    }

    async fn active_step(&mut self) -> crate::Result<()> {
        let Some(message) = self.recv().await else {
            warn!(tid = %self.tid, "coordinator channel lost before prepare; aborting");
            self.state = ParticipantState::Abort;
            return Ok(());
        };

        match message {
            Frame::InsertFromCoordinator { statement } => match self.rm.execute(&statement).await {
                Ok(()) => {
                    if !self.reply(ResponseCode::Ok).await {
                        self.state = ParticipantState::Abort;
                    }
                }
                Err(e) => {
                    warn!(tid = %self.tid, "insert failed: {e}; aborting");
                    self.reply(ResponseCode::Fail).await;
                    self.state = ParticipantState::Abort;
                }
            },
            Frame::PrepareToCommit => self.handle_prepare().await?,
            Frame::RollbackFromCoordinator { .. } => {
                info!(tid = %self.tid, "coordinator rolled the transaction back");
                self.state = ParticipantState::Abort;
            }
            Frame::NoOp => {}
            other => warn!(?other, "unexpected message in ACTIVE; ignoring"),
        }
        Ok(())
    }

    async fn handle_prepare(&mut self) -> crate::Result<()> {
        match self.rm.prepare(self.tid).await {
            Ok(()) => {
                self.plog.log_prepare(self.tid)?;
                self.is_prepared = true;
                self.txn_open = false;
                info!(tid = %self.tid, "RM prepared; voting to commit");
                if self.reply(ResponseCode::PreparedFromParticipant).await {
                    self.state = ParticipantState::Prepared;
                } else {
                    // The vote was lost but the prepare is durable: the
                    // uncertain window has opened.
                    self.edge = Some(ReplayEdge::Status);
                    self.state = ParticipantState::Waiting;
                }
            }
            Err(e) => {
                warn!(tid = %self.tid, "RM refused prepare: {e}; voting to abort");
                self.reply(ResponseCode::AbortFromParticipant).await;
                self.state = ParticipantState::Abort;
            }
        }
        Ok(())
    }

    async fn prepared_step(&mut self) {
        match self.recv().await {
            Some(Frame::CommitFromCoordinator { .. }) => self.state = ParticipantState::Commit,
            Some(Frame::RollbackFromCoordinator { .. }) => self.state = ParticipantState::Abort,
            Some(Frame::NoOp) => {}
            Some(other) => warn!(?other, "unexpected message in PREPARED; ignoring"),
            None => {
                info!(tid = %self.tid, "coordinator lost inside the uncertain window; waiting");
                self.edge = Some(ReplayEdge::Status);
                self.state = ParticipantState::Waiting;
            }
        }
    }

    async fn commit_step(&mut self) -> crate::Result<()> {
        if let Err(e) = self.rm.commit_prepared(self.tid).await {
            // Do not record the commit until the RM applied it; retry the
            // whole edge once a fresh channel re-delivers the decision.
            tracing::error!(tid = %self.tid, "RM commit failed: {e}");
            self.edge = Some(ReplayEdge::Status);
            self.state = ParticipantState::Waiting;
            return Ok(());
        }
        self.plog.log_commit(self.tid)?;
        info!(tid = %self.tid, "committed");
        self.acknowledge_end().await;
        Ok(())
    }

    async fn abort_step(&mut self) -> crate::Result<()> {
        if self.is_prepared {
            if let Err(e) = self.rm.rollback_prepared(self.tid).await {
                tracing::error!(tid = %self.tid, "RM rollback of prepared transaction failed: {e}");
                self.edge = Some(ReplayEdge::Status);
                self.state = ParticipantState::Waiting;
                return Ok(());
            }
        } else if self.txn_open {
            // Nothing is prepared; roll the session transaction back so the
            // RM releases its locks now rather than at disconnect.
            if let Err(e) = self.rm.rollback().await {
                warn!(tid = %self.tid, "RM rollback: {e}");
            }
            self.txn_open = false;
        }
        self.plog.log_abort(self.tid)?;
        info!(tid = %self.tid, "aborted");
        self.acknowledge_end().await;
        Ok(())
    }

    /// Send the terminal acknowledgement; a failed send parks the machine in
    /// WAITING until the daemon injects a channel to resend it on.
    async fn acknowledge_end(&mut self) {
        if self.reply(ResponseCode::AcknowledgeEnd).await {
            self.state = ParticipantState::Finished;
        } else {
            self.edge = Some(ReplayEdge::Acknowledge);
            self.state = ParticipantState::Waiting;
        }
    }

    /// Close the dead channel and block until the daemon hands over a fresh
    /// one, then replay the recorded edge on it.
    async fn waiting_step(&mut self) -> crate::Result<()> {
        self.channel = None;
        info!(tid = %self.tid, edge = ?self.edge, "waiting for a fresh channel from the daemon");

        let Some(mut channel) = self.injected.recv().await else {
            return Err(Error::Shutdown("injection slot closed by the daemon"));
        };
        channel.set_read_timeout(self.failure_time);

        match self.edge.unwrap_or(ReplayEdge::Status) {
            ReplayEdge::Acknowledge => {
                if channel
                    .send(&Frame::Response(ResponseCode::AcknowledgeEnd))
                    .await
                    .is_ok()
                {
                    self.state = ParticipantState::Finished;
                }
                // On failure, stay in WAITING for the next injection.
            }
            ReplayEdge::Status => {
                let _ = channel.send(&Frame::TransactionStatus { tid: self.tid }).await;
                match channel.recv().await {
                    Some(Frame::CommitFromCoordinator { .. })
                    | Some(Frame::Response(ResponseCode::TransactionCommitted)) => {
                        self.channel = Some(channel);
                        self.state = ParticipantState::Commit;
                    }
                    Some(Frame::RollbackFromCoordinator { .. })
                    | Some(Frame::Response(ResponseCode::TransactionAborted)) => {
                        self.channel = Some(channel);
                        self.state = ParticipantState::Abort;
                    }
                    other => {
                        warn!(tid = %self.tid, ?other, "no usable status; staying in WAITING");
                    }
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> crate::Result<()> {
        self.plog.log_completion(self.tid)?;
        info!(tid = %self.tid, "participant finished");
        Ok(())
    }

    async fn recv(&mut self) -> Option<Frame> {
        match self.channel.as_mut() {
            Some(channel) => channel.recv().await,
            None => None,
        }
    }

    async fn reply(&mut self, code: ResponseCode) -> bool {
        match self.channel.as_mut() {
            Some(channel) => channel.send(&Frame::Response(code)).await.is_ok(),
            None => false,
        }
    }
}
