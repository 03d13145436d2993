//! Framed message channel between transaction-manager endpoints
//!
//! Every frame on the wire is `[8-byte big-endian length][kind][code][payload]`
//! where kind 0 is an operation, kind 1 is a response, code is the pinned
//! numeric opcode or response code, and the payload is the bincode encoding of
//! the variant's arguments. The numeric codes must never change: every site in
//! a cluster decodes frames produced by every other site.

use crate::error::WireError;
use crate::site::NodeId;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Fixed size of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 8;

/// Default per-read timeout. Overridden from `failure_time` in configuration.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames larger than this are rejected before any allocation happens.
const MAX_FRAME_BYTES: u64 = 1 << 20;

const KIND_OPERATION: u8 = 0;
const KIND_RESPONSE: u8 = 1;

/// Operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum OpCode {
    Stop = -1,
    NoOp = 0,

    // Between a client and its coordinator.
    StartTransaction = 1,
    AbortTransaction = 2,
    CommitTransaction = 3,
    InsertFromClient = 4,
    Shutdown = 5,

    // Between a coordinator and a participant.
    InitiateParticipant = 6,
    InsertFromCoordinator = 7,
    PrepareToCommit = 8,
    CommitFromCoordinator = 9,
    RollbackFromCoordinator = 10,

    // Recovery traffic after a TM failure.
    TransactionStatus = 11,
}

impl TryFrom<i8> for OpCode {
    type Error = WireError;

    fn try_from(value: i8) -> Result<Self, WireError> {
        match value {
            -1 => Ok(OpCode::Stop),
            0 => Ok(OpCode::NoOp),
            1 => Ok(OpCode::StartTransaction),
            2 => Ok(OpCode::AbortTransaction),
            3 => Ok(OpCode::CommitTransaction),
            4 => Ok(OpCode::InsertFromClient),
            5 => Ok(OpCode::Shutdown),
            6 => Ok(OpCode::InitiateParticipant),
            7 => Ok(OpCode::InsertFromCoordinator),
            8 => Ok(OpCode::PrepareToCommit),
            9 => Ok(OpCode::CommitFromCoordinator),
            10 => Ok(OpCode::RollbackFromCoordinator),
            11 => Ok(OpCode::TransactionStatus),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }
}

/// Response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ResponseCode {
    Ok = 0,
    Fail = 1,

    // Two-phase commit codes, only between a coordinator and a participant.
    PreparedFromParticipant = 2,
    AbortFromParticipant = 3,
    AcknowledgeEnd = 4,

    // Final transaction outcome, surfaced to clients and status requests.
    TransactionCommitted = 5,
    TransactionAborted = 6,
}

impl TryFrom<i8> for ResponseCode {
    type Error = WireError;

    fn try_from(value: i8) -> Result<Self, WireError> {
        match value {
            0 => Ok(ResponseCode::Ok),
            1 => Ok(ResponseCode::Fail),
            2 => Ok(ResponseCode::PreparedFromParticipant),
            3 => Ok(ResponseCode::AbortFromParticipant),
            4 => Ok(ResponseCode::AcknowledgeEnd),
            5 => Ok(ResponseCode::TransactionCommitted),
            6 => Ok(ResponseCode::TransactionAborted),
            other => Err(WireError::UnknownResponseCode(other)),
        }
    }
}

/// A decoded frame.
///
/// `StartTransaction` carries no id when a client requests a transaction; the
/// coordinator's reply carries the id it issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stop,
    NoOp,
    Shutdown,
    StartTransaction { tid: Option<Uuid> },
    AbortTransaction { tid: Uuid },
    CommitTransaction { tid: Uuid },
    InsertFromClient { tid: Uuid, statement: String, key: String },
    InitiateParticipant { tid: Uuid, coordinator: NodeId },
    InsertFromCoordinator { statement: String },
    PrepareToCommit,
    CommitFromCoordinator { tid: Uuid },
    RollbackFromCoordinator { tid: Uuid },
    TransactionStatus { tid: Uuid },
    Response(ResponseCode),
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::with_capacity(64);
        match self {
            Frame::Stop => buf.extend([KIND_OPERATION, OpCode::Stop as u8]),
            Frame::NoOp => buf.extend([KIND_OPERATION, OpCode::NoOp as u8]),
            Frame::Shutdown => buf.extend([KIND_OPERATION, OpCode::Shutdown as u8]),
            Frame::PrepareToCommit => buf.extend([KIND_OPERATION, OpCode::PrepareToCommit as u8]),
            Frame::StartTransaction { tid } => {
                buf.extend([KIND_OPERATION, OpCode::StartTransaction as u8]);
                bincode::serialize_into(&mut buf, &tid.map(|t| t.to_string()))?;
            }
            Frame::AbortTransaction { tid } => {
                buf.extend([KIND_OPERATION, OpCode::AbortTransaction as u8]);
                bincode::serialize_into(&mut buf, &tid.to_string())?;
            }
            Frame::CommitTransaction { tid } => {
                buf.extend([KIND_OPERATION, OpCode::CommitTransaction as u8]);
                bincode::serialize_into(&mut buf, &tid.to_string())?;
            }
            Frame::InsertFromClient { tid, statement, key } => {
                buf.extend([KIND_OPERATION, OpCode::InsertFromClient as u8]);
                bincode::serialize_into(&mut buf, &(tid.to_string(), statement, key))?;
            }
            Frame::InitiateParticipant { tid, coordinator } => {
                buf.extend([KIND_OPERATION, OpCode::InitiateParticipant as u8]);
                bincode::serialize_into(&mut buf, &(tid.to_string(), coordinator))?;
            }
            Frame::InsertFromCoordinator { statement } => {
                buf.extend([KIND_OPERATION, OpCode::InsertFromCoordinator as u8]);
                bincode::serialize_into(&mut buf, statement)?;
            }
            Frame::CommitFromCoordinator { tid } => {
                buf.extend([KIND_OPERATION, OpCode::CommitFromCoordinator as u8]);
                bincode::serialize_into(&mut buf, &tid.to_string())?;
            }
            Frame::RollbackFromCoordinator { tid } => {
                buf.extend([KIND_OPERATION, OpCode::RollbackFromCoordinator as u8]);
                bincode::serialize_into(&mut buf, &tid.to_string())?;
            }
            Frame::TransactionStatus { tid } => {
                buf.extend([KIND_OPERATION, OpCode::TransactionStatus as u8]);
                bincode::serialize_into(&mut buf, &tid.to_string())?;
            }
            Frame::Response(code) => buf.extend([KIND_RESPONSE, *code as u8]),
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, WireError> {
        let (kind, rest) = bytes
            .split_first()
            .ok_or(WireError::FrameLength(bytes.len() as u64))?;
        let (code, payload) = rest
            .split_first()
            .ok_or(WireError::FrameLength(bytes.len() as u64))?;

        if *kind == KIND_RESPONSE {
            return Ok(Frame::Response(ResponseCode::try_from(*code as i8)?));
        }

        let frame = match OpCode::try_from(*code as i8)? {
            OpCode::Stop => Frame::Stop,
            OpCode::NoOp => Frame::NoOp,
            OpCode::Shutdown => Frame::Shutdown,
            OpCode::PrepareToCommit => Frame::PrepareToCommit,
            OpCode::StartTransaction => {
                let tid: Option<String> = bincode::deserialize(payload)?;
                Frame::StartTransaction {
                    tid: tid.map(|t| t.parse()).transpose()?,
                }
            }
            OpCode::AbortTransaction => Frame::AbortTransaction {
                tid: decode_tid(payload)?,
            },
            OpCode::CommitTransaction => Frame::CommitTransaction {
                tid: decode_tid(payload)?,
            },
            OpCode::InsertFromClient => {
                let (tid, statement, key): (String, String, String) =
                    bincode::deserialize(payload)?;
                Frame::InsertFromClient {
                    tid: tid.parse()?,
                    statement,
                    key,
                }
            }
            OpCode::InsertFromCoordinator => Frame::InsertFromCoordinator {
                statement: bincode::deserialize(payload)?,
            },
            OpCode::InitiateParticipant => {
                let (tid, coordinator): (String, NodeId) = bincode::deserialize(payload)?;
                Frame::InitiateParticipant {
                    tid: tid.parse()?,
                    coordinator,
                }
            }
            OpCode::CommitFromCoordinator => Frame::CommitFromCoordinator {
                tid: decode_tid(payload)?,
            },
            OpCode::RollbackFromCoordinator => Frame::RollbackFromCoordinator {
                tid: decode_tid(payload)?,
            },
            OpCode::TransactionStatus => Frame::TransactionStatus {
                tid: decode_tid(payload)?,
            },
        };
        Ok(frame)
    }
}

fn decode_tid(payload: &[u8]) -> Result<Uuid, WireError> {
    let tid: String = bincode::deserialize(payload)?;
    Ok(tid.parse()?)
}

/// A framed, length-prefixed message stream over one TCP connection.
///
/// Any read failure (timeout, EOF mid-frame, I/O error, malformed frame)
/// returns `None`, shuts the socket down, and poisons the channel; later sends
/// fail fast. Sends issue the length prefix and payload as one logical write.
#[derive(Debug)]
pub struct Channel {
    stream: TcpStream,
    read_timeout: Duration,
    poisoned: bool,
}

impl Channel {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read_timeout: DEFAULT_READ_TIMEOUT,
            poisoned: false,
        }
    }

    pub async fn connect(hostname: &str, port: u16) -> std::io::Result<Self> {
        let stream = TcpStream::connect((hostname, port)).await?;
        Ok(Self::new(stream))
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), WireError> {
        if self.poisoned {
            return Err(WireError::Poisoned);
        }

        let payload = frame.encode()?;
        let mut wire = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
        wire.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        wire.extend_from_slice(&payload);

        debug!(len = payload.len(), "sending frame");
        match self.stream.write_all(&wire).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.poison().await;
                Err(WireError::Io(e))
            }
        }
    }

    /// Read one frame, honoring the per-channel read timeout.
    pub async fn recv(&mut self) -> Option<Frame> {
        if self.poisoned {
            return None;
        }

        match tokio::time::timeout(self.read_timeout, self.read_frame()).await {
            Ok(Ok(frame)) => {
                debug!(?frame, "received frame");
                Some(frame)
            }
            Ok(Err(e)) => {
                warn!("read failed, closing channel: {e}");
                self.poison().await;
                None
            }
            Err(_) => {
                warn!(timeout = ?self.read_timeout, "read timed out, closing channel");
                self.poison().await;
                None
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, WireError> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        self.stream.read_exact(&mut prefix).await?;

        let length = u64::from_be_bytes(prefix);
        if length == 0 || length > MAX_FRAME_BYTES {
            return Err(WireError::FrameLength(length));
        }

        let mut payload = vec![0u8; length as usize];
        self.stream.read_exact(&mut payload).await?;
        Frame::decode(&payload)
    }

    async fn poison(&mut self) {
        self.poisoned = true;
        let _ = self.stream.shutdown().await;
    }
}
