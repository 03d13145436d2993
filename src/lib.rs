//! dtxn - a distributed transaction manager
//!
//! Each site runs one `manager` daemon that is simultaneously a coordinator
//! for transactions started by its local clients and a participant for
//! transactions routed to it by peer sites. Inserts are hash-partitioned by a
//! caller-supplied key; multi-site transactions are driven to a single
//! outcome with two-phase commit and presumed-abort crash recovery backed by
//! a single-file protocol log and the RM's prepared-transaction store.

pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod participant;
pub mod plog;
pub mod rm;
pub mod site;
pub mod wire;

// Re-export core types
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use plog::{ProtocolLog, TransactionRole};
pub use site::{NodeId, Site, SiteDirectory};
pub use wire::{Channel, Frame, OpCode, ResponseCode};
