//! Data Transfer Unit model.
//!
//! A DTU sits next to the core of a tile and gives software a
//! memory-mapped command interface for message passing and remote memory
//! access over the NoC.
//!
//! # Structure
//!
//! ```text
//!               CPU register writes
//!                       │
//!                       ▼
//!  ┌─────────────────── Dtu ────────────────────┐
//!  │  RegFile ──► execute_command               │
//!  │                 │                          │
//!  │        ┌────────┴────────┐                 │
//!  │        ▼                 ▼                 │
//!  │   message unit      memory unit            │
//!  │        │                 │                 │
//!  │        └──► transfer engine ◄──┘           │
//!  │              (buffer pool)                 │
//!  └──────────┬──────────────────────┬──────────┘
//!             │ MemPort              │ NocPort
//!             ▼                      ▼
//!        scratchpad             other tiles
//! ```
//!
//! The DTU does not own its collaborators. Every entry point takes a
//! [`DtuCtx`] that lends it the event queue, the memory port, the NoC port
//! and the core of its tile for the duration of the call.

mod core;
pub mod header;
mod mem_unit;
mod msg_unit;
pub mod noc_addr;
pub mod packet;
pub mod regfile;
mod xfer_unit;

pub use self::core::{CacheAdmission, Dtu};
pub use header::{MessageHeader, HEADER_SIZE};
pub use noc_addr::NocAddr;
pub use packet::{
    MemCmd, MemReqKind, MemSenderState, NocPacketType, NocSenderState, Packet, SenderState,
};
pub use regfile::{CmdReg, Command, CommandOpcode, DtuReg, EpReg, MemFlags, Reg, RegFile, RegFileError, Register};
pub use xfer_unit::TransferType;

use thiserror::Error;

use crate::sim::{CoreControl, EventQueue, MemPort, NocPort};

/// Events handled by a DTU.
#[derive(Debug)]
pub enum DtuEvent {
    /// Decode and start the command in the COMMAND register.
    ExecuteCommand,
    /// Put a prepared request on the local-memory port.
    IssueMemRequest(Packet),
    /// Put a prepared request on the NoC port.
    IssueNocRequest(Packet),
    /// Response from local memory.
    MemResponse(Packet),
    /// Request from another DTU.
    NocRequest(Packet),
    /// Response to one of our NoC requests.
    NocResponse(Packet),
}

/// Protocol violations. Any of these aborts the simulation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DtuError {
    #[error("invalid opcode {raw:#x} (EP{ep})")]
    InvalidOpcode { raw: u64, ep: usize },

    #[error("{opcode} with invalid endpoint EP{ep}")]
    InvalidEndpoint { opcode: &'static str, ep: usize },

    #[error("{opcode} with EP{ep} issued while another command is in flight")]
    CommandInFlight { opcode: &'static str, ep: usize },

    #[error("finish_command without a command in flight")]
    NoCommandInFlight,

    #[error("{port} port refused a request while a retry is already pending")]
    RetryAlreadyPending { port: &'static str },

    #[error("read pointer increment on EP{ep} without a pending message")]
    ReadPtrUnderflow { ep: usize },

    #[error("expected a {expected} sender state, found none")]
    MissingSenderState { expected: &'static str },

    #[error("expected a {expected} sender state, found a {found} one")]
    SenderStateMismatch { expected: &'static str, found: &'static str },

    #[error("message of {size} bytes exceeds the maximum NoC packet size of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("REPLY on EP{ep} without a received message")]
    NoMessageToReply { ep: usize },

    #[error("unexpected {what} packet @ {addr:#x}")]
    UnexpectedPacket { what: &'static str, addr: u64 },
}

/// Why a memory access through an endpoint was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AccessDenied {
    #[error("insufficient permissions")]
    Permission,
    #[error("out of bounds (0..{limit:#x})")]
    OutOfBounds { limit: u64 },
    #[error("remote address {base:#x} + {offset:#x} is not addressable over the NoC")]
    Unaddressable { base: u64, offset: u64 },
}

/// Counters kept by each DTU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtuStats {
    pub commands: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub replies_sent: u64,
    pub remote_reads: u64,
    pub remote_writes: u64,
    pub noc_retries: u64,
    pub mem_retries: u64,
    pub refused_accesses: u64,
    pub transfers: u64,
    pub bytes_transferred: u64,
}

/// Collaborators lent to a DTU for one call.
pub struct DtuCtx<'a> {
    pub queue: &'a mut EventQueue,
    pub mem: &'a mut dyn MemPort,
    pub noc: &'a mut dyn NocPort,
    pub core: &'a mut dyn CoreControl,
}
