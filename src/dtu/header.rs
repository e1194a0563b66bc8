//! Message header carried in front of every message payload.
//!
//! ```text
//! +------------------------------------------+
//! | label          : u64                     |  0
//! | reply_label    : u64                     |  8
//! | length         : u16                     | 16
//! | sender_core_id : u16                     | 18
//! | flags          : u8   (bit 0 = REPLY)    | 20
//! | sender_ep_id   : u8                      | 21
//! | reply_ep_id    : u8                      | 22
//! | reserved       : u8                      | 23
//! +------------------------------------------+
//! ```
//!
//! The layout has no padding, so it maps directly onto the little-endian
//! bytes stored in a receive slot.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Size of [`MessageHeader`] in bytes.
pub const HEADER_SIZE: usize = 24;

/// Message header flags.
pub mod flags {
    /// The message is a reply.
    pub const REPLY: u8 = 1 << 0;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    pub label: u64,
    pub reply_label: u64,
    pub length: u16,
    pub sender_core_id: u16,
    pub flags: u8,
    pub sender_ep_id: u8,
    pub reply_ep_id: u8,
    pub reserved: u8,
}

const _: () = assert!(std::mem::size_of::<MessageHeader>() == HEADER_SIZE);

impl MessageHeader {
    /// Parse a header from the start of a message.
    pub fn parse(data: &[u8]) -> Option<Self> {
        Self::read_from_prefix(data).ok().map(|(hdr, _)| hdr)
    }

    pub fn is_reply(&self) -> bool {
        self.flags & flags::REPLY != 0
    }

    /// Header followed by `payload`, as sent over the NoC.
    pub fn with_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(self.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }
}
