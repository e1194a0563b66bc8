//! NoC address encoding.
//!
//! ```text
//!  63  62          52 51      44 43                    0
//! ┌───┬──────────────┬──────────┬───────────────────────┐
//! │ V │   core id    │  ep id   │        offset         │
//! └───┴──────────────┴──────────┴───────────────────────┘
//! ```

use std::fmt;

use crate::sim::{Addr, CoreId};

/// A decoded NoC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NocAddr {
    pub valid: bool,
    pub core_id: CoreId,
    pub ep_id: u8,
    pub offset: Addr,
}

impl NocAddr {
    pub const VALID_BIT: u32 = 63;
    pub const CORE_SHIFT: u32 = 52;
    pub const CORE_BITS: u32 = 11;
    pub const EP_SHIFT: u32 = 44;
    pub const EP_BITS: u32 = 8;
    pub const OFFSET_BITS: u32 = 44;

    const CORE_MASK: u64 = (1 << Self::CORE_BITS) - 1;
    const EP_MASK: u64 = (1 << Self::EP_BITS) - 1;
    const OFFSET_MASK: u64 = (1 << Self::OFFSET_BITS) - 1;

    /// End of the offset space: ranges must end at or below this.
    pub const OFFSET_LIMIT: u64 = 1 << Self::OFFSET_BITS;

    /// Build a valid address. Out-of-range fields are truncated.
    pub fn new(core_id: CoreId, ep_id: u8, offset: Addr) -> Self {
        if offset > Self::OFFSET_MASK || u64::from(core_id) > Self::CORE_MASK {
            log::warn!(
                "NoC address field truncated (core {}, offset {:#x})",
                core_id,
                offset
            );
        }
        Self {
            valid: true,
            core_id: (u64::from(core_id) & Self::CORE_MASK) as CoreId,
            ep_id,
            offset: offset & Self::OFFSET_MASK,
        }
    }

    /// Whether `size` bytes starting at `offset` fit into the offset field.
    pub fn fits(offset: Addr, size: u64) -> bool {
        offset.checked_add(size).is_some_and(|end| end <= Self::OFFSET_LIMIT)
    }

    /// Decode a raw 64-bit address.
    pub fn from_raw(raw: Addr) -> Self {
        Self {
            valid: (raw >> Self::VALID_BIT) & 1 == 1,
            core_id: ((raw >> Self::CORE_SHIFT) & Self::CORE_MASK) as CoreId,
            ep_id: ((raw >> Self::EP_SHIFT) & Self::EP_MASK) as u8,
            offset: raw & Self::OFFSET_MASK,
        }
    }

    /// Encode to a raw 64-bit address.
    pub fn raw(&self) -> Addr {
        (u64::from(self.valid) << Self::VALID_BIT)
            | ((u64::from(self.core_id) & Self::CORE_MASK) << Self::CORE_SHIFT)
            | ((u64::from(self.ep_id) & Self::EP_MASK) << Self::EP_SHIFT)
            | (self.offset & Self::OFFSET_MASK)
    }
}

impl fmt::Display for NocAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}:EP{}+{:#x}", self.core_id, self.ep_id, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_fields() {
        let addr = NocAddr::new(3, 5, 0x1234);
        let raw = addr.raw();
        assert_eq!(raw >> 63, 1);
        assert_eq!((raw >> 52) & 0x7FF, 3);
        assert_eq!((raw >> 44) & 0xFF, 5);
        assert_eq!(raw & 0xFFF_FFFF_FFFF, 0x1234);
        assert_eq!(NocAddr::from_raw(raw), addr);
    }

    #[test]
    fn test_zero_is_invalid() {
        let addr = NocAddr::from_raw(0);
        assert!(!addr.valid);
        assert_eq!(addr.core_id, 0);
    }

    #[test]
    fn test_offset_truncated() {
        let addr = NocAddr::new(0, 0, 1 << 44 | 0x10);
        assert_eq!(addr.offset, 0x10);
    }

    #[test]
    fn test_fits() {
        assert!(NocAddr::fits(0, NocAddr::OFFSET_LIMIT));
        assert!(NocAddr::fits(NocAddr::OFFSET_LIMIT - 8, 8));
        assert!(!NocAddr::fits(NocAddr::OFFSET_LIMIT - 8, 9));
        assert!(!NocAddr::fits(u64::MAX, 1));
    }

    #[test]
    fn test_max_core_id() {
        let addr = NocAddr::new(0x7FF, 0xFF, 0);
        let back = NocAddr::from_raw(addr.raw());
        assert_eq!(back.core_id, 0x7FF);
        assert_eq!(back.ep_id, 0xFF);
        assert_eq!(addr.to_string(), "C2047:EP255+0x0");
    }
}
