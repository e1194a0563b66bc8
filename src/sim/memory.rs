//! Tile-local scratchpad memory.
//!
//! Storage is sparse: 4 KiB pages are allocated on first write and
//! unallocated memory reads as zero. The port is a [`Layer`] that is busy for
//! one access occupancy after each timing request; responses arrive after the
//! access latency.

use std::collections::BTreeMap;

use super::event::{Event, EventQueue, PortRef};
use super::port::{Delivery, Layer, MemPort};
use super::{Addr, MasterId, Tick};
use crate::dtu::{DtuEvent, Packet};

/// Accesses of one requester.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub errors: u64,
}

/// Byte-addressable memory of a tile.
pub struct Scratchpad {
    name: String,
    size: Addr,
    latency: Tick,
    occupancy: Tick,
    pages: BTreeMap<u64, Box<[u8; Self::PAGE_SIZE]>>,
    port: Layer,
    stats: BTreeMap<MasterId, MemoryStats>,
}

impl Scratchpad {
    pub const PAGE_SIZE: usize = 4096;

    const PAGE_MASK: u64 = !(Self::PAGE_SIZE as u64 - 1);

    /// Create a memory of `size` bytes answering after `latency` ticks and
    /// accepting a new timing request every `occupancy` ticks.
    pub fn new(name: impl Into<String>, size: Addr, latency: Tick, occupancy: Tick) -> Self {
        Self {
            name: name.into(),
            size,
            latency,
            occupancy,
            pages: BTreeMap::new(),
            port: Layer::new(),
            stats: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> Addr {
        self.size
    }

    fn page_offset(addr: u64) -> usize {
        (addr & (Self::PAGE_SIZE as u64 - 1)) as usize
    }

    fn get_or_create_page(&mut self, addr: u64) -> &mut [u8; Self::PAGE_SIZE] {
        self.pages
            .entry(addr & Self::PAGE_MASK)
            .or_insert_with(|| Box::new([0; Self::PAGE_SIZE]))
    }

    /// Write bytes without bounds checking or statistics.
    pub fn write_bytes(&mut self, addr: Addr, data: &[u8]) {
        let mut current = addr;
        let mut remaining = data;

        while !remaining.is_empty() {
            let offset = Self::page_offset(current);
            let n = remaining.len().min(Self::PAGE_SIZE - offset);
            let page = self.get_or_create_page(current);
            page[offset..offset + n].copy_from_slice(&remaining[..n]);

            current += n as u64;
            remaining = &remaining[n..];
        }
    }

    /// Read bytes without bounds checking or statistics.
    pub fn read_bytes(&self, addr: Addr, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        let mut current = addr;
        let mut pos = 0;

        while pos < len {
            let offset = Self::page_offset(current);
            let n = (len - pos).min(Self::PAGE_SIZE - offset);
            if let Some(page) = self.pages.get(&(current & Self::PAGE_MASK)) {
                out[pos..pos + n].copy_from_slice(&page[offset..offset + n]);
            }
            current += n as u64;
            pos += n;
        }
        out
    }

    /// Perform an access and turn the packet into its response.
    /// Requests that expect no response are ignored.
    pub fn access(&mut self, pkt: &mut Packet) {
        if !pkt.needs_response() {
            log::trace!("{}: ignoring {:?} @ {:#x}", self.name, pkt.cmd(), pkt.addr());
            return;
        }

        let in_bounds = pkt
            .addr()
            .checked_add(pkt.size() as u64)
            .is_some_and(|end| end <= self.size);

        if !in_bounds || !(pkt.is_read() || pkt.is_write()) {
            log::debug!(
                "{}: {:?} @ {:#x}:{} by {} out of range",
                self.name,
                pkt.cmd(),
                pkt.addr(),
                pkt.size(),
                pkt.requester()
            );
            self.stats.entry(pkt.requester()).or_default().errors += 1;
            pkt.make_error_response();
            return;
        }

        let size = pkt.size();
        if pkt.is_read() {
            let data = self.read_bytes(pkt.addr(), size);
            pkt.set_data(data);
        } else {
            let len = size.min(pkt.data().len());
            let addr = pkt.addr();
            self.write_bytes(addr, &pkt.data()[..len]);
        }

        let stats = self.stats.entry(pkt.requester()).or_default();
        if pkt.is_read() {
            stats.reads += 1;
            stats.bytes_read += size as u64;
        } else {
            stats.writes += 1;
            stats.bytes_written += size as u64;
        }

        log::trace!(
            "{}: {} {} bytes @ {:#x} for {}",
            self.name,
            if pkt.is_read() { "read" } else { "wrote" },
            pkt.size(),
            pkt.addr(),
            pkt.requester()
        );
        pkt.make_response();
    }

    /// Accesses of `requester` so far.
    pub fn stats(&self, requester: MasterId) -> MemoryStats {
        self.stats.get(&requester).copied().unwrap_or_default()
    }

    /// Accesses of all requesters, ordered by id.
    pub fn all_stats(&self) -> impl Iterator<Item = (MasterId, &MemoryStats)> {
        self.stats.iter().map(|(id, s)| (*id, s))
    }

    /// Whether both memories hold the same bytes. Missing pages count as zero.
    pub fn same_contents(&self, other: &Scratchpad) -> bool {
        let zero = [0u8; Self::PAGE_SIZE];
        let page = |m: &Scratchpad, addr: &u64| -> [u8; Self::PAGE_SIZE] {
            m.pages.get(addr).map_or(zero, |p| **p)
        };
        self.pages
            .keys()
            .chain(other.pages.keys())
            .all(|addr| page(self, addr) == page(other, addr))
    }

    /// Block or unblock the port.
    pub fn set_blocked(&mut self, blocked: bool, queue: &mut EventQueue) {
        self.port.set_blocked(blocked, queue);
    }
}

impl MemPort for Scratchpad {
    fn send_atomic(&mut self, pkt: &mut Packet) -> Tick {
        self.access(pkt);
        self.latency
    }

    fn send_functional(&mut self, pkt: &mut Packet) {
        self.access(pkt);
    }

    fn send_timing_req(&mut self, mut pkt: Packet, reply_to: PortRef, queue: &mut EventQueue) -> Delivery {
        if !self.port.try_occupy(self.occupancy, reply_to, queue) {
            log::trace!("{}: busy, refusing request @ {:#x}", self.name, pkt.addr());
            return Delivery::Refused(pkt);
        }

        let needs_response = pkt.needs_response();
        self.access(&mut pkt);
        if needs_response {
            let when = queue.now() + self.latency + pkt.header_delay + pkt.payload_delay;
            pkt.header_delay = 0;
            pkt.payload_delay = 0;
            let event = match reply_to {
                PortRef::Cpu(core) => Event::CpuResponse(core, pkt),
                PortRef::DtuMem(core) | PortRef::DtuNoc(core) => Event::Dtu(core, DtuEvent::MemResponse(pkt)),
            };
            queue.schedule(when, event);
        }
        Delivery::Accepted
    }
}
