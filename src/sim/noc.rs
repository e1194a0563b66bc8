//! Network-on-chip between the DTUs.
//!
//! The fabric is an opaque transport: a request goes straight to the tile
//! named in its [`NocAddr`], a response goes back to the tile that sent the
//! request. Each tile has one outbound request link that is occupied for the
//! serialization time of a packet; a busy or blocked link refuses requests
//! and grants a retry later. Responses are never throttled.
//!
//! Functional traffic bypasses the event queue and waits in a mailbox until
//! the system drains it.

use std::collections::VecDeque;

use super::event::{Event, EventQueue, PortRef};
use super::port::{Delivery, Layer, NocPort};
use super::{Clock, CoreId, Cycles, Tick};
use crate::dtu::{DtuEvent, NocAddr, Packet};

/// Traffic counters of the fabric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NocStats {
    pub requests: u64,
    pub responses: u64,
    pub bytes: u64,
    pub refusals: u64,
    pub misrouted: u64,
}

/// A functional packet waiting for delivery.
#[derive(Debug)]
pub enum FunctionalHop {
    Request { dest: CoreId, pkt: Packet },
    Response { dest: CoreId, pkt: Packet },
}

pub struct NocFabric {
    clock: Clock,
    hop_latency: Cycles,
    bytes_per_cycle: usize,
    links: Vec<Layer>,
    functional: VecDeque<FunctionalHop>,
    stats: NocStats,
}

impl NocFabric {
    pub fn new(num_tiles: u16, clock: Clock, hop_latency: Cycles, bytes_per_cycle: usize) -> Self {
        Self {
            clock,
            hop_latency,
            bytes_per_cycle: bytes_per_cycle.max(1),
            links: (0..num_tiles).map(|_| Layer::new()).collect(),
            functional: VecDeque::new(),
            stats: NocStats::default(),
        }
    }

    pub fn num_tiles(&self) -> usize {
        self.links.len()
    }

    pub fn stats(&self) -> &NocStats {
        &self.stats
    }

    /// Block or unblock the outbound link of `core`.
    pub fn set_blocked(&mut self, core: CoreId, blocked: bool, queue: &mut EventQueue) {
        match self.links.get_mut(core as usize) {
            Some(link) => link.set_blocked(blocked, queue),
            None => log::warn!("NoC: no link for tile {}", core),
        }
    }

    /// Next functional packet to deliver.
    pub fn take_functional(&mut self) -> Option<FunctionalHop> {
        self.functional.pop_front()
    }

    fn hop_ticks(&self) -> Tick {
        self.clock.cycles_to_ticks(self.hop_latency)
    }

    fn serialization_ticks(&self, size: usize) -> Tick {
        let cycles = size.div_ceil(self.bytes_per_cycle).max(1) as Cycles;
        self.clock.cycles_to_ticks(cycles)
    }

    /// Where a request from `src` goes. Misrouted requests are turned into
    /// error responses for `src`.
    fn route_request(&mut self, mut pkt: Packet, src: CoreId) -> (CoreId, DtuEvent) {
        pkt.set_noc_src(src);
        self.stats.requests += 1;
        self.stats.bytes += pkt.size() as u64;

        let dest = NocAddr::from_raw(pkt.addr()).core_id;
        if dest as usize >= self.links.len() {
            log::warn!(
                "NoC: request from C{} to {} has no destination",
                src,
                NocAddr::from_raw(pkt.addr())
            );
            self.stats.misrouted += 1;
            pkt.make_error_response();
            return (src, DtuEvent::NocResponse(pkt));
        }
        (dest, DtuEvent::NocRequest(pkt))
    }

    fn response_dest(&mut self, pkt: &Packet) -> Option<CoreId> {
        self.stats.responses += 1;
        self.stats.bytes += pkt.size() as u64;
        if pkt.noc_src().is_none() {
            log::warn!("NoC: dropping response @ {:#x} without a source", pkt.addr());
        }
        pkt.noc_src()
    }
}

impl NocPort for NocFabric {
    fn send_timing_req(&mut self, pkt: Packet, src: CoreId, queue: &mut EventQueue) -> Delivery {
        let duration = self.serialization_ticks(pkt.size());
        let Some(link) = self.links.get_mut(src as usize) else {
            log::warn!("NoC: no link for tile {}", src);
            return Delivery::Refused(pkt);
        };
        if !link.try_occupy(duration, PortRef::DtuNoc(src), queue) {
            self.stats.refusals += 1;
            return Delivery::Refused(pkt);
        }

        let when = queue.now() + duration + self.hop_ticks();
        let (dest, event) = self.route_request(pkt, src);
        queue.schedule(when, Event::Dtu(dest, event));
        Delivery::Accepted
    }

    fn send_atomic_req(&mut self, pkt: Packet, src: CoreId, queue: &mut EventQueue) {
        let (dest, event) = self.route_request(pkt, src);
        let now = queue.now();
        queue.schedule(now, Event::Dtu(dest, event));
    }

    fn send_functional_req(&mut self, pkt: Packet, src: CoreId) {
        let hop = match self.route_request(pkt, src) {
            (dest, DtuEvent::NocRequest(pkt)) => FunctionalHop::Request { dest, pkt },
            (dest, DtuEvent::NocResponse(pkt)) => FunctionalHop::Response { dest, pkt },
            (_, other) => {
                log::warn!("NoC: unexpected functional event {:?}", other);
                return;
            }
        };
        self.functional.push_back(hop);
    }

    fn send_timing_resp(&mut self, pkt: Packet, when: Tick, queue: &mut EventQueue) {
        if let Some(dest) = self.response_dest(&pkt) {
            let arrival = when + self.hop_ticks();
            queue.schedule(arrival, Event::Dtu(dest, DtuEvent::NocResponse(pkt)));
        }
    }

    fn send_atomic_resp(&mut self, pkt: Packet, queue: &mut EventQueue) {
        if let Some(dest) = self.response_dest(&pkt) {
            let now = queue.now();
            queue.schedule(now, Event::Dtu(dest, DtuEvent::NocResponse(pkt)));
        }
    }

    fn send_functional_resp(&mut self, pkt: Packet) {
        if let Some(dest) = self.response_dest(&pkt) {
            self.functional.push_back(FunctionalHop::Response { dest, pkt });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MasterId;

    fn fabric() -> NocFabric {
        NocFabric::new(2, Clock::new(1000), 4, 16)
    }

    fn request_to(core: CoreId, size: usize) -> Packet {
        Packet::write(NocAddr::new(core, 1, 0x40).raw(), vec![0; size], MasterId(0))
    }

    #[test]
    fn test_timing_request_arrives_after_serialization_and_hop() {
        let mut noc = fabric();
        let mut queue = EventQueue::new();
        assert!(noc.send_timing_req(request_to(1, 64), 0, &mut queue).is_accepted());

        match queue.pop() {
            Some((8000, Event::Dtu(1, DtuEvent::NocRequest(pkt)))) => {
                assert_eq!(pkt.noc_src(), Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(noc.stats().requests, 1);
        assert_eq!(noc.stats().bytes, 64);
    }

    #[test]
    fn test_busy_link_refuses() {
        let mut noc = fabric();
        let mut queue = EventQueue::new();
        assert!(noc.send_timing_req(request_to(1, 32), 0, &mut queue).is_accepted());
        assert!(!noc.send_timing_req(request_to(1, 32), 0, &mut queue).is_accepted());
        // The other tile's link is independent
        assert!(noc.send_timing_req(request_to(0, 32), 1, &mut queue).is_accepted());
        assert_eq!(noc.stats().refusals, 1);

        match queue.pop() {
            Some((2000, Event::Retry(PortRef::DtuNoc(0)))) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_misrouted_request_answered_with_error() {
        let mut noc = fabric();
        let mut queue = EventQueue::new();
        noc.send_atomic_req(request_to(9, 8), 1, &mut queue);

        match queue.pop() {
            Some((0, Event::Dtu(1, DtuEvent::NocResponse(pkt)))) => assert!(pkt.is_error()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(noc.stats().misrouted, 1);
    }

    #[test]
    fn test_response_returns_to_source() {
        let mut noc = fabric();
        let mut queue = EventQueue::new();
        noc.send_atomic_req(request_to(1, 8), 0, &mut queue);
        let Some((_, Event::Dtu(1, DtuEvent::NocRequest(mut pkt)))) = queue.pop() else {
            panic!("request not delivered");
        };
        pkt.make_response();
        noc.send_timing_resp(pkt, 3000, &mut queue);
        assert!(matches!(queue.pop(), Some((7000, Event::Dtu(0, DtuEvent::NocResponse(_))))));
    }

    #[test]
    fn test_functional_mailbox() {
        let mut noc = fabric();
        noc.send_functional_req(request_to(1, 8), 0);
        let Some(FunctionalHop::Request { dest: 1, mut pkt }) = noc.take_functional() else {
            panic!("functional request missing");
        };
        pkt.make_response();
        noc.send_functional_resp(pkt);
        assert!(matches!(noc.take_functional(), Some(FunctionalHop::Response { dest: 0, .. })));
        assert!(noc.take_functional().is_none());
    }
}
