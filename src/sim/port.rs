//! Port capabilities and flow control.
//!
//! A DTU never talks to the memory or the NoC directly. It is handed
//! implementations of [`MemPort`], [`NocPort`] and [`CoreControl`] for the
//! duration of each callback. Timing requests may be refused; refused
//! requesters are told to retry through an [`Event::Retry`].

use std::collections::VecDeque;

use super::event::{Event, EventQueue, PortRef};
use super::{CoreId, Tick};
use crate::dtu::Packet;

/// Outcome of a timing request.
#[derive(Debug)]
pub enum Delivery {
    /// The receiver took ownership of the packet.
    Accepted,
    /// The receiver is busy; the packet is handed back and a retry will follow.
    Refused(Packet),
}

impl Delivery {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Delivery::Accepted)
    }
}

/// Local-memory side of a requester.
pub trait MemPort {
    /// Perform the access immediately and turn the packet into a response.
    /// Returns the access latency in ticks.
    fn send_atomic(&mut self, pkt: &mut Packet) -> Tick;

    /// Perform the access immediately without any timing side effects.
    fn send_functional(&mut self, pkt: &mut Packet);

    /// Issue a timing request. The response is delivered to `reply_to` as an
    /// event once the access completes.
    fn send_timing_req(&mut self, pkt: Packet, reply_to: PortRef, queue: &mut EventQueue) -> Delivery;
}

/// NoC side of a DTU.
pub trait NocPort {
    /// Issue a timing request from tile `src`.
    fn send_timing_req(&mut self, pkt: Packet, src: CoreId, queue: &mut EventQueue) -> Delivery;

    /// Issue a request that is delivered within the current tick.
    fn send_atomic_req(&mut self, pkt: Packet, src: CoreId, queue: &mut EventQueue);

    /// Issue a functional request. It is serviced before the caller regains
    /// control of the simulation.
    fn send_functional_req(&mut self, pkt: Packet, src: CoreId);

    /// Send a response back to the tile that issued the request, leaving at `when`.
    fn send_timing_resp(&mut self, pkt: Packet, when: Tick, queue: &mut EventQueue);

    /// Send a response within the current tick.
    fn send_atomic_resp(&mut self, pkt: Packet, queue: &mut EventQueue);

    /// Send the response of a functional request.
    fn send_functional_resp(&mut self, pkt: Packet);
}

/// The core model as seen by its DTU.
pub trait CoreControl {
    /// Whether the core is currently suspended.
    fn is_suspended(&self) -> bool;

    /// Resume a suspended core.
    fn activate(&mut self);

    /// Current value of the "deny suspend" pin.
    fn deny_suspend(&self) -> bool;

    /// Drive the "deny suspend" pin.
    fn set_deny_suspend(&mut self, deny: bool);
}

/// Power state of a tile's core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreState {
    suspended: bool,
    deny_suspend: bool,
    wakeups: u64,
}

impl CoreState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to suspend the core. Fails while the DTU denies suspension.
    pub fn suspend(&mut self) -> bool {
        if self.deny_suspend {
            return false;
        }
        self.suspended = true;
        true
    }

    /// Number of times the core was woken up.
    pub fn wakeups(&self) -> u64 {
        self.wakeups
    }
}

impl CoreControl for CoreState {
    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn activate(&mut self) {
        if self.suspended {
            self.suspended = false;
            self.wakeups += 1;
        }
    }

    fn deny_suspend(&self) -> bool {
        self.deny_suspend
    }

    fn set_deny_suspend(&mut self, deny: bool) {
        self.deny_suspend = deny;
    }
}

/// An occupancy-based resource (crossbar layer, NoC link, memory port).
///
/// While busy, requests are refused and the requester receives a retry once
/// the layer frees up. A blocked layer refuses everything until unblocked.
#[derive(Debug, Clone, Default)]
pub struct Layer {
    busy_until: Tick,
    blocked: bool,
    waiting: Vec<PortRef>,
    refusals: u64,
}

impl Layer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to occupy the layer for `duration` ticks starting at the current tick.
    pub fn try_occupy(&mut self, duration: Tick, requester: PortRef, queue: &mut EventQueue) -> bool {
        let now = queue.now();

        if self.blocked {
            self.refusals += 1;
            if !self.waiting.contains(&requester) {
                self.waiting.push(requester);
            }
            return false;
        }

        if now < self.busy_until {
            self.refusals += 1;
            queue.schedule(self.busy_until, Event::Retry(requester));
            return false;
        }

        self.busy_until = now + duration;
        true
    }

    /// Block or unblock the layer. Unblocking grants a retry to every
    /// requester refused while blocked.
    pub fn set_blocked(&mut self, blocked: bool, queue: &mut EventQueue) {
        self.blocked = blocked;
        if !blocked {
            let when = queue.now().max(self.busy_until);
            for requester in self.waiting.drain(..) {
                queue.schedule(when, Event::Retry(requester));
            }
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn is_busy(&self, now: Tick) -> bool {
        self.blocked || now < self.busy_until
    }

    /// Number of refused requests so far.
    pub fn refusals(&self) -> u64 {
        self.refusals
    }
}

/// The single retry slot of a requesting port.
///
/// At most one refused packet is held. Requests whose issue time arrives
/// while a packet is held queue up behind it in order and are only sent
/// after the held packet got through.
#[derive(Debug, Default)]
pub struct RetrySlot {
    held: Option<Packet>,
    waiting: VecDeque<Packet>,
}

impl RetrySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a refused packet is waiting for a retry grant.
    pub fn is_blocked(&self) -> bool {
        self.held.is_some()
    }

    /// Hold a refused packet. Hands the packet back if one is already held.
    pub fn hold(&mut self, pkt: Packet) -> Result<(), Packet> {
        if self.held.is_some() {
            return Err(pkt);
        }
        self.held = Some(pkt);
        Ok(())
    }

    /// Take the held packet for resending.
    pub fn take_held(&mut self) -> Option<Packet> {
        self.held.take()
    }

    /// Queue a packet behind the held one.
    pub fn defer(&mut self, pkt: Packet) {
        self.waiting.push_back(pkt);
    }

    /// Next packet queued behind the held one.
    pub fn next_waiting(&mut self) -> Option<Packet> {
        self.waiting.pop_front()
    }

    /// Number of packets queued behind the held one.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }
}
