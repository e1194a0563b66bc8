//! The `dtutest` traffic generator.
//!
//! Sixteen one-byte accesses in four phases of four steps each:
//!
//! | Steps  | Access                                            |
//! |--------|---------------------------------------------------|
//! | 0..4   | write `step` to scratchpad address `step`          |
//! | 4..8   | read `cache_window_base + step - 4` via the DTU    |
//! | 8..12  | write `0xA0 | (step - 8)` to `cache_window_base + step` |
//! | 12..16 | read scratchpad address `step - 4`                 |
//!
//! A phase starts only when every response of the previous phase is in.
//! A refused request is held and resent on the retry grant; the tester does
//! not tick again until it got through.

use crate::dtu::Packet;
use crate::sim::{Addr, CoreId, CpuDriver, Delivery, Fabric, MasterId, SimError};

/// Number of steps in the scenario.
pub const STEPS: u32 = 16;

const PHASE_LEN: u32 = 4;

/// A completed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TesterRead {
    pub step: u32,
    pub addr: Addr,
    pub value: u8,
}

/// What the tester observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TesterResults {
    /// Requests accepted by the crossbar, in step order.
    pub sent: Vec<u32>,
    /// Responses received.
    pub completed: u32,
    pub reads: Vec<TesterRead>,
    pub errors: u32,
    pub retries: u32,
}

#[derive(Debug)]
struct Outstanding {
    step: u32,
    addr: Addr,
}

pub struct DtuTester {
    name: String,
    master: MasterId,
    counter: u32,
    retry: Option<(Outstanding, Packet)>,
    outstanding: Vec<Outstanding>,
    waiting_for_phase: bool,
    results: TesterResults,
}

impl DtuTester {
    /// Create the tester for tile `core` and register it as a requester.
    pub fn new(core: CoreId, fabric: &mut Fabric) -> Self {
        let name = format!("tile{}.tester", core);
        let master = fabric.register_master(name.as_str());
        Self {
            name,
            master,
            counter: 0,
            retry: None,
            outstanding: Vec::new(),
            waiting_for_phase: false,
            results: TesterResults::default(),
        }
    }

    pub fn results(&self) -> &TesterResults {
        &self.results
    }

    /// Whether every step was sent and answered.
    pub fn is_done(&self) -> bool {
        self.counter >= STEPS && self.outstanding.is_empty() && self.retry.is_none()
    }

    fn request_for(&self, step: u32, cache_base: Addr) -> Packet {
        let step_addr = step as Addr;
        match step / PHASE_LEN {
            0 => Packet::write(step_addr, vec![step as u8], self.master),
            1 => Packet::read(cache_base + step_addr - 4, 1, self.master),
            2 => Packet::write(cache_base + step_addr, vec![0xA0 | (step - 8) as u8], self.master),
            _ => Packet::read(step_addr - 4, 1, self.master),
        }
    }

    fn send(&mut self, core: CoreId, fabric: &mut Fabric, entry: Outstanding, pkt: Packet) -> Result<bool, SimError> {
        log::debug!(
            "{}: step {}: {} @ {:#x}",
            self.name,
            entry.step,
            if pkt.is_write() { "write" } else { "read" },
            pkt.addr()
        );

        match fabric.cpu_send(core, pkt)? {
            Delivery::Accepted => {
                self.results.sent.push(entry.step);
                self.outstanding.push(entry);
                Ok(true)
            }
            Delivery::Refused(pkt) => {
                log::trace!("{}: step {} refused, waiting for retry", self.name, entry.step);
                self.results.retries += 1;
                self.retry = Some((entry, pkt));
                Ok(false)
            }
        }
    }
}

impl CpuDriver for DtuTester {
    fn tick(&mut self, core: CoreId, fabric: &mut Fabric) -> Result<(), SimError> {
        if self.counter >= STEPS || self.retry.is_some() {
            return Ok(());
        }
        if self.counter % PHASE_LEN == 0 && !self.outstanding.is_empty() {
            self.waiting_for_phase = true;
            return Ok(());
        }

        let step = self.counter;
        let pkt = self.request_for(step, fabric.config().system.cache_window_base);
        let entry = Outstanding { step, addr: pkt.addr() };
        self.counter += 1;

        if self.send(core, fabric, entry, pkt)? {
            fabric.schedule_tick(core, 1);
        }
        Ok(())
    }

    fn recv_response(&mut self, core: CoreId, fabric: &mut Fabric, pkt: Packet) -> Result<(), SimError> {
        let cache_base = fabric.config().system.cache_window_base;
        // Responses from the memory endpoint carry the window-relative address
        let pos = self
            .outstanding
            .iter()
            .position(|o| o.addr == pkt.addr())
            .or_else(|| {
                self.outstanding
                    .iter()
                    .position(|o| o.addr >= cache_base && o.addr - cache_base == pkt.addr())
            });
        let Some(pos) = pos else {
            log::warn!("{}: unexpected response @ {:#x}", self.name, pkt.addr());
            return Ok(());
        };
        let entry = self.outstanding.remove(pos);
        self.results.completed += 1;

        if pkt.is_error() {
            log::warn!(
                "{}: {} access failed at {:#x}",
                self.name,
                if pkt.is_write() { "Write" } else { "Read" },
                entry.addr
            );
            self.results.errors += 1;
        } else if pkt.is_read() {
            let value = pkt.data().first().copied().unwrap_or(0);
            log::debug!("{}: read of {:#x} @ tick {} returns {:#x}", self.name, entry.addr, fabric.now(), value);
            self.results.reads.push(TesterRead {
                step: entry.step,
                addr: entry.addr,
                value,
            });
        }

        if self.waiting_for_phase && self.outstanding.is_empty() {
            self.waiting_for_phase = false;
            fabric.schedule_tick(core, 1);
        }
        Ok(())
    }

    fn recv_retry(&mut self, core: CoreId, fabric: &mut Fabric) -> Result<(), SimError> {
        let Some((entry, pkt)) = self.retry.take() else {
            return Ok(());
        };
        if self.send(core, fabric, entry, pkt)? {
            log::debug!("{}: proceeding after successful retry", self.name);
            fabric.schedule_tick(core, 1);
        }
        Ok(())
    }
}
