//! Minimal simulation collaborators for the DTU model.
//!
//! The DTU itself lives in [`crate::dtu`]. Everything in this module exists so
//! that a DTU can be driven end-to-end: a discrete-event queue, a clock, a
//! sparse scratchpad memory, a NoC fabric with per-link occupancy, the
//! CPU-side crossbar of a tile and the glue that ties them into a system.
//!
//! # Structure
//!
//! ```text
//!            ┌──────────────────────── Tile ─────────────────────────┐
//!  tester ──►│ crossbar ──┬─► register window ──► DTU ◄──► NocFabric │◄──► other tiles
//!            │            ├─► cache window ─────►  │                  │
//!            │            └─► scratchpad ◄─────────┘                  │
//!            └───────────────────────────────────────────────────────┘
//! ```
//!
//! All components run on one [`EventQueue`]; nothing here is thread-safe and
//! nothing needs to be.

pub mod event;
pub mod port;
pub mod memory;
pub mod noc;
pub mod master;
pub mod system;

pub use event::{Event, EventQueue, PortRef};
pub use port::{CoreControl, CoreState, Delivery, Layer, MemPort, NocPort, RetrySlot};
pub use memory::{Scratchpad, MemoryStats};
pub use noc::{FunctionalHop, NocFabric, NocStats};
pub use master::{MasterId, MasterRegistry};
pub use system::{CpuDriver, CpuEvent, Fabric, SimError, Step, System, Tile};

/// Simulated time in ticks.
pub type Tick = u64;

/// A duration in clock cycles.
pub type Cycles = u64;

/// A byte address.
pub type Addr = u64;

/// Identifier of a tile (and of the core and DTU it contains).
pub type CoreId = u16;

/// Clock domain shared by the components of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    period: Tick,
}

impl Clock {
    /// Create a clock with the given period in ticks (at least one tick).
    pub fn new(period: Tick) -> Self {
        Self { period: period.max(1) }
    }

    /// Clock period in ticks.
    pub fn period(&self) -> Tick {
        self.period
    }

    /// The tick of the clock edge `cycles` cycles after the next edge at or
    /// after `now`.
    pub fn clock_edge(&self, now: Tick, cycles: Cycles) -> Tick {
        let next_edge = now.div_ceil(self.period) * self.period;
        next_edge + cycles * self.period
    }

    /// Convert ticks to cycles, rounding up.
    pub fn ticks_to_cycles(&self, ticks: Tick) -> Cycles {
        ticks.div_ceil(self.period)
    }

    /// Convert cycles to ticks.
    pub fn cycles_to_ticks(&self, cycles: Cycles) -> Tick {
        cycles * self.period
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(1000)
    }
}
