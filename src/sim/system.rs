//! Tiles, the NoC and the simulation loop.
//!
//! A [`Fabric`] owns everything that is shared between tiles: the event
//! queue, the NoC and the tiles themselves. The traffic generators driving
//! the CPU side of each tile live in a [`System`] next to the fabric, so a
//! driver can be handed `&mut Fabric` while it runs.
//!
//! Addresses seen by the CPU side of a tile:
//!
//! ```text
//!  0 ─────────────── memory_size      scratchpad
//!  cache_window_base ── reg_file_base  memory endpoint (bridged over the NoC)
//!  reg_file_base ───── + regs.size()  DTU registers
//! ```

use thiserror::Error;

use super::event::{Event, EventQueue, PortRef};
use super::noc::FunctionalHop;
use super::port::{CoreState, Delivery, Layer, MemPort};
use super::{Addr, Clock, CoreId, MasterId, MasterRegistry, NocFabric, Scratchpad, Tick};
use crate::config::{Config, ConfigError};
use crate::dtu::{CacheAdmission, Dtu, DtuCtx, DtuError, Packet};

/// Errors that stop a simulation.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("DTU of tile {core}: {source}")]
    Dtu {
        core: CoreId,
        #[source]
        source: DtuError,
    },

    #[error("no tile {0}")]
    UnknownTile(CoreId),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("functional access @ {addr:#x} got no response")]
    FunctionalIncomplete { addr: Addr },
}

/// One tile: a DTU, its scratchpad, its core and its CPU-side crossbar.
pub struct Tile {
    pub core_id: CoreId,
    pub dtu: Dtu,
    pub memory: Scratchpad,
    pub core: CoreState,
    pub xbar: Layer,
}

/// Something for the CPU side of a tile.
#[derive(Debug)]
pub enum CpuEvent {
    Tick,
    Response(Packet),
    Retry,
}

/// Outcome of [`Fabric::step`].
#[derive(Debug)]
pub enum Step {
    /// No events left.
    Empty,
    /// A DTU event was handled.
    Handled,
    /// An event for the CPU side of a tile.
    Cpu(CoreId, CpuEvent),
}

/// Everything but the traffic generators.
pub struct Fabric {
    config: Config,
    clock: Clock,
    queue: EventQueue,
    tiles: Vec<Tile>,
    noc: NocFabric,
    masters: MasterRegistry,
}

impl Fabric {
    /// Build the tiles described by `config`.
    pub fn new(config: Config) -> Result<Self, SimError> {
        config.validate()?;

        let sys = &config.system;
        let clock = Clock::new(sys.clock_period);
        let mut masters = MasterRegistry::new();

        let tiles = (0..sys.num_tiles)
            .map(|core_id| {
                let name = format!("tile{}.dtu", core_id);
                let master = masters.register(name.as_str());
                Tile {
                    core_id,
                    dtu: Dtu::new(name, core_id, config.dtu.clone(), master, sys.atomic_mode, clock),
                    memory: Scratchpad::new(
                        format!("tile{}.mem", core_id),
                        sys.memory_size,
                        clock.cycles_to_ticks(sys.memory_latency),
                        clock.period(),
                    ),
                    core: CoreState::new(),
                    xbar: Layer::new(),
                }
            })
            .collect();

        log::info!(
            "Built {} tiles in {} mode",
            sys.num_tiles,
            if sys.atomic_mode { "atomic" } else { "timing" }
        );

        Ok(Self {
            noc: NocFabric::new(sys.num_tiles, clock, sys.noc_hop_latency, sys.noc_bytes_per_cycle),
            clock,
            queue: EventQueue::new(),
            tiles,
            masters,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn is_atomic(&self) -> bool {
        self.config.system.atomic_mode
    }

    pub fn now(&self) -> Tick {
        self.queue.now()
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile(&self, id: CoreId) -> Option<&Tile> {
        self.tiles.get(id as usize)
    }

    pub fn tile_mut(&mut self, id: CoreId) -> Option<&mut Tile> {
        self.tiles.get_mut(id as usize)
    }

    pub fn noc(&self) -> &NocFabric {
        &self.noc
    }

    pub fn masters(&self) -> &MasterRegistry {
        &self.masters
    }

    /// Register a requester and return its id.
    pub fn register_master(&mut self, name: impl Into<String>) -> MasterId {
        self.masters.register(name)
    }

    /// Let the traffic generator of `core` run `cycles` cycles from now.
    pub fn schedule_tick(&mut self, core: CoreId, cycles: u64) {
        let when = self.clock.clock_edge(self.queue.now(), cycles);
        self.queue.schedule(when, Event::CpuTick(core));
    }

    /// Run `f` on the DTU of `id` with its collaborators.
    pub fn with_dtu<R>(
        &mut self,
        id: CoreId,
        f: impl FnOnce(&mut Dtu, &mut DtuCtx<'_>) -> Result<R, DtuError>,
    ) -> Result<R, SimError> {
        let tile = self.tiles.get_mut(id as usize).ok_or(SimError::UnknownTile(id))?;
        let mut ctx = DtuCtx {
            queue: &mut self.queue,
            mem: &mut tile.memory,
            noc: &mut self.noc,
            core: &mut tile.core,
        };
        f(&mut tile.dtu, &mut ctx).map_err(|source| SimError::Dtu { core: id, source })
    }

    fn reg_file_base(&self) -> Addr {
        self.config.dtu.reg_file_base_addr
    }

    /// Whether `addr` lies in the window bridged to the memory endpoint.
    fn is_cache_addr(&self, addr: Addr) -> bool {
        addr >= self.config.system.cache_window_base && addr < self.reg_file_base()
    }

    /// Send a request from the CPU side of `id` through its crossbar.
    ///
    /// The response arrives as [`Event::CpuResponse`]. A refused request is
    /// handed back and the requester gets an [`Event::Retry`] later.
    pub fn cpu_send(&mut self, id: CoreId, mut pkt: Packet) -> Result<Delivery, SimError> {
        let atomic = self.is_atomic();
        let cache_base = self.config.system.cache_window_base;
        let addr = pkt.addr();

        if !atomic {
            let xbar_ticks = self.clock.cycles_to_ticks(self.config.system.xbar_occupancy);
            let tile = self.tiles.get_mut(id as usize).ok_or(SimError::UnknownTile(id))?;
            if !tile.xbar.try_occupy(xbar_ticks, PortRef::Cpu(id), &mut self.queue) {
                log::trace!("tile{}.xbar: busy, refusing request @ {:#x}", id, addr);
                return Ok(Delivery::Refused(pkt));
            }
            pkt.header_delay = xbar_ticks;
        }

        let is_reg = self.tile(id).ok_or(SimError::UnknownTile(id))?.dtu.is_reg_addr(addr);
        if is_reg {
            self.with_dtu(id, |dtu, ctx| dtu.handle_cpu_request(ctx, pkt))?;
            return Ok(Delivery::Accepted);
        }

        if self.is_cache_addr(addr) {
            pkt.set_addr(addr - cache_base);
            let admission = self.with_dtu(id, |dtu, ctx| dtu.handle_cache_mem_request(ctx, pkt, false))?;
            if let CacheAdmission::Refused(mut pkt) = admission {
                if pkt.needs_response() {
                    pkt.set_addr(addr);
                    pkt.make_error_response();
                    let now = self.queue.now();
                    self.queue.schedule(now, Event::CpuResponse(id, pkt));
                }
            }
            return Ok(Delivery::Accepted);
        }

        let tile = self.tiles.get_mut(id as usize).ok_or(SimError::UnknownTile(id))?;
        if !atomic {
            return Ok(tile.memory.send_timing_req(pkt, PortRef::Cpu(id), &mut self.queue));
        }

        let needs_response = pkt.needs_response();
        tile.memory.send_atomic(&mut pkt);
        if needs_response {
            let now = self.queue.now();
            self.queue.schedule(now, Event::CpuResponse(id, pkt));
        }
        Ok(Delivery::Accepted)
    }

    /// Perform an access from the CPU side of `id` without timing. Returns
    /// the response, or `None` for requests that expect none.
    pub fn functional_access(&mut self, id: CoreId, mut pkt: Packet) -> Result<Option<Packet>, SimError> {
        let cache_base = self.config.system.cache_window_base;
        let addr = pkt.addr();
        let is_cache = self.is_cache_addr(addr);
        let tile = self.tiles.get_mut(id as usize).ok_or(SimError::UnknownTile(id))?;

        if tile.dtu.is_reg_addr(addr) {
            tile.dtu.handle_functional_reg_request(&mut pkt);
            return Ok(Some(pkt));
        }
        if !is_cache {
            let needs_response = pkt.needs_response();
            tile.memory.send_functional(&mut pkt);
            return Ok(needs_response.then_some(pkt));
        }

        pkt.set_addr(addr - cache_base);
        match self.with_dtu(id, |dtu, ctx| dtu.handle_cache_mem_request(ctx, pkt, true))? {
            CacheAdmission::Forwarded => {}
            CacheAdmission::Dropped => return Ok(None),
            CacheAdmission::Refused(mut pkt) => {
                pkt.set_addr(addr);
                pkt.make_error_response();
                return Ok(Some(pkt));
            }
        }

        let mut pkt = self.drain_functional()?.ok_or(SimError::FunctionalIncomplete { addr })?;
        pkt.set_addr(addr);
        Ok(Some(pkt))
    }

    /// Deliver functional NoC traffic until the mailbox is empty. Returns the
    /// response that came back to its requester, if any.
    fn drain_functional(&mut self) -> Result<Option<Packet>, SimError> {
        let mut result = None;
        while let Some(hop) = self.noc.take_functional() {
            match hop {
                FunctionalHop::Request { dest, pkt } => {
                    self.with_dtu(dest, |dtu, ctx| dtu.handle_noc_request(ctx, pkt))?;
                }
                FunctionalHop::Response { dest, pkt } => {
                    if let Some(pkt) = self.with_dtu(dest, |dtu, ctx| dtu.complete_noc_request(ctx, pkt))? {
                        result = Some(pkt);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Time of the next event, if any.
    pub fn next_event_time(&self) -> Option<Tick> {
        self.queue.peek_time()
    }

    /// Handle the next event. Events for the CPU side are handed back.
    pub fn step(&mut self) -> Result<Step, SimError> {
        let Some((_, event)) = self.queue.pop() else {
            return Ok(Step::Empty);
        };
        let cpu_event = match event {
            Event::Dtu(core, ev) => {
                self.with_dtu(core, |dtu, ctx| dtu.handle_event(ctx, ev))?;
                return Ok(Step::Handled);
            }
            Event::Retry(PortRef::DtuMem(core)) => {
                self.with_dtu(core, |dtu, ctx| dtu.recv_mem_retry(ctx))?;
                return Ok(Step::Handled);
            }
            Event::Retry(PortRef::DtuNoc(core)) => {
                self.with_dtu(core, |dtu, ctx| dtu.recv_noc_retry(ctx))?;
                return Ok(Step::Handled);
            }
            Event::CpuTick(core) => (core, CpuEvent::Tick),
            Event::CpuResponse(core, pkt) => (core, CpuEvent::Response(pkt)),
            Event::Retry(PortRef::Cpu(core)) => (core, CpuEvent::Retry),
        };
        Ok(Step::Cpu(cpu_event.0, cpu_event.1))
    }

    /// Whether every DTU is idle.
    pub fn is_quiescent(&self) -> bool {
        self.tiles.iter().all(|t| t.dtu.is_idle())
    }

    /// Register state of every DTU.
    pub fn dump_state(&self) -> String {
        self.tiles.iter().map(|t| t.dtu.dump_state()).collect::<Vec<_>>().join("\n")
    }
}

/// Traffic generator on the CPU side of a tile.
pub trait CpuDriver {
    /// Called on [`Event::CpuTick`].
    fn tick(&mut self, core: CoreId, fabric: &mut Fabric) -> Result<(), SimError>;

    /// A response to one of the driver's requests.
    fn recv_response(&mut self, core: CoreId, fabric: &mut Fabric, pkt: Packet) -> Result<(), SimError>;

    /// The crossbar or memory may accept a refused request now.
    fn recv_retry(&mut self, core: CoreId, fabric: &mut Fabric) -> Result<(), SimError>;
}

/// A fabric with traffic generators attached to some of its tiles.
pub struct System<D: CpuDriver> {
    pub fabric: Fabric,
    drivers: Vec<Option<D>>,
}

impl<D: CpuDriver> System<D> {
    pub fn new(fabric: Fabric) -> Self {
        let drivers = (0..fabric.tiles().len()).map(|_| None).collect();
        Self { fabric, drivers }
    }

    /// Attach `driver` to tile `core`. It gets its first tick right away.
    pub fn attach(&mut self, core: CoreId, driver: D) -> Result<(), SimError> {
        let slot = self.drivers.get_mut(core as usize).ok_or(SimError::UnknownTile(core))?;
        *slot = Some(driver);
        self.fabric.schedule_tick(core, 0);
        Ok(())
    }

    pub fn driver(&self, core: CoreId) -> Option<&D> {
        self.drivers.get(core as usize).and_then(Option::as_ref)
    }

    /// Run until no events are left or the tick limit is reached. Returns
    /// the tick of the last event.
    pub fn run(&mut self) -> Result<Tick, SimError> {
        let max_ticks = self.fabric.config().system.max_ticks;
        while let Some(next) = self.fabric.next_event_time() {
            if max_ticks > 0 && next > max_ticks {
                log::warn!("Stopping at tick {}: limit of {} ticks reached", self.fabric.now(), max_ticks);
                break;
            }

            let (core, event) = match self.fabric.step()? {
                Step::Cpu(core, event) => (core, event),
                Step::Handled | Step::Empty => continue,
            };
            let Some(driver) = self.drivers.get_mut(core as usize).and_then(Option::as_mut) else {
                log::trace!("No driver on tile {}, dropping {:?}", core, event);
                continue;
            };
            match event {
                CpuEvent::Tick => driver.tick(core, &mut self.fabric)?,
                CpuEvent::Response(pkt) => driver.recv_response(core, &mut self.fabric, pkt)?,
                CpuEvent::Retry => driver.recv_retry(core, &mut self.fabric)?,
            }
        }
        Ok(self.fabric.now())
    }
}
