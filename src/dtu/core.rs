//! Command dispatch and packet bookkeeping of the DTU.

use super::mem_unit::MemUnit;
use super::msg_unit::MsgUnit;
use super::xfer_unit::XferUnit;
use super::{
    AccessDenied, CmdReg, Command, CommandOpcode, DtuCtx, DtuError, DtuEvent, DtuReg, DtuStats, EpReg, MemCmd,
    MemFlags, MemReqKind, MemSenderState, NocAddr, NocPacketType, NocSenderState, Packet, RegFile, SenderState,
};
use crate::config::DtuConfig;
use crate::sim::{Addr, Clock, CoreId, Cycles, Delivery, Event, MasterId, PortRef, RetrySlot, Tick};

/// Outcome of a cache-side request at the DTU.
#[derive(Debug)]
pub enum CacheAdmission {
    /// Sent over the NoC; the response follows later.
    Forwarded,
    /// Consumed without a response.
    Dropped,
    /// Not accepted; the caller has to answer the requester.
    Refused(Packet),
}

/// A Data Transfer Unit.
pub struct Dtu {
    name: String,
    core_id: CoreId,
    master_id: MasterId,
    pub(super) config: DtuConfig,
    atomic: bool,
    clock: Clock,
    pub(super) regs: RegFile,
    cmd_in_flight: bool,
    /// A COMMAND write whose dispatch is scheduled but has not run yet.
    dispatch_pending: bool,
    pub(super) xfer: XferUnit,
    pub(super) msg: MsgUnit,
    pub(super) mem: MemUnit,
    noc_retry: RetrySlot,
    mem_retry: RetrySlot,
    pub(super) stats: DtuStats,
}

impl Dtu {
    /// Create a DTU. The memory endpoint is preconfigured from `config`.
    pub fn new(
        name: impl Into<String>,
        core_id: CoreId,
        config: DtuConfig,
        master_id: MasterId,
        atomic: bool,
        clock: Clock,
    ) -> Self {
        let name = name.into();
        let mut regs = RegFile::new(format!("{}.regFile", name), config.num_endpoints);

        let mem_ep = config.memory_ep;
        regs.set_ep(mem_ep, EpReg::TgtCoreId, u64::from(config.memory_pe));
        regs.set_ep(mem_ep, EpReg::ReqRemAddr, config.memory_offset);
        regs.set_ep(mem_ep, EpReg::ReqRemSize, config.memory_size);
        regs.set_ep(mem_ep, EpReg::ReqFlags, (MemFlags::READ | MemFlags::WRITE).bits());

        Self {
            xfer: XferUnit::new(config.block_size, config.buf_count, config.buf_size),
            msg: MsgUnit::new(config.num_endpoints),
            mem: MemUnit::default(),
            name,
            core_id,
            master_id,
            config,
            atomic,
            clock,
            regs,
            cmd_in_flight: false,
            dispatch_pending: false,
            noc_retry: RetrySlot::new(),
            mem_retry: RetrySlot::new(),
            stats: DtuStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core_id(&self) -> CoreId {
        self.core_id
    }

    pub fn master_id(&self) -> MasterId {
        self.master_id
    }

    pub fn config(&self) -> &DtuConfig {
        &self.config
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn regs(&self) -> &RegFile {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut RegFile {
        &mut self.regs
    }

    pub fn stats(&self) -> &DtuStats {
        &self.stats
    }

    pub fn is_command_in_flight(&self) -> bool {
        self.cmd_in_flight
    }

    /// Whether nothing is in flight or waiting inside the DTU.
    pub fn is_idle(&self) -> bool {
        !self.cmd_in_flight
            && !self.dispatch_pending
            && !self.noc_retry.is_blocked()
            && !self.mem_retry.is_blocked()
            && self.xfer.is_idle()
    }

    /// Start of the register window.
    pub fn reg_file_base(&self) -> Addr {
        self.config.reg_file_base_addr
    }

    /// Whether `addr` lies in the register window.
    pub fn is_reg_addr(&self, addr: Addr) -> bool {
        let base = self.config.reg_file_base_addr;
        addr >= base && addr - base < self.regs.size()
    }

    pub(super) fn clock_edge(&self, ctx: &DtuCtx<'_>, cycles: Cycles) -> Tick {
        self.clock.clock_edge(ctx.queue.now(), cycles)
    }

    fn schedule(&self, ctx: &mut DtuCtx<'_>, when: Tick, event: DtuEvent) {
        ctx.queue.schedule(when, Event::Dtu(self.core_id, event));
    }

    /// Handle an event addressed to this DTU.
    pub fn handle_event(&mut self, ctx: &mut DtuCtx<'_>, event: DtuEvent) -> Result<(), DtuError> {
        match event {
            DtuEvent::ExecuteCommand => self.execute_command(ctx),
            DtuEvent::IssueMemRequest(pkt) => self.issue_mem_request(ctx, pkt),
            DtuEvent::IssueNocRequest(pkt) => self.issue_noc_request(ctx, pkt),
            DtuEvent::MemResponse(pkt) => self.complete_mem_request(ctx, pkt),
            DtuEvent::NocRequest(pkt) => self.handle_noc_request(ctx, pkt),
            DtuEvent::NocResponse(pkt) => match self.complete_noc_request(ctx, pkt)? {
                Some(pkt) => Err(DtuError::UnexpectedPacket {
                    what: "functional response on the timing path",
                    addr: pkt.addr(),
                }),
                None => Ok(()),
            },
        }
    }

    /// Decode the COMMAND register.
    pub fn current_command(&self) -> Result<Command, DtuError> {
        Command::decode(self.regs.get_cmd(CmdReg::Command), self.config.num_cmd_epid_bits)
    }

    /// Start the command in the COMMAND register.
    pub fn execute_command(&mut self, ctx: &mut DtuCtx<'_>) -> Result<(), DtuError> {
        self.dispatch_pending = false;
        let cmd = self.current_command()?;
        if cmd.opcode == CommandOpcode::Idle {
            return Ok(());
        }

        if self.cmd_in_flight {
            return Err(DtuError::CommandInFlight {
                opcode: cmd.opcode.name(),
                ep: cmd.ep_id,
            });
        }
        if cmd.ep_id >= self.config.num_endpoints {
            return Err(DtuError::InvalidEndpoint {
                opcode: cmd.opcode.name(),
                ep: cmd.ep_id,
            });
        }

        self.cmd_in_flight = true;
        self.stats.commands += 1;

        log::debug!("{}: Starting command {}", self.name, cmd);

        match cmd.opcode {
            CommandOpcode::Send => self.start_send(ctx, cmd),
            CommandOpcode::Reply => self.start_reply(ctx, cmd),
            CommandOpcode::Read => self.start_read(ctx, cmd),
            CommandOpcode::Write => self.start_write(ctx, cmd),
            CommandOpcode::IncReadPtr => {
                self.increment_read_ptr(ctx, cmd.ep_id)?;
                self.finish_command()
            }
            CommandOpcode::WakeupCore => {
                self.wakeup_core(ctx);
                self.finish_command()
            }
            CommandOpcode::Idle => Ok(()),
        }
    }

    /// Clear the COMMAND register and accept the next command.
    pub fn finish_command(&mut self) -> Result<(), DtuError> {
        if !self.cmd_in_flight {
            return Err(DtuError::NoCommandInFlight);
        }

        match self.current_command() {
            Ok(cmd) => log::debug!("{}: Finished command {}", self.name, cmd),
            Err(_) => log::debug!("{}: Finished command", self.name),
        }

        self.regs.set_cmd(CmdReg::Command, 0);
        self.cmd_in_flight = false;
        Ok(())
    }

    pub(super) fn wakeup_core(&mut self, ctx: &mut DtuCtx<'_>) {
        if ctx.core.is_suspended() {
            log::debug!("{}: Waking up core", self.name);
            ctx.core.activate();
        }
    }

    /// Deny suspension of the core while messages are pending.
    pub(super) fn update_suspendable_pin(&mut self, ctx: &mut DtuCtx<'_>) {
        let pending = self.regs.get_dtu(DtuReg::MsgCnt) > 0;
        let had_pending = ctx.core.deny_suspend();
        ctx.core.set_deny_suspend(pending);
        if had_pending && !pending {
            log::debug!("{}: Core can be suspended", self.name);
        }
    }

    /// Check an access of `size` bytes at `addr` through the memory endpoint `ep`.
    pub fn check_access(&self, ep: usize, is_write: bool, addr: Addr, size: u64) -> Result<(), AccessDenied> {
        let flags = MemFlags::from_bits_truncate(self.regs.get_ep(ep, EpReg::ReqFlags));
        let required = if is_write { MemFlags::WRITE } else { MemFlags::READ };
        if !flags.contains(required) {
            return Err(AccessDenied::Permission);
        }

        let limit = self.regs.get_ep(ep, EpReg::ReqRemSize);
        match addr.checked_add(size) {
            Some(end) if end > addr && end <= limit => Ok(()),
            _ => Err(AccessDenied::OutOfBounds { limit }),
        }
    }

    /// Remote address of an access of `size` bytes at `addr` through `ep`.
    /// The whole range has to be addressable over the NoC.
    pub fn remote_range(&self, ep: usize, addr: Addr, size: u64) -> Result<Addr, AccessDenied> {
        let base = self.regs.get_ep(ep, EpReg::ReqRemAddr);
        base.checked_add(addr)
            .filter(|&start| NocAddr::fits(start, size))
            .ok_or(AccessDenied::Unaddressable { base, offset: addr })
    }

    // #region Local memory port

    /// Tag and send a request to local memory.
    pub(super) fn send_mem_request(
        &mut self,
        ctx: &mut DtuCtx<'_>,
        mut pkt: Packet,
        ep_id: usize,
        kind: MemReqKind,
        delay: Cycles,
    ) -> Result<(), DtuError> {
        pkt.push_sender_state(SenderState::Mem(MemSenderState {
            ep_id,
            requester: pkt.requester(),
            kind,
        }));

        // Memory attributes the access to us, not to a requester in another tile
        pkt.set_requester(self.master_id);

        if self.atomic {
            ctx.mem.send_atomic(&mut pkt);
            self.complete_mem_request(ctx, pkt)
        } else {
            let when = self.clock_edge(ctx, delay);
            self.schedule(ctx, when, DtuEvent::IssueMemRequest(pkt));
            Ok(())
        }
    }

    fn issue_mem_request(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet) -> Result<(), DtuError> {
        if self.mem_retry.is_blocked() {
            log::trace!("{}: memory port blocked, deferring request @ {:#x}", self.name, pkt.addr());
            self.mem_retry.defer(pkt);
            return Ok(());
        }
        self.try_send_mem(ctx, pkt).map(|_| ())
    }

    fn try_send_mem(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet) -> Result<bool, DtuError> {
        match ctx.mem.send_timing_req(pkt, PortRef::DtuMem(self.core_id), ctx.queue) {
            Delivery::Accepted => Ok(true),
            Delivery::Refused(pkt) => {
                log::trace!("{}: memory request @ {:#x} refused", self.name, pkt.addr());
                self.stats.mem_retries += 1;
                self.mem_retry
                    .hold(pkt)
                    .map_err(|_| DtuError::RetryAlreadyPending { port: "memory" })?;
                Ok(false)
            }
        }
    }

    /// The memory port may be used again.
    pub fn recv_mem_retry(&mut self, ctx: &mut DtuCtx<'_>) -> Result<(), DtuError> {
        let Some(pkt) = self.mem_retry.take_held() else {
            log::warn!("{}: spurious memory retry", self.name);
            return Ok(());
        };
        if !self.try_send_mem(ctx, pkt)? {
            return Ok(());
        }
        while let Some(pkt) = self.mem_retry.next_waiting() {
            if !self.try_send_mem(ctx, pkt)? {
                break;
            }
        }
        Ok(())
    }

    /// A local memory request completed.
    pub fn complete_mem_request(&mut self, ctx: &mut DtuCtx<'_>, mut pkt: Packet) -> Result<(), DtuError> {
        if !pkt.is_response() {
            return Err(DtuError::UnexpectedPacket {
                what: "memory request on the response path",
                addr: pkt.addr(),
            });
        }

        let state = pkt.pop_mem_state()?;
        pkt.set_requester(state.requester);

        if pkt.is_error() {
            log::warn!(
                "{}: local {} @ {:#x}:{} failed",
                self.name,
                if pkt.is_read() { "read" } else { "write" },
                pkt.addr(),
                pkt.size()
            );
        }

        match state.kind {
            MemReqKind::Transfer(buf) => self.recv_mem_response(ctx, buf, pkt),
            MemReqKind::Header => {
                let cmd = self.current_command()?;
                self.recv_from_mem(ctx, cmd, pkt)
            }
        }
    }

    // #endregion

    // #region NoC port

    /// Tag and send a request over the NoC.
    pub(super) fn send_noc_request(
        &mut self,
        ctx: &mut DtuCtx<'_>,
        packet_type: NocPacketType,
        mut pkt: Packet,
        delay: Cycles,
        functional: bool,
    ) -> Result<(), DtuError> {
        log::trace!(
            "{}: {} to {} ({} bytes)",
            self.name,
            packet_type.name(),
            NocAddr::from_raw(pkt.addr()),
            pkt.size()
        );

        pkt.push_sender_state(SenderState::Noc(NocSenderState { packet_type }));

        if functional {
            ctx.noc.send_functional_req(pkt, self.core_id);
        } else if self.atomic {
            ctx.noc.send_atomic_req(pkt, self.core_id, ctx.queue);
        } else {
            let when = self.clock_edge(ctx, delay);
            self.schedule(ctx, when, DtuEvent::IssueNocRequest(pkt));
        }
        Ok(())
    }

    fn issue_noc_request(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet) -> Result<(), DtuError> {
        if self.noc_retry.is_blocked() {
            log::trace!("{}: NoC port blocked, deferring request @ {:#x}", self.name, pkt.addr());
            self.noc_retry.defer(pkt);
            return Ok(());
        }
        self.try_send_noc(ctx, pkt).map(|_| ())
    }

    fn try_send_noc(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet) -> Result<bool, DtuError> {
        match ctx.noc.send_timing_req(pkt, self.core_id, ctx.queue) {
            Delivery::Accepted => Ok(true),
            Delivery::Refused(pkt) => {
                log::debug!("{}: NoC request to {} refused", self.name, NocAddr::from_raw(pkt.addr()));
                self.stats.noc_retries += 1;
                self.noc_retry
                    .hold(pkt)
                    .map_err(|_| DtuError::RetryAlreadyPending { port: "NoC" })?;
                Ok(false)
            }
        }
    }

    /// The NoC port may be used again.
    pub fn recv_noc_retry(&mut self, ctx: &mut DtuCtx<'_>) -> Result<(), DtuError> {
        let Some(pkt) = self.noc_retry.take_held() else {
            log::warn!("{}: spurious NoC retry", self.name);
            return Ok(());
        };
        if !self.try_send_noc(ctx, pkt)? {
            return Ok(());
        }
        log::trace!("{}: NoC request sent after retry", self.name);
        while let Some(pkt) = self.noc_retry.next_waiting() {
            if !self.try_send_noc(ctx, pkt)? {
                break;
            }
        }
        Ok(())
    }

    /// Answer a request received over the NoC.
    pub(super) fn send_noc_response(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet, delay: Cycles) {
        if self.atomic {
            ctx.noc.send_atomic_resp(pkt, ctx.queue);
        } else {
            let when = self.clock_edge(ctx, delay);
            ctx.noc.send_timing_resp(pkt, when, ctx.queue);
        }
    }

    /// Answer a NoC request with an error.
    pub(super) fn refuse_noc_request(&mut self, ctx: &mut DtuCtx<'_>, mut pkt: Packet) {
        pkt.make_error_response();
        self.send_noc_response(ctx, pkt, 1);
    }

    /// A NoC request of ours got its response.
    ///
    /// Returns the response of a functional cache request, which goes back to
    /// the functional caller instead of through the event queue.
    pub fn complete_noc_request(&mut self, ctx: &mut DtuCtx<'_>, mut pkt: Packet) -> Result<Option<Packet>, DtuError> {
        let state = pkt.pop_noc_state()?;

        match state.packet_type {
            NocPacketType::CacheMemReq | NocPacketType::CacheMemReqFunc => {
                let target_addr = self.regs.get_ep(self.config.memory_ep, EpReg::ReqRemAddr);
                let local_addr = NocAddr::from_raw(pkt.addr()).offset.wrapping_sub(target_addr);
                pkt.set_addr(local_addr);

                if state.packet_type == NocPacketType::CacheMemReqFunc {
                    return Ok(Some(pkt));
                }
                let now = ctx.queue.now();
                ctx.queue.schedule(now, Event::CpuResponse(self.core_id, pkt));
                Ok(None)
            }
            _ => {
                if pkt.is_write() {
                    self.write_complete(ctx, pkt)?;
                } else if pkt.is_read() {
                    self.read_complete(ctx, pkt)?;
                } else {
                    return Err(DtuError::UnexpectedPacket {
                        what: "NoC response",
                        addr: pkt.addr(),
                    });
                }
                Ok(None)
            }
        }
    }

    /// A request from another DTU arrived.
    pub fn handle_noc_request(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet) -> Result<(), DtuError> {
        let state = pkt.peek_noc_state()?;

        log::trace!(
            "{}: received {} @ {} ({} bytes)",
            self.name,
            state.packet_type.name(),
            NocAddr::from_raw(pkt.addr()),
            pkt.size()
        );

        match state.packet_type {
            NocPacketType::Message => self.recv_message_from_noc(ctx, pkt),
            NocPacketType::ReadReq | NocPacketType::WriteReq | NocPacketType::CacheMemReq => {
                self.recv_access_from_noc(ctx, pkt)
            }
            NocPacketType::CacheMemReqFunc => self.recv_functional_from_noc(ctx, pkt),
        }
    }

    // #endregion

    // #region CPU side

    /// A request from the CPU to the register window.
    pub fn handle_cpu_request(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet) -> Result<(), DtuError> {
        self.forward_request_to_reg_file(ctx, pkt, true)
    }

    /// Apply a register request without timing and without starting commands.
    pub fn handle_functional_reg_request(&mut self, pkt: &mut Packet) {
        let old_addr = pkt.addr();
        pkt.set_addr(old_addr.wrapping_sub(self.config.reg_file_base_addr));
        if let Err(e) = self.regs.handle_request(pkt, true) {
            log::debug!("{}: functional {}", self.name, e);
            pkt.make_error_response();
        }
        pkt.set_addr(old_addr);
    }

    /// A cache-side request that has to be bridged to the memory endpoint.
    pub fn handle_cache_mem_request(
        &mut self,
        ctx: &mut DtuCtx<'_>,
        mut pkt: Packet,
        functional: bool,
    ) -> Result<CacheAdmission, DtuError> {
        match pkt.cmd() {
            MemCmd::CleanEvict => {
                log::trace!("{}: Dropping CleanEvict packet", self.name);
                return Ok(CacheAdmission::Dropped);
            }
            // No coherence, so there is nothing to invalidate
            MemCmd::InvalidateReq => return Ok(CacheAdmission::Refused(pkt)),
            _ => {}
        }

        let ep = self.config.memory_ep;
        let size = pkt.size() as u64;
        let admitted = self
            .check_access(ep, pkt.is_write(), pkt.addr(), size)
            .and_then(|()| self.remote_range(ep, pkt.addr(), size));
        let remote_addr = match admitted {
            Ok(addr) => addr,
            Err(reason) => {
                log::debug!(
                    "{}: Denying {} request @ {:#x}:{}: {}",
                    self.name,
                    if pkt.is_read() { "read" } else { "write" },
                    pkt.addr(),
                    pkt.size(),
                    reason
                );
                self.stats.refused_accesses += 1;
                return Ok(CacheAdmission::Refused(pkt));
            }
        };

        let target_core = self.regs.get_ep(ep, EpReg::TgtCoreId) as CoreId;
        pkt.set_addr(NocAddr::new(target_core, 0, remote_addr).raw());

        let packet_type = if functional {
            NocPacketType::CacheMemReqFunc
        } else {
            NocPacketType::CacheMemReq
        };
        self.send_noc_request(ctx, packet_type, pkt, 1, functional)?;
        Ok(CacheAdmission::Forwarded)
    }

    /// Apply a register access from the CPU or from a remote DTU and respond.
    pub(super) fn forward_request_to_reg_file(
        &mut self,
        ctx: &mut DtuCtx<'_>,
        mut pkt: Packet,
        is_cpu_request: bool,
    ) -> Result<(), DtuError> {
        let old_addr = pkt.addr();
        let offset = old_addr.wrapping_sub(self.config.reg_file_base_addr);

        // A command is busy from its COMMAND write until finish_command
        let busy = self.cmd_in_flight || self.dispatch_pending;
        if busy && pkt.is_write() && RegFile::covers_command(offset, pkt.size()) {
            let written = self.written_command(offset, &pkt);
            return Err(DtuError::CommandInFlight {
                opcode: written.map_or("command", |c| c.opcode.name()),
                ep: written.map_or(0, |c| c.ep_id),
            });
        }

        // Handle the request relative to the register window
        pkt.set_addr(offset);
        let command_written = match self.regs.handle_request(&mut pkt, is_cpu_request) {
            Ok(written) => written,
            Err(e) => {
                log::debug!("{}: {}", self.name, e);
                pkt.make_error_response();
                false
            }
        };
        pkt.set_addr(old_addr);

        self.update_suspendable_pin(ctx);

        if !self.atomic {
            // The access itself is immediate; its latency is paid by
            // delaying the response and the command execution.
            let transport_delay = self.clock.ticks_to_cycles(pkt.header_delay + pkt.payload_delay);
            let when = self.clock_edge(ctx, transport_delay + self.config.register_access_latency);

            pkt.header_delay = 0;
            pkt.payload_delay = 0;

            if is_cpu_request {
                ctx.queue.schedule(when, Event::CpuResponse(self.core_id, pkt));
            } else {
                ctx.noc.send_timing_resp(pkt, when, ctx.queue);
            }

            if command_written {
                self.dispatch_pending = true;
                self.schedule(ctx, when, DtuEvent::ExecuteCommand);
            }
        } else {
            if is_cpu_request {
                let now = ctx.queue.now();
                ctx.queue.schedule(now, Event::CpuResponse(self.core_id, pkt));
            } else {
                ctx.noc.send_atomic_resp(pkt, ctx.queue);
            }

            if command_written {
                self.execute_command(ctx)?;
            }
        }
        Ok(())
    }

    /// The command a write at `offset` would put into the COMMAND register.
    fn written_command(&self, offset: Addr, pkt: &Packet) -> Option<Command> {
        let cmd_offset = RegFile::offset_of(super::Register::Cmd(CmdReg::Command));
        let start = cmd_offset.checked_sub(offset)? as usize;
        let bytes = pkt.data().get(start..start + super::regfile::REG_SIZE)?;
        let value = u64::from_le_bytes(bytes.try_into().ok()?);
        Command::decode(value, self.config.num_cmd_epid_bits).ok()
    }

    // #endregion

    /// Human-readable register and unit state.
    pub fn dump_state(&self) -> String {
        let mut out = format!(
            "{} (core {}, {} mode, command {})\n",
            self.name,
            self.core_id,
            if self.atomic { "atomic" } else { "timing" },
            if self.cmd_in_flight { "in flight" } else { "idle" }
        );
        out.push_str(&self.regs.dump());
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dtu::{Register, HEADER_SIZE};
    use crate::sim::{CoreControl, CoreState, EventQueue, NocFabric, Scratchpad};

    /// A single DTU with its own collaborators. NoC traffic addressed to
    /// tile 0 loops back to this DTU.
    pub(crate) struct Harness {
        pub dtu: Dtu,
        pub queue: EventQueue,
        pub mem: Scratchpad,
        pub noc: NocFabric,
        pub core: CoreState,
        pub cpu_responses: Vec<Packet>,
    }

    impl Harness {
        pub fn new(atomic: bool) -> Self {
            let config = DtuConfig {
                memory_pe: 0,
                ..Default::default()
            };
            let clock = Clock::new(1000);
            Self {
                dtu: Dtu::new("dtu0", 0, config, MasterId(0), atomic, clock),
                queue: EventQueue::new(),
                mem: Scratchpad::new("mem0", 0x10_0000, clock.cycles_to_ticks(2), clock.period()),
                noc: NocFabric::new(1, clock, 4, 16),
                core: CoreState::new(),
                cpu_responses: Vec::new(),
            }
        }

        pub fn with<R>(&mut self, f: impl FnOnce(&mut Dtu, &mut DtuCtx<'_>) -> R) -> R {
            let mut ctx = DtuCtx {
                queue: &mut self.queue,
                mem: &mut self.mem,
                noc: &mut self.noc,
                core: &mut self.core,
            };
            f(&mut self.dtu, &mut ctx)
        }

        pub fn write_reg(&mut self, reg: Register, value: u64) -> Result<(), DtuError> {
            let addr = self.dtu.reg_file_base() + RegFile::offset_of(reg);
            let pkt = Packet::write(addr, value.to_le_bytes().to_vec(), MasterId(1));
            self.with(|dtu, ctx| dtu.handle_cpu_request(ctx, pkt))
        }

        pub fn command(&mut self, opcode: CommandOpcode, ep: usize) -> Result<(), DtuError> {
            self.write_reg(Register::Cmd(CmdReg::Command), Command::encode(opcode, ep))
        }

        /// Process events until the queue is empty.
        pub fn run(&mut self) -> Result<(), DtuError> {
            while let Some((_, event)) = self.queue.pop() {
                match event {
                    Event::Dtu(_, ev) => self.with(|dtu, ctx| dtu.handle_event(ctx, ev))?,
                    Event::Retry(PortRef::DtuMem(_)) => self.with(|dtu, ctx| dtu.recv_mem_retry(ctx))?,
                    Event::Retry(PortRef::DtuNoc(_)) => self.with(|dtu, ctx| dtu.recv_noc_retry(ctx))?,
                    Event::CpuResponse(_, pkt) => self.cpu_responses.push(pkt),
                    Event::Retry(PortRef::Cpu(_)) | Event::CpuTick(_) => {}
                }
            }
            Ok(())
        }

        /// Process events like [`Harness::run`] but drop the responses to our
        /// own NoC requests. Returns how many were dropped.
        pub fn run_without_acks(&mut self) -> Result<usize, DtuError> {
            let mut dropped = 0;
            while let Some((_, event)) = self.queue.pop() {
                match event {
                    Event::Dtu(_, DtuEvent::NocResponse(_)) => dropped += 1,
                    Event::Dtu(_, ev) => self.with(|dtu, ctx| dtu.handle_event(ctx, ev))?,
                    Event::Retry(PortRef::DtuMem(_)) => self.with(|dtu, ctx| dtu.recv_mem_retry(ctx))?,
                    Event::Retry(PortRef::DtuNoc(_)) => self.with(|dtu, ctx| dtu.recv_noc_retry(ctx))?,
                    _ => {}
                }
            }
            Ok(dropped)
        }

        /// Configure `ep` as a receive endpoint with `slots` slots of `slot_size` bytes.
        pub fn setup_recv_ep(&mut self, ep: usize, buf_addr: u64, slot_size: u64, slots: u64) {
            let regs = self.dtu.regs_mut();
            regs.set_ep(ep, EpReg::BufAddr, buf_addr);
            regs.set_ep(ep, EpReg::BufMsgSize, slot_size);
            regs.set_ep(ep, EpReg::BufSize, slots);
        }

        /// Configure `ep` as a send endpoint towards `tgt_ep` on tile 0.
        pub fn setup_send_ep(&mut self, ep: usize, tgt_ep: u64, label: u64) {
            let regs = self.dtu.regs_mut();
            regs.set_ep(ep, EpReg::TgtCoreId, 0);
            regs.set_ep(ep, EpReg::TgtEpId, tgt_ep);
            regs.set_ep(ep, EpReg::Label, label);
        }
    }

    fn both_modes(test: impl Fn(bool)) {
        test(true);
        test(false);
    }

    #[test]
    fn test_memory_ep_preset() {
        let h = Harness::new(false);
        let regs = h.dtu.regs();
        assert_eq!(regs.get_ep(7, EpReg::TgtCoreId), 0);
        assert_eq!(regs.get_ep(7, EpReg::ReqRemSize), 0x1000_0000);
        assert_eq!(regs.get_ep(7, EpReg::ReqFlags), 3);
    }

    #[test]
    fn test_check_access_bounds() {
        let mut h = Harness::new(true);
        h.dtu.regs_mut().set_ep(1, EpReg::ReqRemSize, 0x100);
        h.dtu.regs_mut().set_ep(1, EpReg::ReqFlags, MemFlags::READ.bits());

        assert_eq!(h.dtu.check_access(1, false, 0xF0, 0x10), Ok(()));
        assert_eq!(
            h.dtu.check_access(1, false, 0xF0, 0x11),
            Err(AccessDenied::OutOfBounds { limit: 0x100 })
        );
        assert!(h.dtu.check_access(1, false, u64::MAX, 2).is_err());
        assert!(h.dtu.check_access(1, false, 0x10, 0).is_err());
        assert_eq!(h.dtu.check_access(1, true, 0, 8), Err(AccessDenied::Permission));

        // Decisions do not change state
        assert_eq!(h.dtu.check_access(1, false, 0xF0, 0x10), Ok(()));
        assert_eq!(h.dtu.stats().refused_accesses, 0);
    }

    #[test]
    fn test_idle_command_is_noop() {
        let mut h = Harness::new(true);
        h.command(CommandOpcode::Idle, 0).unwrap();
        assert!(!h.dtu.is_command_in_flight());
        assert_eq!(h.dtu.stats().commands, 0);
    }

    #[test]
    fn test_invalid_opcode_fails() {
        let mut h = Harness::new(true);
        let result = h.write_reg(Register::Cmd(CmdReg::Command), 7 | 1 << 3);
        assert_eq!(result, Err(DtuError::InvalidOpcode { raw: 7, ep: 1 }));
    }

    #[test]
    fn test_invalid_endpoint_fails() {
        let mut h = Harness::new(true);
        let result = h.command(CommandOpcode::WakeupCore, 8);
        assert!(matches!(result, Err(DtuError::InvalidEndpoint { ep: 8, .. })));
    }

    #[test]
    fn test_command_while_in_flight_fails() {
        let mut h = Harness::new(false);
        h.setup_send_ep(0, 1, 0);
        h.setup_recv_ep(1, 0x1000, 64, 4);
        h.write_reg(Register::Cmd(CmdReg::DataSize), 8).unwrap();
        h.command(CommandOpcode::Send, 0).unwrap();

        // Execute the SEND but stop before it completes
        while !h.dtu.is_command_in_flight() {
            let (_, event) = h.queue.pop().unwrap();
            if let Event::Dtu(_, ev) = event {
                h.with(|dtu, ctx| dtu.handle_event(ctx, ev)).unwrap();
            }
        }

        let before = h.dtu.regs().get_cmd(CmdReg::Command);
        let result = h.command(CommandOpcode::IncReadPtr, 1);
        assert_eq!(
            result,
            Err(DtuError::CommandInFlight {
                opcode: "INC_READ_PTR",
                ep: 1
            })
        );
        assert_eq!(h.dtu.regs().get_cmd(CmdReg::Command), before);
    }

    #[test]
    fn test_command_before_dispatch_fails() {
        let mut h = Harness::new(false);
        h.setup_send_ep(0, 1, 0);
        h.setup_recv_ep(1, 0x1000, 64, 4);
        h.write_reg(Register::Cmd(CmdReg::DataSize), 8).unwrap();
        h.command(CommandOpcode::Send, 0).unwrap();

        // The SEND is not dispatched yet, but it owns the COMMAND register
        assert!(!h.dtu.is_command_in_flight());
        assert!(!h.dtu.is_idle());
        let result = h.command(CommandOpcode::WakeupCore, 0);
        assert_eq!(
            result,
            Err(DtuError::CommandInFlight {
                opcode: "WAKEUP_CORE",
                ep: 0
            })
        );
        assert_eq!(
            h.dtu.regs().get_cmd(CmdReg::Command),
            Command::encode(CommandOpcode::Send, 0)
        );

        h.run().unwrap();
        assert!(!h.dtu.is_command_in_flight());
        assert_eq!(h.dtu.stats().messages_sent, 1);
        assert_eq!(h.dtu.regs().get_ep(1, EpReg::BufMsgCnt), 1);
    }

    #[test]
    fn test_remote_command_write_while_in_flight_fails() {
        let mut h = Harness::new(false);
        h.setup_send_ep(0, 1, 0);
        h.setup_recv_ep(1, 0x1000, 64, 4);
        h.write_reg(Register::Cmd(CmdReg::DataSize), 16).unwrap();
        h.noc.set_blocked(0, true, &mut h.queue);
        h.command(CommandOpcode::Send, 0).unwrap();
        h.run().unwrap();
        assert!(h.dtu.is_command_in_flight());

        let cmd_addr = h.dtu.reg_file_base() + RegFile::offset_of(Register::Cmd(CmdReg::Command));
        let value = Command::encode(CommandOpcode::WakeupCore, 2);
        let mut pkt = Packet::write(NocAddr::new(0, 0, cmd_addr).raw(), value.to_le_bytes().to_vec(), MasterId(2));
        pkt.push_sender_state(SenderState::Noc(NocSenderState {
            packet_type: NocPacketType::WriteReq,
        }));

        let result = h.with(|dtu, ctx| dtu.handle_noc_request(ctx, pkt));
        assert_eq!(
            result,
            Err(DtuError::CommandInFlight {
                opcode: "WAKEUP_CORE",
                ep: 2
            })
        );
        assert_eq!(
            h.dtu.regs().get_cmd(CmdReg::Command),
            Command::encode(CommandOpcode::Send, 0)
        );
    }

    #[test]
    fn test_send_and_inc_read_ptr_round_trip() {
        both_modes(|atomic| {
            let mut h = Harness::new(atomic);
            h.setup_send_ep(0, 1, 0x1234);
            h.setup_recv_ep(1, 0x1000, 64, 2);
            h.mem.write_bytes(0x200, b"ping!!!!");

            h.write_reg(Register::Cmd(CmdReg::DataAddr), 0x200).unwrap();
            h.write_reg(Register::Cmd(CmdReg::DataSize), 8).unwrap();
            h.write_reg(Register::Cmd(CmdReg::ReplyLabel), 0x55).unwrap();
            h.command(CommandOpcode::Send, 0).unwrap();
            h.run().unwrap();

            assert!(!h.dtu.is_command_in_flight());
            let regs = h.dtu.regs();
            assert_eq!(regs.get_cmd(CmdReg::Command), 0);
            assert_eq!(regs.get_ep(1, EpReg::BufMsgCnt), 1);
            assert_eq!(regs.get_ep(1, EpReg::BufWrPtr), 1);
            assert_eq!(regs.get_dtu(DtuReg::MsgCnt), 1);
            assert!(h.core.deny_suspend());

            let slot = h.mem.read_bytes(0x1000, HEADER_SIZE + 8);
            let header = crate::dtu::MessageHeader::parse(&slot).unwrap();
            assert_eq!(header.label, 0x1234);
            assert_eq!(header.reply_label, 0x55);
            assert_eq!(header.length, 8);
            assert_eq!(&slot[HEADER_SIZE..], b"ping!!!!");

            h.command(CommandOpcode::IncReadPtr, 1).unwrap();
            h.run().unwrap();
            let regs = h.dtu.regs();
            assert_eq!(regs.get_ep(1, EpReg::BufMsgCnt), 0);
            assert_eq!(regs.get_ep(1, EpReg::BufRdPtr), 1);
            assert_eq!(regs.get_dtu(DtuReg::MsgCnt), 0);
            assert!(!h.core.deny_suspend());

            let result = h.command(CommandOpcode::IncReadPtr, 1).and_then(|_| h.run());
            assert_eq!(result, Err(DtuError::ReadPtrUnderflow { ep: 1 }));
        });
    }

    #[test]
    fn test_message_too_large() {
        let mut h = Harness::new(true);
        h.setup_send_ep(0, 1, 0);
        h.write_reg(Register::Cmd(CmdReg::DataSize), 1024).unwrap();
        let result = h.command(CommandOpcode::Send, 0);
        assert_eq!(
            result,
            Err(DtuError::MessageTooLarge {
                size: 1024 + HEADER_SIZE,
                max: 1024
            })
        );
    }

    #[test]
    fn test_full_ring_drops_message() {
        both_modes(|atomic| {
            let mut h = Harness::new(atomic);
            h.setup_send_ep(0, 1, 0);
            h.setup_recv_ep(1, 0x1000, 64, 1);
            h.write_reg(Register::Cmd(CmdReg::DataSize), 4).unwrap();

            for _ in 0..2 {
                h.command(CommandOpcode::Send, 0).unwrap();
                h.run().unwrap();
                assert!(!h.dtu.is_command_in_flight());
            }

            assert_eq!(h.dtu.regs().get_ep(1, EpReg::BufMsgCnt), 1);
            assert_eq!(h.dtu.stats().messages_dropped, 1);
            assert_eq!(h.dtu.stats().messages_received, 1);
        });
    }

    #[test]
    fn test_reply_without_message_fails() {
        let mut h = Harness::new(true);
        h.setup_recv_ep(1, 0x1000, 64, 2);
        let result = h.command(CommandOpcode::Reply, 1);
        assert_eq!(result, Err(DtuError::NoMessageToReply { ep: 1 }));
    }

    #[test]
    fn test_reply_reaches_reply_endpoint() {
        both_modes(|atomic| {
            let mut h = Harness::new(atomic);
            h.setup_send_ep(0, 1, 0xAA);
            h.setup_recv_ep(1, 0x1000, 64, 2);
            h.setup_recv_ep(2, 0x2000, 64, 2);

            h.mem.write_bytes(0x300, &[1, 2, 3, 4]);
            h.write_reg(Register::Cmd(CmdReg::DataAddr), 0x300).unwrap();
            h.write_reg(Register::Cmd(CmdReg::DataSize), 4).unwrap();
            h.write_reg(Register::Cmd(CmdReg::ReplyEpId), 2).unwrap();
            h.write_reg(Register::Cmd(CmdReg::ReplyLabel), 0xBB).unwrap();
            h.command(CommandOpcode::Send, 0).unwrap();
            h.run().unwrap();

            h.mem.write_bytes(0x400, &[9, 8]);
            h.write_reg(Register::Cmd(CmdReg::DataAddr), 0x400).unwrap();
            h.write_reg(Register::Cmd(CmdReg::DataSize), 2).unwrap();
            h.command(CommandOpcode::Reply, 1).unwrap();
            h.run().unwrap();

            let regs = h.dtu.regs();
            assert_eq!(regs.get_ep(2, EpReg::BufMsgCnt), 1);
            assert_eq!(regs.get_dtu(DtuReg::MsgCnt), 2);

            let slot = h.mem.read_bytes(0x2000, HEADER_SIZE + 2);
            let header = crate::dtu::MessageHeader::parse(&slot).unwrap();
            assert!(header.is_reply());
            assert_eq!(header.label, 0xBB);
            assert_eq!(header.sender_ep_id, 1);
            assert_eq!(&slot[HEADER_SIZE..], &[9, 8]);
            assert_eq!(h.dtu.stats().replies_sent, 1);
        });
    }

    #[test]
    fn test_remote_read_and_write() {
        both_modes(|atomic| {
            let mut h = Harness::new(atomic);
            {
                let regs = h.dtu.regs_mut();
                regs.set_ep(3, EpReg::TgtCoreId, 0);
                regs.set_ep(3, EpReg::ReqRemAddr, 0x8000);
                regs.set_ep(3, EpReg::ReqRemSize, 0x4000);
                regs.set_ep(3, EpReg::ReqFlags, (MemFlags::READ | MemFlags::WRITE).bits());
            }

            // Larger than one NoC packet and not block aligned
            let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
            h.mem.write_bytes(0x8010, &data);

            h.write_reg(Register::Cmd(CmdReg::DataAddr), 0x20).unwrap();
            h.write_reg(Register::Cmd(CmdReg::DataSize), data.len() as u64).unwrap();
            h.write_reg(Register::Cmd(CmdReg::Offset), 0x10).unwrap();
            h.command(CommandOpcode::Read, 3).unwrap();
            h.run().unwrap();
            assert!(!h.dtu.is_command_in_flight());
            assert_eq!(h.mem.read_bytes(0x20, data.len()), data);

            h.write_reg(Register::Cmd(CmdReg::Offset), 0x2000).unwrap();
            h.command(CommandOpcode::Write, 3).unwrap();
            h.run().unwrap();
            assert!(!h.dtu.is_command_in_flight());
            assert_eq!(h.mem.read_bytes(0xA000, data.len()), data);
            assert!(h.dtu.is_idle());
        });
    }

    #[test]
    fn test_refused_remote_access_finishes_without_data() {
        both_modes(|atomic| {
            let mut h = Harness::new(atomic);
            {
                let regs = h.dtu.regs_mut();
                regs.set_ep(3, EpReg::ReqRemSize, 0x100);
                regs.set_ep(3, EpReg::ReqFlags, MemFlags::READ.bits());
            }
            h.mem.write_bytes(0, &[0xFF; 8]);

            h.write_reg(Register::Cmd(CmdReg::DataSize), 8).unwrap();
            h.write_reg(Register::Cmd(CmdReg::DataAddr), 0x500).unwrap();
            h.command(CommandOpcode::Write, 3).unwrap();
            h.run().unwrap();
            assert!(!h.dtu.is_command_in_flight());

            h.write_reg(Register::Cmd(CmdReg::Offset), 0xFC).unwrap();
            h.command(CommandOpcode::Read, 3).unwrap();
            h.run().unwrap();
            assert!(!h.dtu.is_command_in_flight());
            assert_eq!(h.mem.read_bytes(0x500, 8), vec![0; 8]);
            assert_eq!(h.dtu.stats().refused_accesses, 2);
        });
    }

    #[test]
    fn test_blocked_noc_keeps_command_in_flight() {
        let mut h = Harness::new(false);
        h.setup_send_ep(0, 1, 0);
        h.setup_recv_ep(1, 0x1000, 64, 4);
        h.write_reg(Register::Cmd(CmdReg::DataSize), 16).unwrap();

        h.noc.set_blocked(0, true, &mut h.queue);
        h.command(CommandOpcode::Send, 0).unwrap();
        h.run().unwrap();

        assert!(h.dtu.is_command_in_flight());
        assert!(!h.dtu.is_idle());
        assert_eq!(h.dtu.stats().noc_retries, 1);
        assert_eq!(h.dtu.regs().get_ep(1, EpReg::BufMsgCnt), 0);

        h.noc.set_blocked(0, false, &mut h.queue);
        h.run().unwrap();

        assert!(!h.dtu.is_command_in_flight());
        assert_eq!(h.dtu.regs().get_ep(1, EpReg::BufMsgCnt), 1);
    }

    #[test]
    fn test_wakeup_core_command() {
        let mut h = Harness::new(true);
        assert!(h.core.suspend());
        h.command(CommandOpcode::WakeupCore, 0).unwrap();
        assert!(!h.core.is_suspended());
        assert!(!h.dtu.is_command_in_flight());
    }

    #[test]
    fn test_message_arrival_wakes_core() {
        let mut h = Harness::new(true);
        h.setup_send_ep(0, 1, 0);
        h.setup_recv_ep(1, 0x1000, 64, 4);
        h.write_reg(Register::Cmd(CmdReg::DataSize), 4).unwrap();
        h.command(CommandOpcode::Send, 0).unwrap();

        assert!(h.core.suspend());
        h.run().unwrap();
        assert!(!h.core.is_suspended());
        assert!(h.core.deny_suspend());
        assert!(!h.core.suspend());
    }

    #[test]
    fn test_cache_requests() {
        let mut h = Harness::new(true);

        let evict = Packet::new(0, 64, MemCmd::CleanEvict, MasterId(1));
        let admission = h.with(|dtu, ctx| dtu.handle_cache_mem_request(ctx, evict, false)).unwrap();
        assert!(matches!(admission, CacheAdmission::Dropped));

        let inval = Packet::new(0, 64, MemCmd::InvalidateReq, MasterId(1));
        let admission = h.with(|dtu, ctx| dtu.handle_cache_mem_request(ctx, inval, false)).unwrap();
        assert!(matches!(admission, CacheAdmission::Refused(_)));

        let oob = Packet::read(0x1000_0000, 1, MasterId(1));
        let admission = h.with(|dtu, ctx| dtu.handle_cache_mem_request(ctx, oob, false)).unwrap();
        assert!(matches!(admission, CacheAdmission::Refused(_)));

        h.mem.write_bytes(0x40, &[0x77]);
        h.dtu.regs_mut().set_ep(7, EpReg::ReqRemAddr, u64::MAX - 0x10);
        let wrapping = Packet::read(0x40, 1, MasterId(1));
        let admission = h.with(|dtu, ctx| dtu.handle_cache_mem_request(ctx, wrapping, false)).unwrap();
        assert!(matches!(admission, CacheAdmission::Refused(_)));
        assert_eq!(h.dtu.stats().refused_accesses, 2);
        assert!(h.queue.is_empty());

        h.dtu.regs_mut().set_ep(7, EpReg::ReqRemAddr, 0);
        let read = Packet::read(0x40, 1, MasterId(1));
        let admission = h.with(|dtu, ctx| dtu.handle_cache_mem_request(ctx, read, false)).unwrap();
        assert!(matches!(admission, CacheAdmission::Forwarded));
        h.run().unwrap();

        assert_eq!(h.cpu_responses.len(), 1);
        let resp = &h.cpu_responses[0];
        assert_eq!(resp.addr(), 0x40);
        assert_eq!(resp.data(), &[0x77]);
        assert_eq!(resp.requester(), MasterId(1));
    }

    #[test]
    fn test_register_errors_are_not_fatal() {
        let mut h = Harness::new(true);
        let addr = h.dtu.reg_file_base() + 4;
        let pkt = Packet::write(addr, vec![0; 8], MasterId(1));
        h.with(|dtu, ctx| dtu.handle_cpu_request(ctx, pkt)).unwrap();
        h.run().unwrap();
        assert_eq!(h.cpu_responses.len(), 1);
        assert!(h.cpu_responses[0].is_error());
    }
}
