//! A CPU stand-in that runs a fixed list of operations.
//!
//! One operation is in flight at a time. Polling operations re-issue their
//! read one cycle later until the condition holds.

use crate::dtu::{CmdReg, EpReg, Packet, RegFile, Register};
use crate::sim::{Addr, CoreControl, CoreId, CpuDriver, Delivery, Fabric, MasterId, SimError};

/// One step of a script. Reads and writes are 8 bytes wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuOp {
    Write(Addr, u64),
    Read(Addr),
    /// Poll COMMAND until the DTU finished the command.
    WaitCommand,
    /// Poll BUF_MSG_CNT of the endpoint until a message is pending.
    WaitMessage(usize),
    /// Suspend the core and wait for the DTU to wake it.
    Suspend,
}

pub struct ScriptedCpu {
    name: String,
    master: MasterId,
    reg_base: Addr,
    ops: Vec<CpuOp>,
    pc: usize,
    awaiting: bool,
    retry: Option<Packet>,
    suspended: bool,
    reads: Vec<u64>,
    polls: u64,
    suspended_cycles: u64,
    errors: u32,
}

impl ScriptedCpu {
    pub fn new(core: CoreId, fabric: &mut Fabric, ops: Vec<CpuOp>) -> Self {
        let name = format!("tile{}.cpu", core);
        let master = fabric.register_master(name.as_str());
        Self {
            name,
            master,
            reg_base: fabric.config().dtu.reg_file_base_addr,
            ops,
            pc: 0,
            awaiting: false,
            retry: None,
            suspended: false,
            reads: Vec::new(),
            polls: 0,
            suspended_cycles: 0,
            errors: 0,
        }
    }

    /// Values returned by [`CpuOp::Read`], in order.
    pub fn reads(&self) -> &[u64] {
        &self.reads
    }

    pub fn is_done(&self) -> bool {
        self.pc >= self.ops.len()
    }

    pub fn polls(&self) -> u64 {
        self.polls
    }

    pub fn suspended_cycles(&self) -> u64 {
        self.suspended_cycles
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    fn reg(&self, reg: Register) -> Addr {
        self.reg_base + RegFile::offset_of(reg)
    }

    fn send(&mut self, core: CoreId, fabric: &mut Fabric, pkt: Packet) -> Result<(), SimError> {
        match fabric.cpu_send(core, pkt)? {
            Delivery::Accepted => self.awaiting = true,
            Delivery::Refused(pkt) => self.retry = Some(pkt),
        }
        Ok(())
    }

    fn advance(&mut self, core: CoreId, fabric: &mut Fabric) {
        self.pc += 1;
        if self.is_done() {
            log::info!("{}: script finished at tick {}", self.name, fabric.now());
        } else {
            fabric.schedule_tick(core, 1);
        }
    }
}

impl CpuDriver for ScriptedCpu {
    fn tick(&mut self, core: CoreId, fabric: &mut Fabric) -> Result<(), SimError> {
        if self.awaiting || self.retry.is_some() {
            return Ok(());
        }
        let Some(&op) = self.ops.get(self.pc) else {
            return Ok(());
        };
        log::trace!("{}: op {} {:?}", self.name, self.pc, op);

        let pkt = match op {
            CpuOp::Write(addr, value) => Packet::write(addr, value.to_le_bytes().to_vec(), self.master),
            CpuOp::Read(addr) => Packet::read(addr, 8, self.master),
            CpuOp::WaitCommand => Packet::read(self.reg(Register::Cmd(CmdReg::Command)), 8, self.master),
            CpuOp::WaitMessage(ep) => Packet::read(self.reg(Register::Ep(ep, EpReg::BufMsgCnt)), 8, self.master),
            CpuOp::Suspend => {
                let tile = fabric.tile_mut(core).ok_or(SimError::UnknownTile(core))?;
                if !self.suspended {
                    self.suspended = tile.core.suspend();
                    if !self.suspended {
                        log::debug!("{}: suspend denied, messages pending", self.name);
                        self.advance(core, fabric);
                        return Ok(());
                    }
                    log::debug!("{}: core suspended", self.name);
                } else if !tile.core.is_suspended() {
                    log::debug!("{}: woken up after {} cycles", self.name, self.suspended_cycles);
                    self.suspended = false;
                    self.advance(core, fabric);
                    return Ok(());
                }
                self.suspended_cycles += 1;
                fabric.schedule_tick(core, 1);
                return Ok(());
            }
        };
        self.send(core, fabric, pkt)
    }

    fn recv_response(&mut self, core: CoreId, fabric: &mut Fabric, pkt: Packet) -> Result<(), SimError> {
        self.awaiting = false;
        if pkt.is_error() {
            log::warn!("{}: access @ {:#x} failed", self.name, pkt.addr());
            self.errors += 1;
        }

        let value = pkt
            .data()
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map_or(0, u64::from_le_bytes);

        let done = match self.ops.get(self.pc) {
            Some(CpuOp::Read(_)) => {
                self.reads.push(value);
                true
            }
            Some(CpuOp::WaitCommand) => value == 0,
            Some(CpuOp::WaitMessage(_)) => value > 0,
            _ => true,
        };

        if done {
            self.advance(core, fabric);
        } else {
            self.polls += 1;
            fabric.schedule_tick(core, 1);
        }
        Ok(())
    }

    fn recv_retry(&mut self, core: CoreId, fabric: &mut Fabric) -> Result<(), SimError> {
        match self.retry.take() {
            Some(pkt) => self.send(core, fabric, pkt),
            None => Ok(()),
        }
    }
}
