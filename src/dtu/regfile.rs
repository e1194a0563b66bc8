//! Memory-mapped register file of a DTU.
//!
//! # Layout
//!
//! All registers are 64 bits wide and stored little endian. Offsets are
//! relative to the start of the register window.
//!
//! ```text
//! 0x00  DTU registers       STATUS, MSG_CNT
//! 0x10  command registers   COMMAND, DATA_ADDR, DATA_SIZE, OFFSET,
//!                           REPLY_EPID, REPLY_LABEL
//! 0x40  endpoint 0          12 registers
//! 0xA0  endpoint 1          ...
//! ```
//!
//! Requests may cover several consecutive registers but must be aligned to
//! and sized in multiples of the register width.

use std::fmt;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use super::{DtuError, Packet};

/// Register value type.
pub type Reg = u64;

/// Register width in bytes.
pub const REG_SIZE: usize = std::mem::size_of::<Reg>();

/// Global DTU registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtuReg {
    Status,
    /// Pending messages summed over all endpoints.
    MsgCnt,
}

impl DtuReg {
    pub const ALL: [DtuReg; 2] = [DtuReg::Status, DtuReg::MsgCnt];
}

/// Command registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdReg {
    Command,
    DataAddr,
    DataSize,
    Offset,
    ReplyEpId,
    ReplyLabel,
}

impl CmdReg {
    pub const ALL: [CmdReg; 6] = [
        CmdReg::Command,
        CmdReg::DataAddr,
        CmdReg::DataSize,
        CmdReg::Offset,
        CmdReg::ReplyEpId,
        CmdReg::ReplyLabel,
    ];
}

/// Per-endpoint registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpReg {
    /// Target tile for SEND/READ/WRITE.
    TgtCoreId,
    /// Target endpoint for SEND.
    TgtEpId,
    /// Label sent with each message.
    Label,
    /// Base of the remote memory region.
    ReqRemAddr,
    /// Size of the remote memory region.
    ReqRemSize,
    /// Permission flags, see [`MemFlags`].
    ReqFlags,
    /// Receive buffer address.
    BufAddr,
    /// Size of one receive slot.
    BufMsgSize,
    /// Number of receive slots.
    BufSize,
    /// Messages received but not yet consumed.
    BufMsgCnt,
    BufRdPtr,
    BufWrPtr,
}

impl EpReg {
    pub const ALL: [EpReg; 12] = [
        EpReg::TgtCoreId,
        EpReg::TgtEpId,
        EpReg::Label,
        EpReg::ReqRemAddr,
        EpReg::ReqRemSize,
        EpReg::ReqFlags,
        EpReg::BufAddr,
        EpReg::BufMsgSize,
        EpReg::BufSize,
        EpReg::BufMsgCnt,
        EpReg::BufRdPtr,
        EpReg::BufWrPtr,
    ];

    pub const COUNT: usize = Self::ALL.len();
}

bitflags! {
    /// Permissions of a memory endpoint.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: Reg {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// A decoded register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Dtu(DtuReg),
    Cmd(CmdReg),
    Ep(usize, EpReg),
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Register::Dtu(r) => write!(f, "{:?}", r),
            Register::Cmd(r) => write!(f, "{:?}", r),
            Register::Ep(ep, r) => write!(f, "EP{}.{:?}", ep, r),
        }
    }
}

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOpcode {
    Idle = 0,
    Send = 1,
    Reply = 2,
    Read = 3,
    Write = 4,
    IncReadPtr = 5,
    WakeupCore = 6,
}

impl CommandOpcode {
    pub fn name(self) -> &'static str {
        match self {
            CommandOpcode::Idle => "IDLE",
            CommandOpcode::Send => "SEND",
            CommandOpcode::Reply => "REPLY",
            CommandOpcode::Read => "READ",
            CommandOpcode::Write => "WRITE",
            CommandOpcode::IncReadPtr => "INC_READ_PTR",
            CommandOpcode::WakeupCore => "WAKEUP_CORE",
        }
    }
}

impl TryFrom<Reg> for CommandOpcode {
    type Error = Reg;

    fn try_from(raw: Reg) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => CommandOpcode::Idle,
            1 => CommandOpcode::Send,
            2 => CommandOpcode::Reply,
            3 => CommandOpcode::Read,
            4 => CommandOpcode::Write,
            5 => CommandOpcode::IncReadPtr,
            6 => CommandOpcode::WakeupCore,
            other => return Err(other),
        })
    }
}

/// Decoded contents of the COMMAND register.
///
/// ```text
/// |  epid   |  opcode  |
///           3          0
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub opcode: CommandOpcode,
    pub ep_id: usize,
}

impl Command {
    pub const OPCODE_BITS: u32 = 3;

    /// Decode a COMMAND register value.
    pub fn decode(reg: Reg, epid_bits: u32) -> Result<Self, DtuError> {
        let opcode_mask = (1 << Self::OPCODE_BITS) - 1;
        let epid_mask = ((1 << epid_bits) - 1) << Self::OPCODE_BITS;

        let raw = reg & opcode_mask;
        let ep_id = ((reg & epid_mask) >> Self::OPCODE_BITS) as usize;
        let opcode = CommandOpcode::try_from(raw).map_err(|raw| DtuError::InvalidOpcode { raw, ep: ep_id })?;
        Ok(Self { opcode, ep_id })
    }

    /// Encode a command for the COMMAND register.
    pub fn encode(opcode: CommandOpcode, ep_id: usize) -> Reg {
        ((ep_id as Reg) << Self::OPCODE_BITS) | opcode as Reg
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} with EP{}", self.opcode.name(), self.ep_id)
    }
}

/// Rejected register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegFileError {
    #[error("misaligned register access @ {offset:#x}:{size}")]
    Misaligned { offset: u64, size: usize },
    #[error("register access @ {offset:#x}:{size} outside of the register file")]
    OutOfRange { offset: u64, size: usize },
}

/// The register file.
#[derive(Debug, Clone)]
pub struct RegFile {
    name: String,
    dtu_regs: [Reg; DtuReg::ALL.len()],
    cmd_regs: [Reg; CmdReg::ALL.len()],
    ep_regs: Vec<[Reg; EpReg::COUNT]>,
}

impl RegFile {
    pub const DTU_REGS_OFFSET: u64 = 0;
    pub const CMD_REGS_OFFSET: u64 = Self::DTU_REGS_OFFSET + (DtuReg::ALL.len() * REG_SIZE) as u64;
    pub const EP_REGS_OFFSET: u64 = Self::CMD_REGS_OFFSET + (CmdReg::ALL.len() * REG_SIZE) as u64;
    pub const EP_SIZE: u64 = (EpReg::COUNT * REG_SIZE) as u64;

    pub fn new(name: impl Into<String>, num_endpoints: usize) -> Self {
        Self {
            name: name.into(),
            dtu_regs: [0; DtuReg::ALL.len()],
            cmd_regs: [0; CmdReg::ALL.len()],
            ep_regs: vec![[0; EpReg::COUNT]; num_endpoints],
        }
    }

    pub fn num_endpoints(&self) -> usize {
        self.ep_regs.len()
    }

    /// Size of the register window in bytes.
    pub fn size(&self) -> u64 {
        Self::EP_REGS_OFFSET + self.ep_regs.len() as u64 * Self::EP_SIZE
    }

    pub fn get_dtu(&self, reg: DtuReg) -> Reg {
        self.dtu_regs[reg as usize]
    }

    pub fn set_dtu(&mut self, reg: DtuReg, value: Reg) {
        log::trace!("{}: {:?} <- {:#x}", self.name, reg, value);
        self.dtu_regs[reg as usize] = value;
    }

    pub fn get_cmd(&self, reg: CmdReg) -> Reg {
        self.cmd_regs[reg as usize]
    }

    pub fn set_cmd(&mut self, reg: CmdReg, value: Reg) {
        log::trace!("{}: {:?} <- {:#x}", self.name, reg, value);
        self.cmd_regs[reg as usize] = value;
    }

    /// Read an endpoint register. Panics if `ep` is not a valid endpoint.
    pub fn get_ep(&self, ep: usize, reg: EpReg) -> Reg {
        self.ep_regs[ep][reg as usize]
    }

    /// Write an endpoint register. Panics if `ep` is not a valid endpoint.
    pub fn set_ep(&mut self, ep: usize, reg: EpReg, value: Reg) {
        log::trace!("{}: EP{}.{:?} <- {:#x}", self.name, ep, reg, value);
        self.ep_regs[ep][reg as usize] = value;
    }

    /// Register at a byte offset, if the offset is register aligned and inside the window.
    pub fn decode(&self, offset: u64) -> Option<Register> {
        if offset % REG_SIZE as u64 != 0 || offset >= self.size() {
            return None;
        }

        if offset < Self::CMD_REGS_OFFSET {
            let idx = ((offset - Self::DTU_REGS_OFFSET) / REG_SIZE as u64) as usize;
            return Some(Register::Dtu(DtuReg::ALL[idx]));
        }
        if offset < Self::EP_REGS_OFFSET {
            let idx = ((offset - Self::CMD_REGS_OFFSET) / REG_SIZE as u64) as usize;
            return Some(Register::Cmd(CmdReg::ALL[idx]));
        }

        let rel = offset - Self::EP_REGS_OFFSET;
        let ep = (rel / Self::EP_SIZE) as usize;
        let idx = ((rel % Self::EP_SIZE) / REG_SIZE as u64) as usize;
        Some(Register::Ep(ep, EpReg::ALL[idx]))
    }

    /// Byte offset of a register.
    pub fn offset_of(reg: Register) -> u64 {
        match reg {
            Register::Dtu(r) => Self::DTU_REGS_OFFSET + (r as usize * REG_SIZE) as u64,
            Register::Cmd(r) => Self::CMD_REGS_OFFSET + (r as usize * REG_SIZE) as u64,
            Register::Ep(ep, r) => {
                Self::EP_REGS_OFFSET + ep as u64 * Self::EP_SIZE + (r as usize * REG_SIZE) as u64
            }
        }
    }

    /// Whether a request at `offset:size` covers the COMMAND register.
    pub fn covers_command(offset: u64, size: usize) -> bool {
        let cmd = Self::offset_of(Register::Cmd(CmdReg::Command));
        offset <= cmd && cmd < offset.saturating_add(size as u64)
    }

    fn get(&self, reg: Register) -> Reg {
        match reg {
            Register::Dtu(r) => self.get_dtu(r),
            Register::Cmd(r) => self.get_cmd(r),
            Register::Ep(ep, r) => self.get_ep(ep, r),
        }
    }

    fn set(&mut self, reg: Register, value: Reg) {
        match reg {
            Register::Dtu(r) => self.set_dtu(r, value),
            Register::Cmd(r) => self.set_cmd(r, value),
            Register::Ep(ep, r) => self.set_ep(ep, r, value),
        }
    }

    /// Apply a register request. The packet address is relative to the start
    /// of the window. On success the packet becomes a response and the
    /// result tells whether the COMMAND register was written.
    ///
    /// Rejected requests leave the registers and the packet untouched.
    pub fn handle_request(&mut self, pkt: &mut Packet, is_cpu_request: bool) -> Result<bool, RegFileError> {
        let offset = pkt.addr();
        let size = pkt.size();

        if offset % REG_SIZE as u64 != 0 || size == 0 || size % REG_SIZE != 0 {
            return Err(RegFileError::Misaligned { offset, size });
        }
        if offset.saturating_add(size as u64) > self.size() {
            return Err(RegFileError::OutOfRange { offset, size });
        }

        let source = if is_cpu_request { "CPU" } else { "NoC" };
        let is_write = pkt.is_write();
        let mut command_written = false;

        for i in 0..size / REG_SIZE {
            let reg_offset = offset + (i * REG_SIZE) as u64;
            let Some(reg) = self.decode(reg_offset) else {
                return Err(RegFileError::OutOfRange { offset, size });
            };
            let bytes = &mut pkt.data_mut()[i * REG_SIZE..(i + 1) * REG_SIZE];

            if is_write {
                let value = LittleEndian::read_u64(bytes);
                log::trace!("{}: {} writes {} = {:#x}", self.name, source, reg, value);
                self.set(reg, value);
                command_written |= reg == Register::Cmd(CmdReg::Command);
            } else {
                let value = self.get(reg);
                log::trace!("{}: {} reads {} = {:#x}", self.name, source, reg, value);
                LittleEndian::write_u64(bytes, value);
            }
        }

        pkt.make_response();
        Ok(command_written)
    }

    /// Dump all registers, one per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for r in DtuReg::ALL {
            out.push_str(&format!("{:<16} {:#018x}\n", format!("{:?}", r), self.get_dtu(r)));
        }
        for r in CmdReg::ALL {
            out.push_str(&format!("{:<16} {:#018x}\n", format!("{:?}", r), self.get_cmd(r)));
        }
        for ep in 0..self.ep_regs.len() {
            if self.ep_regs[ep].iter().all(|&v| v == 0) {
                continue;
            }
            for r in EpReg::ALL {
                let name = format!("EP{}.{:?}", ep, r);
                out.push_str(&format!("{:<16} {:#018x}\n", name, self.get_ep(ep, r)));
            }
        }
        out
    }
}

impl PartialEq for RegFile {
    fn eq(&self, other: &Self) -> bool {
        self.dtu_regs == other.dtu_regs && self.cmd_regs == other.cmd_regs && self.ep_regs == other.ep_regs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MasterId;

    fn write_pkt(offset: u64, values: &[Reg]) -> Packet {
        let mut data = vec![0u8; values.len() * REG_SIZE];
        for (i, v) in values.iter().enumerate() {
            LittleEndian::write_u64(&mut data[i * REG_SIZE..], *v);
        }
        Packet::write(offset, data, MasterId(0))
    }

    #[test]
    fn test_layout_offsets() {
        assert_eq!(RegFile::CMD_REGS_OFFSET, 0x10);
        assert_eq!(RegFile::EP_REGS_OFFSET, 0x40);
        assert_eq!(RegFile::EP_SIZE, 0x60);

        let rf = RegFile::new("rf", 8);
        assert_eq!(rf.size(), 0x40 + 8 * 0x60);
        assert_eq!(rf.decode(0x08), Some(Register::Dtu(DtuReg::MsgCnt)));
        assert_eq!(rf.decode(0x10), Some(Register::Cmd(CmdReg::Command)));
        assert_eq!(rf.decode(0x40 + 0x60 + 0x28), Some(Register::Ep(1, EpReg::ReqFlags)));
        assert_eq!(rf.decode(0x41), None);
        assert_eq!(rf.decode(rf.size()), None);
    }

    #[test]
    fn test_offset_of_matches_decode() {
        let rf = RegFile::new("rf", 4);
        for ep in 0..4 {
            for r in EpReg::ALL {
                let reg = Register::Ep(ep, r);
                assert_eq!(rf.decode(RegFile::offset_of(reg)), Some(reg));
            }
        }
    }

    #[test]
    fn test_multi_register_write_and_read() {
        let mut rf = RegFile::new("rf", 2);
        let base = RegFile::offset_of(Register::Cmd(CmdReg::DataAddr));
        let mut pkt = write_pkt(base, &[0x1000, 0x20]);
        assert_eq!(rf.handle_request(&mut pkt, true), Ok(false));
        assert!(pkt.is_response());
        assert_eq!(rf.get_cmd(CmdReg::DataAddr), 0x1000);
        assert_eq!(rf.get_cmd(CmdReg::DataSize), 0x20);

        let mut pkt = Packet::read(base, 16, MasterId(0));
        assert_eq!(rf.handle_request(&mut pkt, true), Ok(false));
        assert_eq!(LittleEndian::read_u64(&pkt.data()[0..8]), 0x1000);
        assert_eq!(LittleEndian::read_u64(&pkt.data()[8..16]), 0x20);
    }

    #[test]
    fn test_command_write_detected() {
        let mut rf = RegFile::new("rf", 2);
        let mut pkt = write_pkt(0x08, &[0, Command::encode(CommandOpcode::Send, 1)]);
        assert_eq!(rf.handle_request(&mut pkt, true), Ok(true));

        // Reading the command register is not a command write
        let mut pkt = Packet::read(0x10, 8, MasterId(0));
        assert_eq!(rf.handle_request(&mut pkt, true), Ok(false));
    }

    #[test]
    fn test_rejected_requests() {
        let mut rf = RegFile::new("rf", 1);
        let mut pkt = write_pkt(0x04, &[1]);
        assert!(matches!(rf.handle_request(&mut pkt, true), Err(RegFileError::Misaligned { .. })));
        assert!(!pkt.is_response());

        let mut pkt = Packet::read(0x10, 4, MasterId(0));
        assert!(matches!(rf.handle_request(&mut pkt, true), Err(RegFileError::Misaligned { .. })));

        let end = rf.size() - 8;
        let mut pkt = write_pkt(end, &[1, 2]);
        assert!(matches!(rf.handle_request(&mut pkt, false), Err(RegFileError::OutOfRange { .. })));
        assert_eq!(rf.get_ep(0, EpReg::BufWrPtr), 0);
    }

    #[test]
    fn test_command_decode() {
        let reg = Command::encode(CommandOpcode::Reply, 5);
        let cmd = Command::decode(reg, 8).unwrap();
        assert_eq!(cmd.opcode, CommandOpcode::Reply);
        assert_eq!(cmd.ep_id, 5);

        // Bits beyond the epid field are ignored
        let cmd = Command::decode(reg | 1 << 20, 8).unwrap();
        assert_eq!(cmd.ep_id, 5);

        assert!(matches!(
            Command::decode(7 | 2 << 3, 8),
            Err(DtuError::InvalidOpcode { raw: 7, ep: 2 })
        ));
    }

    #[test]
    fn test_covers_command() {
        assert!(RegFile::covers_command(0x10, 8));
        assert!(RegFile::covers_command(0x00, 24));
        assert!(!RegFile::covers_command(0x00, 16));
        assert!(!RegFile::covers_command(0x18, 8));
    }
}
