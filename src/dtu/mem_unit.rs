//! Memory unit: READ/WRITE commands and inbound memory accesses.
//!
//! A READ or WRITE moves `DATA_SIZE` bytes between `DATA_ADDR` and
//! `REQ_REM_ADDR + OFFSET` at the endpoint's target tile. Accesses larger
//! than one NoC packet are split into pieces that run one after another.

use super::xfer_unit::TransferRequest;
use super::{CmdReg, Command, Dtu, DtuCtx, DtuError, EpReg, NocAddr, NocPacketType, Packet, TransferType};
use crate::sim::{Addr, CoreId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessKind {
    Read,
    Write,
}

/// A READ or WRITE command in progress.
#[derive(Debug, Clone, Copy)]
struct RemoteAccess {
    kind: AccessKind,
    ep: usize,
    target_core: CoreId,
    remote_addr: Addr,
    local_addr: Addr,
    size: usize,
    done: usize,
    /// Size of the piece in flight.
    piece: usize,
}

#[derive(Debug, Default)]
pub(super) struct MemUnit {
    pending: Option<RemoteAccess>,
}

impl Dtu {
    pub(super) fn start_read(&mut self, ctx: &mut DtuCtx<'_>, cmd: Command) -> Result<(), DtuError> {
        self.start_access(ctx, cmd, AccessKind::Read)
    }

    pub(super) fn start_write(&mut self, ctx: &mut DtuCtx<'_>, cmd: Command) -> Result<(), DtuError> {
        self.start_access(ctx, cmd, AccessKind::Write)
    }

    fn start_access(&mut self, ctx: &mut DtuCtx<'_>, cmd: Command, kind: AccessKind) -> Result<(), DtuError> {
        let ep = cmd.ep_id;
        let offset = self.regs.get_cmd(CmdReg::Offset);
        let size = self.regs.get_cmd(CmdReg::DataSize);

        let admitted = self
            .check_access(ep, kind == AccessKind::Write, offset, size)
            .and_then(|()| self.remote_range(ep, offset, size));
        let remote_addr = match admitted {
            Ok(addr) => addr,
            Err(reason) => {
                log::debug!(
                    "{}: {} of {} bytes @ {:#x} with EP{} refused: {}",
                    self.name(),
                    cmd.opcode.name(),
                    size,
                    offset,
                    ep,
                    reason
                );
                self.stats.refused_accesses += 1;
                return self.finish_command();
            }
        };

        match kind {
            AccessKind::Read => self.stats.remote_reads += 1,
            AccessKind::Write => self.stats.remote_writes += 1,
        }

        self.mem.pending = Some(RemoteAccess {
            kind,
            ep,
            target_core: self.regs.get_ep(ep, EpReg::TgtCoreId) as CoreId,
            remote_addr,
            local_addr: self.regs.get_cmd(CmdReg::DataAddr),
            size: size as usize,
            done: 0,
            piece: 0,
        });
        self.issue_next_piece(ctx)
    }

    fn issue_next_piece(&mut self, ctx: &mut DtuCtx<'_>) -> Result<(), DtuError> {
        let max = self.config.max_noc_packet_size;
        let Some(access) = self.mem.pending.as_mut() else {
            return Err(DtuError::NoCommandInFlight);
        };
        access.piece = (access.size - access.done).min(max);
        let access = *access;

        let target = NocAddr::new(access.target_core, 0, access.remote_addr + access.done as u64);
        log::trace!(
            "{}: {:?} piece of {} bytes ({}/{}) with {}",
            self.name(),
            access.kind,
            access.piece,
            access.done,
            access.size,
            target
        );

        match access.kind {
            AccessKind::Read => {
                let pkt = Packet::read(target.raw(), access.piece, self.master_id());
                let delay = self.config.command_to_noc_request_latency;
                self.send_noc_request(ctx, NocPacketType::ReadReq, pkt, delay, false)
            }
            AccessKind::Write => {
                let delay = self.config.command_to_noc_request_latency;
                self.start_transfer(
                    ctx,
                    TransferRequest {
                        kind: TransferType::LocalRead,
                        target,
                        local_addr: access.local_addr + access.done as u64,
                        size: access.piece,
                        pkt: None,
                        header: None,
                        ep_id: access.ep,
                        delay,
                        last: access.done + access.piece >= access.size,
                    },
                )
            }
        }
    }

    /// The piece in flight is done; continue or finish the command.
    fn advance_piece(&mut self, ctx: &mut DtuCtx<'_>) -> Result<(), DtuError> {
        let Some(access) = self.mem.pending.as_mut() else {
            return Err(DtuError::NoCommandInFlight);
        };
        access.done += access.piece;
        if access.done >= access.size {
            self.mem.pending = None;
            self.finish_command()
        } else {
            self.issue_next_piece(ctx)
        }
    }

    /// Response to a READ piece: write the data to local memory.
    pub(super) fn read_complete(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet) -> Result<(), DtuError> {
        let Some(access) = self.mem.pending else {
            return Err(DtuError::UnexpectedPacket {
                what: "read response without READ",
                addr: pkt.addr(),
            });
        };
        if pkt.is_error() {
            log::warn!(
                "{}: remote read @ {} failed",
                self.name(),
                NocAddr::from_raw(pkt.addr())
            );
            return self.advance_piece(ctx);
        }

        let delay = self.config.noc_to_transfer_latency;
        self.start_transfer(
            ctx,
            TransferRequest {
                kind: TransferType::LocalWrite,
                target: NocAddr::from_raw(pkt.addr()),
                local_addr: access.local_addr + access.done as u64,
                size: pkt.size().min(access.piece),
                pkt: Some(pkt),
                header: None,
                ep_id: access.ep,
                delay,
                last: access.done + access.piece >= access.size,
            },
        )
    }

    /// The data of a READ piece is in local memory.
    pub(super) fn read_transfer_done(&mut self, ctx: &mut DtuCtx<'_>, last: bool) -> Result<(), DtuError> {
        let Some(access) = self.mem.pending.as_mut() else {
            return Err(DtuError::NoCommandInFlight);
        };
        access.done += access.piece;
        if last {
            self.mem.pending = None;
            self.finish_command()
        } else {
            self.issue_next_piece(ctx)
        }
    }

    /// Response to a WRITE piece or acknowledgement of a message.
    pub(super) fn write_complete(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet) -> Result<(), DtuError> {
        if pkt.is_error() {
            log::warn!(
                "{}: remote write @ {} failed",
                self.name(),
                NocAddr::from_raw(pkt.addr())
            );
        }
        match self.mem.pending {
            Some(_) => self.advance_piece(ctx),
            None => self.finish_command(),
        }
    }

    /// A READ_REQ, WRITE_REQ or cache request from another tile.
    pub(super) fn recv_access_from_noc(&mut self, ctx: &mut DtuCtx<'_>, mut pkt: Packet) -> Result<(), DtuError> {
        let addr = NocAddr::from_raw(pkt.addr());
        let offset = addr.offset;

        if offset >= self.config.reg_file_base_addr {
            pkt.set_addr(offset);
            return self.forward_request_to_reg_file(ctx, pkt, false);
        }

        let kind = if pkt.is_write() {
            TransferType::RemoteWrite
        } else if pkt.is_read() {
            TransferType::RemoteRead
        } else {
            log::warn!("{}: refusing {:?} from the NoC", self.name(), pkt.cmd());
            self.refuse_noc_request(ctx, pkt);
            return Ok(());
        };

        let size = pkt.size();
        let delay = self.config.noc_to_transfer_latency;
        self.start_transfer(
            ctx,
            TransferRequest {
                kind,
                target: addr,
                local_addr: offset,
                size,
                pkt: Some(pkt),
                header: None,
                ep_id: addr.ep_id as usize,
                delay,
                last: true,
            },
        )
    }

    /// A functional cache request from another tile: access memory directly.
    pub(super) fn recv_functional_from_noc(&mut self, ctx: &mut DtuCtx<'_>, mut pkt: Packet) -> Result<(), DtuError> {
        let raw = pkt.addr();
        pkt.set_addr(NocAddr::from_raw(raw).offset);
        ctx.mem.send_functional(&mut pkt);
        pkt.set_addr(raw);
        ctx.noc.send_functional_resp(pkt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtu::core::tests::Harness;
    use crate::dtu::{CommandOpcode, MemFlags, RegFile, Register};

    fn setup_mem_ep(h: &mut Harness, ep: usize, base: Addr, size: u64) {
        let regs = h.dtu.regs_mut();
        regs.set_ep(ep, EpReg::TgtCoreId, 0);
        regs.set_ep(ep, EpReg::ReqRemAddr, base);
        regs.set_ep(ep, EpReg::ReqRemSize, size);
        regs.set_ep(ep, EpReg::ReqFlags, (MemFlags::READ | MemFlags::WRITE).bits());
    }

    #[test]
    fn test_read_of_exactly_one_packet() {
        let mut h = Harness::new(false);
        setup_mem_ep(&mut h, 2, 0x6000, 0x1000);
        h.mem.write_bytes(0x6000, &[0x5A; 1024]);

        h.write_reg(Register::Cmd(CmdReg::DataAddr), 0x100).unwrap();
        h.write_reg(Register::Cmd(CmdReg::DataSize), 1024).unwrap();
        h.command(CommandOpcode::Read, 2).unwrap();
        h.run().unwrap();

        assert!(!h.dtu.is_command_in_flight());
        assert_eq!(h.mem.read_bytes(0x100, 1024), vec![0x5A; 1024]);
        assert_eq!(h.dtu.stats().remote_reads, 1);
    }

    #[test]
    fn test_remote_register_access() {
        let mut h = Harness::new(true);
        let base = h.dtu.reg_file_base();
        setup_mem_ep(&mut h, 2, base, 0x1000);
        h.dtu.regs_mut().set_ep(5, EpReg::Label, 0xDEAD_BEEF);

        let label = RegFile::offset_of(Register::Ep(5, EpReg::Label));
        h.write_reg(Register::Cmd(CmdReg::DataAddr), 0x80).unwrap();
        h.write_reg(Register::Cmd(CmdReg::DataSize), 8).unwrap();
        h.write_reg(Register::Cmd(CmdReg::Offset), label).unwrap();
        h.command(CommandOpcode::Read, 2).unwrap();
        h.run().unwrap();

        assert!(!h.dtu.is_command_in_flight());
        assert_eq!(h.mem.read_bytes(0x80, 8), 0xDEAD_BEEFu64.to_le_bytes().to_vec());
    }

    #[test]
    fn test_unaddressable_remote_range_refused() {
        for atomic in [true, false] {
            let mut h = Harness::new(atomic);
            // Wraps around the address space
            setup_mem_ep(&mut h, 3, u64::MAX - 0x10, 0x1000);
            // Ends beyond the NoC offset field
            setup_mem_ep(&mut h, 4, NocAddr::OFFSET_LIMIT - 4, 0x1000);

            h.write_reg(Register::Cmd(CmdReg::DataSize), 8).unwrap();
            h.write_reg(Register::Cmd(CmdReg::Offset), 0x100).unwrap();
            h.command(CommandOpcode::Read, 3).unwrap();
            h.run().unwrap();
            assert!(!h.dtu.is_command_in_flight());

            h.write_reg(Register::Cmd(CmdReg::Offset), 0).unwrap();
            h.command(CommandOpcode::Write, 4).unwrap();
            h.run().unwrap();
            assert!(!h.dtu.is_command_in_flight());

            assert_eq!(h.dtu.stats().refused_accesses, 2);
            assert_eq!(h.dtu.stats().remote_reads + h.dtu.stats().remote_writes, 0);
            assert!(h.dtu.is_idle());
        }
    }

    #[test]
    fn test_failed_remote_read_still_finishes() {
        for atomic in [true, false] {
            let mut h = Harness::new(atomic);
            // Beyond the end of the scratchpad
            setup_mem_ep(&mut h, 2, 0x10_0000, 0x1000);

            h.write_reg(Register::Cmd(CmdReg::DataSize), 16).unwrap();
            h.command(CommandOpcode::Read, 2).unwrap();
            h.run().unwrap();

            assert!(!h.dtu.is_command_in_flight());
            assert!(h.dtu.is_idle());
        }
    }
}
