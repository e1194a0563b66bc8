//! Message unit: SEND, REPLY and the receive rings.
//!
//! Each receive endpoint owns a ring of `BUF_SIZE` slots of `BUF_MSG_SIZE`
//! bytes at `BUF_ADDR`. An arriving message reserves the slot at the write
//! pointer, is written there by the transfer engine and only then becomes
//! visible in `BUF_MSG_CNT` and `MSG_CNT`. Software consumes messages at the
//! read pointer and releases them with INC_READ_PTR.

use super::header::flags;
use super::xfer_unit::TransferRequest;
use super::{
    CmdReg, Command, Dtu, DtuCtx, DtuError, DtuReg, EpReg, MemReqKind, MessageHeader, NocAddr, Packet,
    TransferType, HEADER_SIZE,
};
use crate::sim::CoreId;

/// Slot reservations of the receive rings.
#[derive(Debug, Clone)]
pub(super) struct MsgUnit {
    /// Slots reserved for messages still being written, per endpoint.
    reserved: Vec<u64>,
}

impl MsgUnit {
    pub fn new(num_endpoints: usize) -> Self {
        Self {
            reserved: vec![0; num_endpoints],
        }
    }
}

impl Dtu {
    fn check_message_size(&self, payload: u64) -> Result<usize, DtuError> {
        let max = self.config.max_noc_packet_size;
        match payload.checked_add(HEADER_SIZE as u64) {
            Some(size) if size <= max as u64 => Ok(payload as usize),
            size => Err(DtuError::MessageTooLarge {
                size: size.and_then(|s| usize::try_from(s).ok()).unwrap_or(usize::MAX),
                max,
            }),
        }
    }

    /// SEND: transmit the data at DATA_ADDR to the endpoint's target.
    pub(super) fn start_send(&mut self, ctx: &mut DtuCtx<'_>, cmd: Command) -> Result<(), DtuError> {
        let ep = cmd.ep_id;
        let size = self.check_message_size(self.regs.get_cmd(CmdReg::DataSize))?;

        let header = MessageHeader {
            label: self.regs.get_ep(ep, EpReg::Label),
            reply_label: self.regs.get_cmd(CmdReg::ReplyLabel),
            length: size as u16,
            sender_core_id: self.core_id(),
            flags: 0,
            sender_ep_id: ep as u8,
            reply_ep_id: self.regs.get_cmd(CmdReg::ReplyEpId) as u8,
            reserved: 0,
        };
        let target = NocAddr::new(
            self.regs.get_ep(ep, EpReg::TgtCoreId) as CoreId,
            self.regs.get_ep(ep, EpReg::TgtEpId) as u8,
            0,
        );
        let data_addr = self.regs.get_cmd(CmdReg::DataAddr);

        log::debug!("{}: SEND {} bytes @ {:#x} to {}", self.name(), size, data_addr, target);
        self.stats.messages_sent += 1;

        let delay = self.config.start_msg_transfer_delay;
        self.start_transfer(
            ctx,
            TransferRequest {
                kind: TransferType::LocalRead,
                target,
                local_addr: data_addr,
                size,
                pkt: None,
                header: Some(header),
                ep_id: ep,
                delay,
                last: true,
            },
        )
    }

    /// REPLY: fetch the header of the message at the read pointer first.
    pub(super) fn start_reply(&mut self, ctx: &mut DtuCtx<'_>, cmd: Command) -> Result<(), DtuError> {
        let ep = cmd.ep_id;
        if self.regs.get_ep(ep, EpReg::BufMsgCnt) == 0 {
            return Err(DtuError::NoMessageToReply { ep });
        }
        self.check_message_size(self.regs.get_cmd(CmdReg::DataSize))?;

        let slot = self.regs.get_ep(ep, EpReg::BufRdPtr);
        let addr = self.regs.get_ep(ep, EpReg::BufAddr) + slot * self.regs.get_ep(ep, EpReg::BufMsgSize);
        log::trace!("{}: fetching header of EP{} slot {} @ {:#x}", self.name(), ep, slot, addr);

        let pkt = Packet::read(addr, HEADER_SIZE, self.master_id());
        let delay = self.config.transfer_to_mem_request_latency;
        self.send_mem_request(ctx, pkt, ep, MemReqKind::Header, delay)
    }

    /// The header of the message to reply to arrived from local memory.
    pub(super) fn recv_from_mem(&mut self, ctx: &mut DtuCtx<'_>, cmd: Command, pkt: Packet) -> Result<(), DtuError> {
        if pkt.is_error() {
            log::warn!("{}: cannot read message header @ {:#x}, dropping reply", self.name(), pkt.addr());
            return self.finish_command();
        }
        let Some(request) = MessageHeader::parse(pkt.data()) else {
            return Err(DtuError::UnexpectedPacket {
                what: "short message header",
                addr: pkt.addr(),
            });
        };

        // DATA_SIZE may have changed while the header was fetched
        let size = self.check_message_size(self.regs.get_cmd(CmdReg::DataSize))?;
        let header = MessageHeader {
            label: request.reply_label,
            reply_label: 0,
            length: size as u16,
            sender_core_id: self.core_id(),
            flags: flags::REPLY,
            sender_ep_id: cmd.ep_id as u8,
            reply_ep_id: 0,
            reserved: 0,
        };
        let target = NocAddr::new(request.sender_core_id, request.reply_ep_id, 0);
        let data_addr = self.regs.get_cmd(CmdReg::DataAddr);

        log::debug!("{}: REPLY {} bytes @ {:#x} to {}", self.name(), size, data_addr, target);
        self.stats.replies_sent += 1;

        let delay = self.config.start_msg_transfer_delay;
        self.start_transfer(
            ctx,
            TransferRequest {
                kind: TransferType::LocalRead,
                target,
                local_addr: data_addr,
                size,
                pkt: None,
                header: Some(header),
                ep_id: cmd.ep_id,
                delay,
                last: true,
            },
        )
    }

    /// INC_READ_PTR: release the message at the read pointer.
    pub(super) fn increment_read_ptr(&mut self, ctx: &mut DtuCtx<'_>, ep: usize) -> Result<(), DtuError> {
        let count = self.regs.get_ep(ep, EpReg::BufMsgCnt);
        let total = self.regs.get_dtu(DtuReg::MsgCnt);
        if count == 0 || total == 0 {
            return Err(DtuError::ReadPtrUnderflow { ep });
        }

        let slots = self.regs.get_ep(ep, EpReg::BufSize).max(1);
        let rd_ptr = (self.regs.get_ep(ep, EpReg::BufRdPtr) + 1) % slots;

        self.regs.set_ep(ep, EpReg::BufRdPtr, rd_ptr);
        self.regs.set_ep(ep, EpReg::BufMsgCnt, count - 1);
        self.regs.set_dtu(DtuReg::MsgCnt, total - 1);

        log::trace!("{}: EP{} read pointer now {}, {} messages left", self.name(), ep, rd_ptr, count - 1);

        self.update_suspendable_pin(ctx);
        Ok(())
    }

    /// A message arrived over the NoC.
    pub(super) fn recv_message_from_noc(&mut self, ctx: &mut DtuCtx<'_>, pkt: Packet) -> Result<(), DtuError> {
        let addr = NocAddr::from_raw(pkt.addr());
        let ep = addr.ep_id as usize;

        if ep >= self.config.num_endpoints {
            log::warn!("{}: dropping message for invalid EP{}", self.name(), ep);
            self.stats.messages_dropped += 1;
            self.refuse_noc_request(ctx, pkt);
            return Ok(());
        }

        let Some(header) = MessageHeader::parse(pkt.data()) else {
            log::warn!("{}: dropping malformed message for EP{}", self.name(), ep);
            self.stats.messages_dropped += 1;
            self.refuse_noc_request(ctx, pkt);
            return Ok(());
        };

        let slots = self.regs.get_ep(ep, EpReg::BufSize);
        let slot_size = self.regs.get_ep(ep, EpReg::BufMsgSize);
        let occupied = self.regs.get_ep(ep, EpReg::BufMsgCnt) + self.msg.reserved[ep];

        if occupied >= slots {
            log::warn!(
                "{}: EP{} ring full ({} of {} slots), dropping message from C{}",
                self.name(),
                ep,
                occupied,
                slots,
                header.sender_core_id
            );
            self.stats.messages_dropped += 1;
            self.refuse_noc_request(ctx, pkt);
            return Ok(());
        }
        if pkt.size() as u64 > slot_size {
            log::warn!(
                "{}: message of {} bytes does not fit EP{} slots of {} bytes",
                self.name(),
                pkt.size(),
                ep,
                slot_size
            );
            self.stats.messages_dropped += 1;
            self.refuse_noc_request(ctx, pkt);
            return Ok(());
        }

        let slot = self.regs.get_ep(ep, EpReg::BufWrPtr);
        self.regs.set_ep(ep, EpReg::BufWrPtr, (slot + 1) % slots);
        self.msg.reserved[ep] += 1;

        let local_addr = self.regs.get_ep(ep, EpReg::BufAddr) + slot * slot_size;
        log::debug!(
            "{}: receiving {} from C{}:EP{} into EP{} slot {}",
            self.name(),
            if header.is_reply() { "reply" } else { "message" },
            header.sender_core_id,
            header.sender_ep_id,
            ep,
            slot
        );

        let size = pkt.size();
        let delay = self.config.noc_to_transfer_latency;
        self.start_transfer(
            ctx,
            TransferRequest {
                kind: TransferType::RemoteWrite,
                target: addr,
                local_addr,
                size,
                pkt: Some(pkt),
                header: Some(header),
                ep_id: ep,
                delay,
                last: true,
            },
        )
    }

    /// The message for `ep` is in its slot: make it visible to software.
    pub(super) fn finish_msg_receive(&mut self, ctx: &mut DtuCtx<'_>, ep: usize) {
        self.msg.reserved[ep] = self.msg.reserved[ep].saturating_sub(1);

        let count = self.regs.get_ep(ep, EpReg::BufMsgCnt) + 1;
        let total = self.regs.get_dtu(DtuReg::MsgCnt) + 1;
        self.regs.set_ep(ep, EpReg::BufMsgCnt, count);
        self.regs.set_dtu(DtuReg::MsgCnt, total);
        self.stats.messages_received += 1;

        log::trace!("{}: EP{} has {} pending messages", self.name(), ep, count);

        self.update_suspendable_pin(ctx);
        self.wakeup_core(ctx);
    }
}
