//! Transfer engine.
//!
//! Moves data between local memory and the NoC through a fixed pool of
//! buffers. Each transfer owns one buffer for its whole lifetime and walks
//! local memory in block-aligned chunks, one chunk at a time:
//!
//! ```text
//!   Issued ──► AwaitingMemResponse ──┬──► Issued       (more chunks)
//!                                    └──► Complete
//! ```
//!
//! | Type        | Local memory | Then                                     |
//! |-------------|--------------|------------------------------------------|
//! | LocalRead   | read         | NoC request (MESSAGE or WRITE_REQ)       |
//! | LocalWrite  | write        | memory unit continues the READ command   |
//! | RemoteRead  | read         | NoC response with the data               |
//! | RemoteWrite | write        | message bookkeeping, NoC response        |

use std::collections::VecDeque;

use super::{Dtu, DtuCtx, DtuError, MemReqKind, MessageHeader, NocAddr, NocPacketType, Packet};
use crate::sim::{Addr, Cycles};

/// Direction and purpose of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    /// Local memory to the NoC.
    LocalRead,
    /// NoC read response to local memory.
    LocalWrite,
    /// Local memory to the requester of an inbound read.
    RemoteRead,
    /// Inbound write or message to local memory.
    RemoteWrite,
}

impl TransferType {
    fn reads_memory(self) -> bool {
        matches!(self, TransferType::LocalRead | TransferType::RemoteRead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Issued,
    AwaitingMemResponse,
    Complete,
}

/// Parameters of a transfer.
#[derive(Debug)]
pub(super) struct TransferRequest {
    pub kind: TransferType,
    /// Destination of LocalRead data.
    pub target: NocAddr,
    pub local_addr: Addr,
    pub size: usize,
    /// Inbound packet that is answered when the transfer completes, or the
    /// read response whose data is written.
    pub pkt: Option<Packet>,
    pub header: Option<MessageHeader>,
    pub ep_id: usize,
    pub delay: Cycles,
    /// Last piece of a multi-piece command.
    pub last: bool,
}

#[derive(Debug)]
struct Transfer {
    req: TransferRequest,
    done: usize,
    state: ChunkState,
    failed: bool,
}

#[derive(Debug)]
struct Buffer {
    data: Vec<u8>,
    transfer: Option<Transfer>,
}

/// Buffer pool and transfer bookkeeping.
#[derive(Debug)]
pub(super) struct XferUnit {
    block_size: usize,
    buf_size: usize,
    buffers: Vec<Buffer>,
    queue: VecDeque<TransferRequest>,
}

impl XferUnit {
    pub fn new(block_size: usize, buf_count: usize, buf_size: usize) -> Self {
        let buffers = (0..buf_count)
            .map(|_| Buffer {
                data: vec![0; buf_size],
                transfer: None,
            })
            .collect();
        Self {
            block_size: block_size.max(1),
            buf_size,
            buffers,
            queue: VecDeque::new(),
        }
    }

    fn free_buffer(&self) -> Option<usize> {
        self.buffers.iter().position(|b| b.transfer.is_none())
    }

    /// Number of buffers in use.
    pub fn busy_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.transfer.is_some()).count()
    }

    pub fn is_idle(&self) -> bool {
        self.busy_buffers() == 0 && self.queue.is_empty()
    }

    /// Size of the next chunk at `addr` with `remaining` bytes left.
    fn chunk_size(&self, addr: Addr, remaining: usize) -> usize {
        let to_block_end = self.block_size - (addr % self.block_size as u64) as usize;
        to_block_end.min(remaining)
    }
}

impl Dtu {
    /// Start a transfer, or queue it until a buffer is free.
    pub(super) fn start_transfer(&mut self, ctx: &mut DtuCtx<'_>, req: TransferRequest) -> Result<(), DtuError> {
        if req.size > self.xfer.buf_size {
            return Err(DtuError::MessageTooLarge {
                size: req.size,
                max: self.xfer.buf_size,
            });
        }

        match self.xfer.free_buffer() {
            Some(buf) => self.begin_transfer(ctx, buf, req),
            None => {
                log::trace!("{}: no free buffer, queueing {:?} transfer", self.name(), req.kind);
                self.xfer.queue.push_back(req);
                Ok(())
            }
        }
    }

    fn begin_transfer(&mut self, ctx: &mut DtuCtx<'_>, buf: usize, req: TransferRequest) -> Result<(), DtuError> {
        log::trace!(
            "{}: {:?} of {} bytes @ {:#x} using buffer {}",
            self.name(),
            req.kind,
            req.size,
            req.local_addr,
            buf
        );

        let delay = req.delay;
        let size = req.size;

        let buffer = &mut self.xfer.buffers[buf];
        if !req.kind.reads_memory() {
            if let Some(pkt) = &req.pkt {
                let n = size.min(pkt.data().len());
                buffer.data[..n].copy_from_slice(&pkt.data()[..n]);
            }
        }
        buffer.transfer = Some(Transfer {
            req,
            done: 0,
            state: ChunkState::Issued,
            failed: false,
        });
        self.stats.transfers += 1;

        if size == 0 {
            return self.complete_transfer(ctx, buf);
        }
        self.issue_chunk(ctx, buf, delay)
    }

    fn issue_chunk(&mut self, ctx: &mut DtuCtx<'_>, buf: usize, delay: Cycles) -> Result<(), DtuError> {
        let requester = self.master_id();
        let (pkt, ep_id) = {
            let unit = &self.xfer;
            let Some(xfer) = unit.buffers[buf].transfer.as_ref() else {
                return Err(DtuError::UnexpectedPacket { what: "chunk without transfer", addr: 0 });
            };
            let addr = xfer.req.local_addr + xfer.done as u64;
            let chunk = unit.chunk_size(addr, xfer.req.size - xfer.done);
            let pkt = if xfer.req.kind.reads_memory() {
                Packet::read(addr, chunk, requester)
            } else {
                let data = unit.buffers[buf].data[xfer.done..xfer.done + chunk].to_vec();
                Packet::write(addr, data, requester)
            };
            (pkt, xfer.req.ep_id)
        };

        // Set before sending: in atomic mode the response arrives right away
        if let Some(xfer) = self.xfer.buffers[buf].transfer.as_mut() {
            xfer.state = ChunkState::AwaitingMemResponse;
        }
        self.send_mem_request(ctx, pkt, ep_id, MemReqKind::Transfer(buf), delay)
    }

    /// A chunk of the transfer using `buf` came back from local memory.
    pub(super) fn recv_mem_response(&mut self, ctx: &mut DtuCtx<'_>, buf: usize, pkt: Packet) -> Result<(), DtuError> {
        let Some(buffer) = self.xfer.buffers.get_mut(buf) else {
            return Err(DtuError::UnexpectedPacket { what: "memory response", addr: pkt.addr() });
        };
        let Some(xfer) = buffer.transfer.as_mut() else {
            return Err(DtuError::UnexpectedPacket { what: "memory response", addr: pkt.addr() });
        };
        if xfer.state != ChunkState::AwaitingMemResponse {
            return Err(DtuError::UnexpectedPacket { what: "memory response", addr: pkt.addr() });
        }

        let chunk = pkt.size().min(xfer.req.size - xfer.done);
        if pkt.is_error() {
            xfer.failed = true;
        } else if pkt.is_read() {
            buffer.data[xfer.done..xfer.done + chunk].copy_from_slice(&pkt.data()[..chunk]);
        }
        xfer.done += chunk;
        self.stats.bytes_transferred += chunk as u64;

        if xfer.done < xfer.req.size && chunk > 0 {
            xfer.state = ChunkState::Issued;
            let delay = self.config.transfer_to_mem_request_latency;
            self.issue_chunk(ctx, buf, delay)
        } else {
            xfer.state = ChunkState::Complete;
            self.complete_transfer(ctx, buf)
        }
    }

    fn complete_transfer(&mut self, ctx: &mut DtuCtx<'_>, buf: usize) -> Result<(), DtuError> {
        let Some(xfer) = self.xfer.buffers[buf].transfer.take() else {
            return Err(DtuError::UnexpectedPacket { what: "completion without transfer", addr: 0 });
        };
        let Transfer { req, failed, .. } = xfer;

        log::trace!("{}: {:?} @ {:#x} complete", self.name(), req.kind, req.local_addr);

        match req.kind {
            TransferType::LocalRead => {
                let payload = &self.xfer.buffers[buf].data[..req.size];
                let (packet_type, data) = match &req.header {
                    Some(header) => (NocPacketType::Message, header.with_payload(payload)),
                    None => (NocPacketType::WriteReq, payload.to_vec()),
                };
                if failed {
                    log::warn!("{}: sending data of a failed local read @ {:#x}", self.name(), req.local_addr);
                }
                let pkt = Packet::write(req.target.raw(), data, self.master_id());
                let delay = self.config.transfer_to_noc_latency;
                self.send_noc_request(ctx, packet_type, pkt, delay, false)?;
            }
            TransferType::LocalWrite => {
                self.read_transfer_done(ctx, req.last)?;
            }
            TransferType::RemoteRead => {
                let Some(mut pkt) = req.pkt else {
                    return Err(DtuError::UnexpectedPacket { what: "remote read without request", addr: req.local_addr });
                };
                if failed {
                    pkt.make_error_response();
                } else {
                    pkt.set_data(self.xfer.buffers[buf].data[..req.size].to_vec());
                    pkt.make_response();
                }
                let delay = self.config.transfer_to_noc_latency;
                self.send_noc_response(ctx, pkt, delay);
            }
            TransferType::RemoteWrite => {
                let Some(mut pkt) = req.pkt else {
                    return Err(DtuError::UnexpectedPacket { what: "remote write without request", addr: req.local_addr });
                };
                if req.header.is_some() {
                    self.finish_msg_receive(ctx, req.ep_id);
                }
                if failed {
                    pkt.make_error_response();
                } else {
                    pkt.make_response();
                }
                let delay = self.config.transfer_to_noc_latency;
                self.send_noc_response(ctx, pkt, delay);
            }
        }

        if !self.xfer.queue.is_empty() {
            if let Some(free) = self.xfer.free_buffer() {
                if let Some(next) = self.xfer.queue.pop_front() {
                    self.begin_transfer(ctx, free, next)?;
                }
            }
        }
        Ok(())
    }
}
