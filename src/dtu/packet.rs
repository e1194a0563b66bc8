//! Request/response envelope.
//!
//! The same [`Packet`] type carries CPU-side register and cache traffic,
//! local-memory traffic of the transfer engine and NoC traffic between DTUs.
//! Components that forward a packet and need to know what to do with the
//! response push a [`SenderState`] before sending and pop it when the
//! response comes back.

use smallvec::SmallVec;

use super::DtuError;
use crate::sim::{Addr, CoreId, MasterId, Tick};

/// Memory command of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemCmd {
    ReadReq,
    WriteReq,
    ReadResp,
    WriteResp,
    /// Cache line eviction notice. Never answered.
    CleanEvict,
    /// Coherence invalidation.
    InvalidateReq,
    InvalidateResp,
}

impl MemCmd {
    pub fn is_read(self) -> bool {
        matches!(self, MemCmd::ReadReq | MemCmd::ReadResp)
    }

    pub fn is_write(self) -> bool {
        matches!(self, MemCmd::WriteReq | MemCmd::WriteResp)
    }

    pub fn is_request(self) -> bool {
        !self.is_response()
    }

    pub fn is_response(self) -> bool {
        matches!(self, MemCmd::ReadResp | MemCmd::WriteResp | MemCmd::InvalidateResp)
    }

    pub fn needs_response(self) -> bool {
        matches!(self, MemCmd::ReadReq | MemCmd::WriteReq | MemCmd::InvalidateReq)
    }

    /// The response command for a request.
    pub fn response(self) -> Option<MemCmd> {
        match self {
            MemCmd::ReadReq => Some(MemCmd::ReadResp),
            MemCmd::WriteReq => Some(MemCmd::WriteResp),
            MemCmd::InvalidateReq => Some(MemCmd::InvalidateResp),
            _ => None,
        }
    }
}

/// What a memory response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemReqKind {
    /// A chunk of the transfer using the given buffer.
    Transfer(usize),
    /// The header of a received message, fetched for a reply.
    Header,
}

/// Tag pushed by the DTU on its local-memory requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemSenderState {
    pub ep_id: usize,
    /// Requester of the packet before the DTU claimed it.
    pub requester: MasterId,
    pub kind: MemReqKind,
}

/// Kind of a packet on the NoC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NocPacketType {
    Message,
    ReadReq,
    WriteReq,
    CacheMemReq,
    CacheMemReqFunc,
}

impl NocPacketType {
    pub fn name(self) -> &'static str {
        match self {
            NocPacketType::Message => "MESSAGE",
            NocPacketType::ReadReq => "READ_REQ",
            NocPacketType::WriteReq => "WRITE_REQ",
            NocPacketType::CacheMemReq => "CACHE_MEM_REQ",
            NocPacketType::CacheMemReqFunc => "CACHE_MEM_REQ_FUNC",
        }
    }
}

/// Tag pushed by the DTU on its NoC requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NocSenderState {
    pub packet_type: NocPacketType,
}

/// Sender state stack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Mem(MemSenderState),
    Noc(NocSenderState),
}

impl SenderState {
    fn taxonomy(&self) -> &'static str {
        match self {
            SenderState::Mem(_) => "memory",
            SenderState::Noc(_) => "NoC",
        }
    }
}

/// A request or response in flight.
#[derive(Debug)]
pub struct Packet {
    addr: Addr,
    size: usize,
    cmd: MemCmd,
    data: Vec<u8>,
    requester: MasterId,
    sender_states: SmallVec<[SenderState; 2]>,
    error: bool,
    noc_src: Option<CoreId>,
    /// Delay until the header of the packet arrived.
    pub header_delay: Tick,
    /// Additional delay until the payload arrived.
    pub payload_delay: Tick,
}

impl Packet {
    /// Create a packet with a zeroed payload of `size` bytes.
    pub fn new(addr: Addr, size: usize, cmd: MemCmd, requester: MasterId) -> Self {
        Self {
            addr,
            size,
            cmd,
            data: vec![0; size],
            requester,
            sender_states: SmallVec::new(),
            error: false,
            noc_src: None,
            header_delay: 0,
            payload_delay: 0,
        }
    }

    /// Create a read request.
    pub fn read(addr: Addr, size: usize, requester: MasterId) -> Self {
        Self::new(addr, size, MemCmd::ReadReq, requester)
    }

    /// Create a write request carrying `data`.
    pub fn write(addr: Addr, data: Vec<u8>, requester: MasterId) -> Self {
        let mut pkt = Self::new(addr, 0, MemCmd::WriteReq, requester);
        pkt.size = data.len();
        pkt.data = data;
        pkt
    }

    pub fn addr(&self) -> Addr {
        self.addr
    }

    pub fn set_addr(&mut self, addr: Addr) {
        self.addr = addr;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn cmd(&self) -> MemCmd {
        self.cmd
    }

    pub fn is_read(&self) -> bool {
        self.cmd.is_read()
    }

    pub fn is_write(&self) -> bool {
        self.cmd.is_write()
    }

    pub fn is_response(&self) -> bool {
        self.cmd.is_response()
    }

    pub fn needs_response(&self) -> bool {
        self.cmd.needs_response()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Replace the payload. The size follows the new payload.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.size = data.len();
        self.data = data;
    }

    /// Take the payload out of the packet.
    pub fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn requester(&self) -> MasterId {
        self.requester
    }

    pub fn set_requester(&mut self, requester: MasterId) {
        self.requester = requester;
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Tile that sent this packet over the NoC.
    pub fn noc_src(&self) -> Option<CoreId> {
        self.noc_src
    }

    pub fn set_noc_src(&mut self, src: CoreId) {
        self.noc_src = Some(src);
    }

    /// Turn a request into its response in place.
    pub fn make_response(&mut self) {
        match self.cmd.response() {
            Some(cmd) => self.cmd = cmd,
            None => log::warn!("make_response on {:?} packet @ {:#x}", self.cmd, self.addr),
        }
    }

    /// Turn a request into an error response in place.
    pub fn make_error_response(&mut self) {
        self.make_response();
        self.error = true;
    }

    pub fn push_sender_state(&mut self, state: SenderState) {
        self.sender_states.push(state);
    }

    /// Pop the topmost tag, which must be a memory-side tag.
    pub fn pop_mem_state(&mut self) -> Result<MemSenderState, DtuError> {
        match self.sender_states.pop() {
            Some(SenderState::Mem(s)) => Ok(s),
            Some(other) => {
                let found = other.taxonomy();
                self.sender_states.push(other);
                Err(DtuError::SenderStateMismatch { expected: "memory", found })
            }
            None => Err(DtuError::MissingSenderState { expected: "memory" }),
        }
    }

    /// Pop the topmost tag, which must be a NoC-side tag.
    pub fn pop_noc_state(&mut self) -> Result<NocSenderState, DtuError> {
        match self.sender_states.pop() {
            Some(SenderState::Noc(s)) => Ok(s),
            Some(other) => {
                let found = other.taxonomy();
                self.sender_states.push(other);
                Err(DtuError::SenderStateMismatch { expected: "NoC", found })
            }
            None => Err(DtuError::MissingSenderState { expected: "NoC" }),
        }
    }

    /// Look at the topmost tag, which must be a NoC-side tag.
    pub fn peek_noc_state(&self) -> Result<NocSenderState, DtuError> {
        match self.sender_states.last() {
            Some(SenderState::Noc(s)) => Ok(*s),
            Some(other) => Err(DtuError::SenderStateMismatch {
                expected: "NoC",
                found: other.taxonomy(),
            }),
            None => Err(DtuError::MissingSenderState { expected: "NoC" }),
        }
    }

    /// Number of tags on the stack.
    pub fn sender_state_depth(&self) -> usize {
        self.sender_states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_packet_size_follows_data() {
        let pkt = Packet::write(0x40, vec![1, 2, 3], MasterId(2));
        assert_eq!(pkt.size(), 3);
        assert!(pkt.is_write());
        assert!(pkt.needs_response());
        assert_eq!(pkt.requester(), MasterId(2));
    }

    #[test]
    fn test_make_response() {
        let mut pkt = Packet::read(0, 8, MasterId(0));
        pkt.make_response();
        assert_eq!(pkt.cmd(), MemCmd::ReadResp);
        assert!(pkt.is_read());
        assert!(!pkt.is_error());

        let mut pkt = Packet::write(0, vec![0; 4], MasterId(0));
        pkt.make_error_response();
        assert_eq!(pkt.cmd(), MemCmd::WriteResp);
        assert!(pkt.is_error());
    }

    #[test]
    fn test_sender_states_are_a_stack() {
        let mut pkt = Packet::read(0, 8, MasterId(0));
        pkt.push_sender_state(SenderState::Noc(NocSenderState {
            packet_type: NocPacketType::ReadReq,
        }));
        pkt.push_sender_state(SenderState::Mem(MemSenderState {
            ep_id: 3,
            requester: MasterId(7),
            kind: MemReqKind::Header,
        }));

        let mem = pkt.pop_mem_state().unwrap();
        assert_eq!(mem.ep_id, 3);
        assert_eq!(mem.requester, MasterId(7));
        assert_eq!(pkt.peek_noc_state().unwrap().packet_type, NocPacketType::ReadReq);
        assert_eq!(pkt.pop_noc_state().unwrap().packet_type, NocPacketType::ReadReq);
        assert_eq!(pkt.sender_state_depth(), 0);
    }

    #[test]
    fn test_wrong_taxonomy_is_rejected() {
        let mut pkt = Packet::read(0, 8, MasterId(0));
        assert!(matches!(pkt.pop_noc_state(), Err(DtuError::MissingSenderState { .. })));

        pkt.push_sender_state(SenderState::Noc(NocSenderState {
            packet_type: NocPacketType::Message,
        }));
        assert!(matches!(
            pkt.pop_mem_state(),
            Err(DtuError::SenderStateMismatch { expected: "memory", found: "NoC" })
        ));
        // The tag stays in place
        assert_eq!(pkt.sender_state_depth(), 1);
    }
}
