//! Traffic generators and end-to-end scenarios.
//!
//! - `dtutest`: the [`DtuTester`] on the memory tile issues local writes,
//!   reads and writes through the memory endpoint and local reads.
//! - `message`: two [`ScriptedCpu`]s exchange a message and a reply and
//!   release both receive slots.
//!
//! # Usage
//!
//! ```bash
//! dtu-sim --scenario dtutest --timing
//! dtu-sim --scenario message --atomic --dump-state
//! ```

pub mod dtu_tester;
pub mod scripted_cpu;

pub use dtu_tester::{DtuTester, TesterRead, TesterResults};
pub use scripted_cpu::{CpuOp, ScriptedCpu};

use crate::config::{Config, ConfigError};
use crate::dtu::{CmdReg, Command, CommandOpcode, EpReg, Packet, RegFile, Register, HEADER_SIZE};
use crate::sim::{Addr, CoreId, Fabric, MasterId, SimError, System};

/// Scenarios the binary can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    DtuTest,
    Message,
}

impl Scenario {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "dtutest" => Some(Scenario::DtuTest),
            "message" => Some(Scenario::Message),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scenario::DtuTest => "dtutest",
            Scenario::Message => "message",
        }
    }
}

/// Address of `reg` as seen from the CPU side.
pub fn reg_addr(config: &Config, reg: Register) -> Addr {
    config.dtu.reg_file_base_addr + RegFile::offset_of(reg)
}

/// Run the dtutest scenario on the memory tile.
pub fn run_dtutest(config: Config) -> Result<System<DtuTester>, SimError> {
    let tile = config.dtu.memory_pe;
    let mut fabric = Fabric::new(config)?;
    let tester = DtuTester::new(tile, &mut fabric);

    let mut system = System::new(fabric);
    system.attach(tile, tester)?;
    let ticks = system.run()?;
    log::info!("dtutest finished after {} ticks", ticks);
    Ok(system)
}

const SENDER: CoreId = 0;
const RECEIVER: CoreId = 1;

const SEND_EP: usize = 0;
const RECV_EP: usize = 1;
const REPLY_EP: usize = 2;

const RECV_BUF: Addr = 0x1000;
const REPLY_BUF: Addr = 0x3000;
const SLOT_SIZE: u64 = 64;

/// Payload of the message sent by tile 0.
pub const MESSAGE_PAYLOAD: u64 = 0xCAFE_F00D;
/// Payload of the reply sent by tile 1.
pub const REPLY_PAYLOAD: u64 = 0xBEEF;

/// Configure endpoints the way a loader would, before any core runs.
fn boot_write(fabric: &mut Fabric, core: CoreId, reg: Register, value: u64) -> Result<(), SimError> {
    let addr = reg_addr(fabric.config(), reg);
    let pkt = Packet::write(addr, value.to_le_bytes().to_vec(), MasterId::default());
    match fabric.functional_access(core, pkt)? {
        Some(resp) if resp.is_error() => {
            log::warn!("boot write of {} on tile {} failed", reg, core);
        }
        _ => {}
    }
    Ok(())
}

/// Run the message scenario: tile 0 sends to tile 1, tile 1 replies.
pub fn run_message(config: Config) -> Result<System<ScriptedCpu>, SimError> {
    if config.system.num_tiles < 2 {
        return Err(ConfigError::Invalid {
            field: "system.num_tiles",
            reason: "the message scenario needs two tiles".into(),
        }
        .into());
    }

    let mut fabric = Fabric::new(config)?;

    boot_write(&mut fabric, SENDER, Register::Ep(SEND_EP, EpReg::TgtCoreId), RECEIVER as u64)?;
    boot_write(&mut fabric, SENDER, Register::Ep(SEND_EP, EpReg::TgtEpId), RECV_EP as u64)?;
    boot_write(&mut fabric, SENDER, Register::Ep(SEND_EP, EpReg::Label), 0x1111)?;
    for (core, ep, buf) in [(RECEIVER, RECV_EP, RECV_BUF), (SENDER, REPLY_EP, REPLY_BUF)] {
        boot_write(&mut fabric, core, Register::Ep(ep, EpReg::BufAddr), buf)?;
        boot_write(&mut fabric, core, Register::Ep(ep, EpReg::BufMsgSize), SLOT_SIZE)?;
        boot_write(&mut fabric, core, Register::Ep(ep, EpReg::BufSize), 2)?;
    }

    let reg = |r: CmdReg| reg_addr(fabric.config(), Register::Cmd(r));
    let command = |op, ep| Command::encode(op, ep);
    let payload_at = |buf: Addr| buf + HEADER_SIZE as Addr;

    let sender = vec![
        CpuOp::Write(0x100, MESSAGE_PAYLOAD),
        CpuOp::Write(reg(CmdReg::DataAddr), 0x100),
        CpuOp::Write(reg(CmdReg::DataSize), 8),
        CpuOp::Write(reg(CmdReg::ReplyEpId), REPLY_EP as u64),
        CpuOp::Write(reg(CmdReg::ReplyLabel), 0x2222),
        CpuOp::Write(reg(CmdReg::Command), command(CommandOpcode::Send, SEND_EP)),
        CpuOp::WaitCommand,
        CpuOp::WaitMessage(REPLY_EP),
        CpuOp::Read(payload_at(REPLY_BUF)),
        CpuOp::Write(reg(CmdReg::Command), command(CommandOpcode::IncReadPtr, REPLY_EP)),
        CpuOp::WaitCommand,
    ];
    let receiver = vec![
        CpuOp::Suspend,
        CpuOp::WaitMessage(RECV_EP),
        CpuOp::Read(payload_at(RECV_BUF)),
        CpuOp::Write(0x2000, REPLY_PAYLOAD),
        CpuOp::Write(reg(CmdReg::DataAddr), 0x2000),
        CpuOp::Write(reg(CmdReg::DataSize), 8),
        CpuOp::Write(reg(CmdReg::Command), command(CommandOpcode::Reply, RECV_EP)),
        CpuOp::WaitCommand,
        CpuOp::Write(reg(CmdReg::Command), command(CommandOpcode::IncReadPtr, RECV_EP)),
        CpuOp::WaitCommand,
    ];

    let sender = ScriptedCpu::new(SENDER, &mut fabric, sender);
    let receiver = ScriptedCpu::new(RECEIVER, &mut fabric, receiver);

    let mut system = System::new(fabric);
    system.attach(SENDER, sender)?;
    system.attach(RECEIVER, receiver)?;
    let ticks = system.run()?;
    log::info!("message scenario finished after {} ticks", ticks);
    Ok(system)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtu::DtuReg;

    fn config(atomic: bool) -> Config {
        let mut config = Config::default();
        config.system.atomic_mode = atomic;
        config.system.max_ticks = 10_000_000;
        config
    }

    fn expected_reads() -> Vec<TesterRead> {
        let base = Config::default().system.cache_window_base;
        let remote = (0..4u32).map(|i| TesterRead {
            step: 4 + i,
            addr: base + i as Addr,
            value: i as u8,
        });
        let local = (0..4u32).map(|i| TesterRead {
            step: 12 + i,
            addr: 8 + i as Addr,
            value: 0xA0 | i as u8,
        });
        remote.chain(local).collect()
    }

    #[test]
    fn test_scenario_names() {
        assert_eq!(Scenario::from_name("dtutest"), Some(Scenario::DtuTest));
        assert_eq!(Scenario::from_name(Scenario::Message.name()), Some(Scenario::Message));
        assert_eq!(Scenario::from_name("bogus"), None);
    }

    #[test]
    fn test_dtutest_atomic() {
        let system = run_dtutest(config(true)).unwrap();
        let tester = system.driver(0).unwrap();
        assert!(tester.is_done());

        let results = tester.results();
        assert_eq!(results.sent, (0..16).collect::<Vec<_>>());
        assert_eq!(results.completed, 16);
        assert_eq!(results.errors, 0);
        assert_eq!(results.reads, expected_reads());
        assert!(system.fabric.is_quiescent());
    }

    #[test]
    fn test_dtutest_timing_with_retries() {
        let system = run_dtutest(config(false)).unwrap();
        let tester = system.driver(0).unwrap();
        assert!(tester.is_done());

        let results = tester.results();
        // No step skipped, none sent twice
        assert_eq!(results.sent, (0..16).collect::<Vec<_>>());
        assert_eq!(results.completed, 16);
        assert_eq!(results.reads, expected_reads());
        // The crossbar is busy for two cycles, the tester ticks every cycle
        assert!(results.retries > 0);
        assert!(system.fabric.is_quiescent());
    }

    #[test]
    fn test_atomic_and_timing_end_in_same_state() {
        let atomic = run_dtutest(config(true)).unwrap();
        let timing = run_dtutest(config(false)).unwrap();

        for (a, t) in atomic.fabric.tiles().iter().zip(timing.fabric.tiles()) {
            assert!(a.memory.same_contents(&t.memory));
            assert_eq!(a.dtu.regs(), t.dtu.regs());
        }
        assert!(timing.fabric.now() > atomic.fabric.now());
    }

    #[test]
    fn test_message_scenario() {
        for atomic in [true, false] {
            let system = run_message(config(atomic)).unwrap();
            let sender = system.driver(SENDER).unwrap();
            let receiver = system.driver(RECEIVER).unwrap();

            assert!(sender.is_done());
            assert!(receiver.is_done());
            assert_eq!(sender.reads(), &[REPLY_PAYLOAD]);
            assert_eq!(receiver.reads(), &[MESSAGE_PAYLOAD]);
            assert_eq!(sender.errors() + receiver.errors(), 0);

            for tile in system.fabric.tiles() {
                assert_eq!(tile.dtu.regs().get_dtu(DtuReg::MsgCnt), 0);
                assert!(!tile.dtu.is_command_in_flight());
            }
            let stats = system.fabric.tile(SENDER).unwrap().dtu.stats();
            assert_eq!(stats.messages_sent, 1);
            assert_eq!(stats.messages_received, 1);
            assert_eq!(system.fabric.tile(RECEIVER).unwrap().dtu.stats().replies_sent, 1);
        }
    }

    #[test]
    fn test_receiver_is_woken_by_message() {
        let system = run_message(config(false)).unwrap();
        let receiver_tile = system.fabric.tile(RECEIVER).unwrap();
        assert_eq!(receiver_tile.core.wakeups(), 1);
        assert!(system.driver(RECEIVER).unwrap().suspended_cycles() > 0);
    }

    #[test]
    fn test_message_scenario_needs_two_tiles() {
        let mut config = config(true);
        config.system.num_tiles = 1;
        assert!(matches!(run_message(config), Err(SimError::Config(_))));
    }

    #[test]
    fn test_functional_access_through_memory_endpoint() {
        let mut fabric = Fabric::new(config(false)).unwrap();
        fabric.tile_mut(0).unwrap().memory.write_bytes(0x40, &[0x11, 0x22]);

        let base = fabric.config().system.cache_window_base;
        let resp = fabric
            .functional_access(1, Packet::read(base + 0x40, 2, MasterId(9)))
            .unwrap()
            .unwrap();
        assert!(!resp.is_error());
        assert_eq!(resp.addr(), base + 0x40);
        assert_eq!(resp.data(), &[0x11, 0x22]);
        // Functional accesses leave no events behind
        assert!(fabric.next_event_time().is_none());
    }
}
