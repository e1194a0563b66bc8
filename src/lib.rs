//! dtu-sim library
//!
//! Model of a Data Transfer Unit (DTU): the per-tile engine that moves
//! messages and memory contents between tiles over a network-on-chip.
//!
//! - [`dtu`]: the DTU itself (register file, command unit, message and
//!   memory units, transfer engine, NoC addressing and message headers)
//! - [`sim`]: the event queue, scratchpad memory, NoC fabric and tiles the
//!   DTU is driven by
//! - [`testing`]: traffic generators and end-to-end scenarios
//! - [`config`]: TOML configuration with environment overrides

pub mod config;
pub mod dtu;
pub mod sim;
pub mod testing;
