//! Configuration management for dtu-sim.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`DTU_SIM_ATOMIC`, `DTU_SIM_TILES`)
//! 2. Project-local config file (`./dtu-sim.toml`)
//! 3. User config file (`~/.config/dtu-sim/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # dtu-sim.toml
//!
//! [system]
//! atomic_mode = false
//! num_tiles = 2
//!
//! [dtu]
//! num_endpoints = 8
//! max_noc_packet_size = 1024
//! ```
//!
//! Missing fields take their default values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::dtu::HEADER_SIZE;
use crate::sim::{Addr, Cycles, Tick};

/// Errors while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// Construction parameters of a DTU. Read-only once the DTU exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DtuConfig {
    pub num_endpoints: usize,
    /// Width of the endpoint field in the COMMAND register.
    pub num_cmd_epid_bits: u32,
    /// Transfer engine chunk size in bytes.
    pub block_size: usize,
    pub buf_count: usize,
    pub buf_size: usize,
    /// Largest packet (header included) the DTU puts on the NoC.
    pub max_noc_packet_size: usize,
    /// Start of the register window in the tile's address space and in the
    /// NoC offset space of the tile.
    pub reg_file_base_addr: Addr,

    // Latencies in cycles
    pub register_access_latency: Cycles,
    pub command_to_noc_request_latency: Cycles,
    pub start_msg_transfer_delay: Cycles,
    pub transfer_to_mem_request_latency: Cycles,
    pub transfer_to_noc_latency: Cycles,
    pub noc_to_transfer_latency: Cycles,

    /// Endpoint preconfigured for the cache-bridging path.
    pub memory_ep: usize,
    /// Tile holding the memory reached through `memory_ep`.
    pub memory_pe: u16,
    pub memory_offset: Addr,
    pub memory_size: Addr,
}

impl Default for DtuConfig {
    fn default() -> Self {
        Self {
            num_endpoints: 8,
            num_cmd_epid_bits: 8,
            block_size: 64,
            buf_count: 4,
            buf_size: 1024,
            max_noc_packet_size: 1024,
            reg_file_base_addr: 0xF000_0000,
            register_access_latency: 5,
            command_to_noc_request_latency: 5,
            start_msg_transfer_delay: 5,
            transfer_to_mem_request_latency: 1,
            transfer_to_noc_latency: 3,
            noc_to_transfer_latency: 3,
            memory_ep: 7,
            memory_pe: 0,
            memory_offset: 0,
            memory_size: 0x1000_0000,
        }
    }
}

impl DtuConfig {
    /// Check that the parameters describe a buildable DTU.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_endpoints == 0 || self.num_endpoints > 256 {
            return Err(invalid("num_endpoints", format!("{} not in 1..=256", self.num_endpoints)));
        }
        if self.num_cmd_epid_bits + crate::dtu::Command::OPCODE_BITS > 64 {
            return Err(invalid("num_cmd_epid_bits", "command does not fit into a register"));
        }
        if self.num_cmd_epid_bits < 64 && (1u64 << self.num_cmd_epid_bits) < self.num_endpoints as u64 {
            return Err(invalid(
                "num_cmd_epid_bits",
                format!("{} bits cannot address {} endpoints", self.num_cmd_epid_bits, self.num_endpoints),
            ));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(invalid("block_size", format!("{} is not a power of two", self.block_size)));
        }
        if self.buf_count == 0 {
            return Err(invalid("buf_count", "at least one buffer is required"));
        }
        if self.max_noc_packet_size <= HEADER_SIZE {
            return Err(invalid(
                "max_noc_packet_size",
                format!("must exceed the {}-byte message header", HEADER_SIZE),
            ));
        }
        // The header carries the payload length in 16 bits
        let max_packet = HEADER_SIZE + usize::from(u16::MAX);
        if self.max_noc_packet_size > max_packet {
            return Err(invalid(
                "max_noc_packet_size",
                format!("{} exceeds {} bytes", self.max_noc_packet_size, max_packet),
            ));
        }
        if self.buf_size < self.max_noc_packet_size {
            return Err(invalid(
                "buf_size",
                format!("{} < max_noc_packet_size {}", self.buf_size, self.max_noc_packet_size),
            ));
        }
        if self.memory_ep >= self.num_endpoints {
            return Err(invalid(
                "memory_ep",
                format!("{} >= num_endpoints {}", self.memory_ep, self.num_endpoints),
            ));
        }
        Ok(())
    }
}

/// Parameters of the simulated system around the DTUs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Run all components in instantaneous mode.
    pub atomic_mode: bool,
    pub num_tiles: u16,
    /// Clock period in ticks.
    pub clock_period: Tick,
    /// Size of each tile's scratchpad in bytes.
    pub memory_size: Addr,
    pub memory_latency: Cycles,
    /// Cycles a request occupies the tile crossbar.
    pub xbar_occupancy: Cycles,
    pub noc_hop_latency: Cycles,
    pub noc_bytes_per_cycle: usize,
    /// Start of the cache window. Accesses in `[cache_window_base,
    /// reg_file_base_addr)` are bridged to the memory endpoint.
    pub cache_window_base: Addr,
    /// Stop the simulation at this tick (0 = run until idle).
    pub max_ticks: Tick,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            atomic_mode: false,
            num_tiles: 2,
            clock_period: 1000,
            memory_size: 0x10_0000,
            memory_latency: 2,
            xbar_occupancy: 2,
            noc_hop_latency: 4,
            noc_bytes_per_cycle: 16,
            cache_window_base: 0x1000_0000,
            max_ticks: 0,
        }
    }
}

/// dtu-sim configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub system: SystemConfig,
    pub dtu: DtuConfig,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// The project-local file wins over the user file; environment variables
    /// override both.
    pub fn load() -> Self {
        let mut config = Self::load_local_config()
            .or_else(Self::load_user_config)
            .unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration from an explicit file. Environment variables still apply.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded config from {}", path.display());
        config.apply_env_overrides();
        Ok(config)
    }

    /// Check the configuration as a whole.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dtu.validate()?;

        let sys = &self.system;
        if sys.num_tiles == 0 || u64::from(sys.num_tiles) > 1 << crate::dtu::NocAddr::CORE_BITS {
            return Err(invalid("num_tiles", format!("{} not addressable", sys.num_tiles)));
        }
        if self.dtu.memory_pe >= sys.num_tiles {
            return Err(invalid(
                "memory_pe",
                format!("tile {} does not exist ({} tiles)", self.dtu.memory_pe, sys.num_tiles),
            ));
        }
        if sys.noc_bytes_per_cycle == 0 {
            return Err(invalid("noc_bytes_per_cycle", "must be non-zero"));
        }
        if sys.cache_window_base >= self.dtu.reg_file_base_addr {
            return Err(invalid("cache_window_base", "must lie below the register window"));
        }
        if sys.memory_size > sys.cache_window_base {
            return Err(invalid(
                "memory_size",
                format!("scratchpad overlaps the cache window at {:#x}", sys.cache_window_base),
            ));
        }
        Ok(())
    }

    /// Load user configuration from ~/.config/dtu-sim/config.toml
    fn load_user_config() -> Option<Self> {
        let config_path = Self::user_config_path()?;
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./dtu-sim.toml
    fn load_local_config() -> Option<Self> {
        let local_path = Path::new("dtu-sim.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("dtu-sim.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a file if it exists and parses.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("DTU_SIM_ATOMIC") {
            match parse_bool(&value) {
                Some(atomic) => {
                    log::info!("Using DTU_SIM_ATOMIC from environment: {}", atomic);
                    self.system.atomic_mode = atomic;
                }
                None => log::warn!("Ignoring DTU_SIM_ATOMIC={}", value),
            }
        }
        if let Ok(value) = std::env::var("DTU_SIM_TILES") {
            match value.parse() {
                Ok(tiles) => {
                    log::info!("Using DTU_SIM_TILES from environment: {}", tiles);
                    self.system.num_tiles = tiles;
                }
                Err(_) => log::warn!("Ignoring DTU_SIM_TILES={}", value),
            }
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("dtu-sim").join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# dtu-sim configuration
# Place this file at ~/.config/dtu-sim/config.toml or ./dtu-sim.toml

[system]
# Instantaneous mode: no delays, all NoC traffic resolves within one tick
atomic_mode = false
num_tiles = 2
# Clock period in ticks
clock_period = 1000
# Scratchpad per tile (bytes) and its access latency (cycles)
memory_size = 0x100000
memory_latency = 2
xbar_occupancy = 2
noc_hop_latency = 4
noc_bytes_per_cycle = 16
# Accesses between here and the register window go through the memory endpoint
cache_window_base = 0x10000000
# Stop after this many ticks (0 = run until idle)
max_ticks = 0

[dtu]
num_endpoints = 8
num_cmd_epid_bits = 8
block_size = 64
buf_count = 4
buf_size = 1024
max_noc_packet_size = 1024
reg_file_base_addr = 0xF0000000

# Latencies in cycles
register_access_latency = 5
command_to_noc_request_latency = 5
start_msg_transfer_delay = 5
transfer_to_mem_request_latency = 1
transfer_to_noc_latency = 3
noc_to_transfer_latency = 3

# Endpoint used for cache-bridged accesses
memory_ep = 7
memory_pe = 0
memory_offset = 0
memory_size = 0x10000000
"#
        .to_string()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
