//! dtu-sim: Data Transfer Unit simulator

use std::env;
use std::path::Path;

use anyhow::{bail, Context};
use dtu_sim::config::Config;
use dtu_sim::sim::{CpuDriver, Fabric, System};
use dtu_sim::testing::{run_dtutest, run_message, Scenario};

fn print_usage() {
    println!("Usage: dtu-sim [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --atomic             Run without delays (overrides the config)");
    println!("  --timing             Run with modelled latencies (overrides the config)");
    println!("  --config FILE        Load configuration from FILE");
    println!("  --scenario NAME      dtutest (default) or message");
    println!("  --dump-state         Print every DTU's registers at the end");
    println!("  --sample-config      Print a sample configuration file and exit");
    println!("  -h, --help           Show this help");
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    let mut atomic = None;
    let mut config_path = None;
    let mut scenario = Scenario::DtuTest;
    let mut dump_state = false;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--atomic" => atomic = Some(true),
            "--timing" => atomic = Some(false),
            "--dump-state" => dump_state = true,
            "--config" => {
                let path = iter.next().context("--config needs a file")?;
                config_path = Some(path.as_str());
            }
            "--scenario" => {
                let name = iter.next().context("--scenario needs a name")?;
                scenario = match Scenario::from_name(name) {
                    Some(s) => s,
                    None => bail!("unknown scenario '{}' (expected dtutest or message)", name),
                };
            }
            "--sample-config" => {
                print!("{}", Config::sample_config());
                if let Some(path) = Config::user_config_path() {
                    eprintln!("# save as {}", path.display());
                }
                return Ok(());
            }
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            other => {
                print_usage();
                bail!("unexpected argument '{}'", other);
            }
        }
    }

    let mut config = match config_path {
        Some(path) => Config::load_from(Path::new(path))
            .with_context(|| format!("failed to load config from {}", path))?,
        None => Config::load(),
    };
    if let Some(atomic) = atomic {
        config.system.atomic_mode = atomic;
    }

    println!(
        "Running {} on {} tiles ({} mode)",
        scenario.name(),
        config.system.num_tiles,
        if config.system.atomic_mode { "atomic" } else { "timing" }
    );
    println!();

    match scenario {
        Scenario::DtuTest => {
            let system = run_dtutest(config).context("dtutest failed")?;
            if let Some(tester) = system.driver(system.fabric.config().dtu.memory_pe) {
                let results = tester.results();
                println!("Tester");
                println!("======");
                println!("Steps sent:  {}", results.sent.len());
                println!("Completed:   {}", results.completed);
                println!("Retries:     {}", results.retries);
                println!("Errors:      {}", results.errors);
                for read in &results.reads {
                    println!("  step {:2}: read {:#010x} -> {:#04x}", read.step, read.addr, read.value);
                }
                if !tester.is_done() {
                    println!("Warning: tester did not finish");
                }
                println!();
            }
            print_summary(&system, dump_state);
        }
        Scenario::Message => {
            let system = run_message(config).context("message scenario failed")?;
            for (core, tile) in system.fabric.tiles().iter().enumerate() {
                if let Some(cpu) = system.driver(tile.core_id) {
                    println!(
                        "CPU {}: reads {:x?}, {} polls, {} cycles suspended, {} errors{}",
                        core,
                        cpu.reads(),
                        cpu.polls(),
                        cpu.suspended_cycles(),
                        cpu.errors(),
                        if cpu.is_done() { "" } else { " (unfinished)" }
                    );
                }
            }
            println!();
            print_summary(&system, dump_state);
        }
    }

    Ok(())
}

fn print_summary<D: CpuDriver>(system: &System<D>, dump_state: bool) {
    let fabric = &system.fabric;
    println!("Finished at tick {}", fabric.now());
    println!();

    println!("DTUs");
    println!("====");
    for tile in fabric.tiles() {
        let s = tile.dtu.stats();
        println!(
            "  C{}: {} commands, {} sent / {} received / {} dropped / {} replies, \
             {} remote reads, {} remote writes, {} transfers ({} bytes), {} refused",
            tile.core_id,
            s.commands,
            s.messages_sent,
            s.messages_received,
            s.messages_dropped,
            s.replies_sent,
            s.remote_reads,
            s.remote_writes,
            s.transfers,
            s.bytes_transferred,
            s.refused_accesses,
        );
        if s.noc_retries + s.mem_retries > 0 {
            println!("       {} NoC retries, {} memory retries", s.noc_retries, s.mem_retries);
        }
    }
    println!();

    print_memory_stats(fabric);

    let noc = fabric.noc().stats();
    println!("NoC");
    println!("===");
    println!(
        "  {} requests, {} responses, {} bytes, {} refusals, {} misrouted",
        noc.requests, noc.responses, noc.bytes, noc.refusals, noc.misrouted
    );

    if dump_state {
        println!();
        println!("{}", fabric.dump_state());
    }
}

fn print_memory_stats(fabric: &Fabric) {
    println!("Memories");
    println!("========");
    for tile in fabric.tiles() {
        for (master, stats) in tile.memory.all_stats() {
            let name = fabric.masters().name(master).unwrap_or("?");
            println!(
                "  {:14} {:14} {:4} reads ({:5} B) {:4} writes ({:5} B) {:2} errors",
                tile.memory.name(),
                name,
                stats.reads,
                stats.bytes_read,
                stats.writes,
                stats.bytes_written,
                stats.errors
            );
        }
    }
    println!();
}
