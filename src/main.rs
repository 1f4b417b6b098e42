//! profjoin: correlate recorded GPU submissions and inspect process mappings.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{info, Level};

use profjoin::{
    replay_capture, write_slices, CorrelatorConfig, LiveProcessMemory, MemoryMaps, ModuleMaps,
    ProcessMemory,
};

#[derive(Parser)]
#[command(name = "profjoin")]
#[command(about = "Correlate GPU submissions with kernel jobs")]
#[command(version)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON-lines capture and write the correlated slices
    Correlate {
        /// Capture file with one event per line
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (stdout if not provided)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// CPU timestamp used for begins that happened before the capture
        #[arg(long, default_value_t = 0)]
        begin_capture_ts: u64,
    },
    /// Look up an address in the mappings of a running process
    Maps {
        #[arg(short, long)]
        pid: i32,

        /// Address to look up, hex with or without 0x prefix
        #[arg(short, long, value_parser = parse_address)]
        address: u64,
    },
}

fn parse_address(value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).with_context(|| format!("Invalid address: {value}"))
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

fn run_correlate(input: PathBuf, output: Option<PathBuf>, begin_capture_ts: u64) -> Result<()> {
    if !input.exists() {
        bail!("Capture not found: {}", input.display());
    }

    let file =
        File::open(&input).with_context(|| format!("Failed to open {}", input.display()))?;
    let config = CorrelatorConfig {
        begin_capture_cpu_ts: begin_capture_ts,
    };
    let replay = replay_capture(BufReader::new(file), config)?;

    match output {
        Some(path) => {
            let file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_slices(BufWriter::new(file), &replay.slices)?;
            info!("Wrote {} slices to {}", replay.slices.len(), path.display());
        }
        None => write_slices(io::stdout().lock(), &replay.slices)?,
    }
    Ok(())
}

fn run_maps(pid: i32, address: u64) -> Result<()> {
    let maps = ModuleMaps::from_pid(pid)?;
    let Some(map) = maps.find(address) else {
        bail!("Address {address:#x} is not mapped in process {pid}");
    };

    let perms = format!(
        "{}{}{}",
        if map.flags & profjoin::maps::PROT_READ != 0 { 'r' } else { '-' },
        if map.flags & profjoin::maps::PROT_WRITE != 0 { 'w' } else { '-' },
        if map.is_executable() { 'x' } else { '-' },
    );
    println!(
        "{:#x}-{:#x} {} {:#x} {}",
        map.start, map.end, perms, map.offset, map.name
    );

    match LiveProcessMemory::new(pid).read_u64(address) {
        Some(value) => println!("{address:#x}: {value:#018x}"),
        None => println!("{address:#x}: <unreadable>"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Correlate {
            input,
            output,
            begin_capture_ts,
        } => run_correlate(input, output, begin_capture_ts),
        Commands::Maps { pid, address } => run_maps(pid, address),
    }
}
