use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;

use rust_x86::cpu::CpuState;
use rust_x86::{Cpu, CpuConfig, CpuModel, ExecMode};

#[derive(Debug, Clone, Copy)]
struct Entry {
    cs: u16,
    ip: u16,
}

#[derive(Parser, Debug)]
#[command(name = "rust-x86", version, about = "Runs a flat binary on an emulated x86 core")]
struct Args {
    /// Flat binary image
    image: PathBuf,

    #[arg(long, value_enum, default_value = "486dx")]
    model: CpuModel,

    /// Physical address the image is copied to
    #[arg(long, default_value = "0x7C00", value_parser = parse_number)]
    load_addr: u32,

    /// Real-mode entry point as CS:IP in hex; defaults to the load address
    #[arg(long, value_parser = parse_entry)]
    entry: Option<Entry>,

    #[arg(long, default_value_t = 10_000_000)]
    cycles: i32,

    /// Use the recompiler REP batch size
    #[arg(long)]
    recompiler: bool,

    /// Leave the coprocessor socket empty
    #[arg(long)]
    no_fpu: bool,

    /// Log every instruction
    #[arg(long)]
    trace: bool,
}

fn parse_number(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{s}': {e}"))
}

fn parse_entry(s: &str) -> Result<Entry, String> {
    let (cs, ip) = s.split_once(':').ok_or_else(|| format!("expected CS:IP, got '{s}'"))?;
    let hex = |v: &str| u16::from_str_radix(v, 16).map_err(|e| format!("invalid entry '{s}': {e}"));
    Ok(Entry { cs: hex(cs)?, ip: hex(ip)? })
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let level = if args.trace { "trace" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let image = std::fs::read(&args.image).map_err(|e| format!("{}: {e}", args.image.display()))?;
    let config = CpuConfig {
        model: args.model,
        exec_mode: if args.recompiler { ExecMode::Recompiler } else { ExecMode::Interpreter },
        fpu: !args.no_fpu,
        ..CpuConfig::default()
    };
    if args.load_addr as usize + image.len() > config.memory_size {
        return Err(format!("image does not fit below {:#X}", config.memory_size).into());
    }

    let mut cpu = Cpu::new(config);
    cpu.bus.load(args.load_addr as usize, &image);
    let entry = args.entry.unwrap_or(Entry {
        cs: (args.load_addr >> 4) as u16,
        ip: (args.load_addr & 0xF) as u16,
    });
    cpu.load_cs_real(entry.cs);
    cpu.eip = entry.ip as u32;
    log::info!(
        "{:?}: {} bytes at {:#X}, entry {:04X}:{:04X}",
        args.model,
        image.len(),
        args.load_addr,
        entry.cs,
        entry.ip
    );

    cpu.run(args.cycles);

    let state = match cpu.state {
        CpuState::Running => "cycle budget spent",
        CpuState::Halted => "halted",
        CpuState::Shutdown => "shutdown",
    };
    println!("{state} after {} instructions", cpu.ins_count);
    println!("{}", cpu.registers());
    Ok(())
}
