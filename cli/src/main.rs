//! Command-line driver for the processor simulator.
//!
//! Loads a whitespace-separated octal word image into main memory,
//! points the instruction counter at a start address and drives the
//! cycle engine until a stop condition or the cycle budget runs out,
//! then prints the final machine state.

use std::ffi::OsString;
use std::fs::read_to_string;
use std::path::PathBuf;
use std::process::exit;

use base::prelude::{lower_half, upper_half};
use clap::Parser;
use tracing::{event, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cpu::{
    CpuContext, CycleState, MemoryConfiguration, MemoryUnit, NullExecutor, SwitchSettings,
};

#[derive(Parser, Debug)]
#[command(about = "36-bit segmented-architecture processor simulator")]
struct Options {
    /// Memory image: whitespace-separated octal words, loaded at
    /// address 0.
    image: PathBuf,

    /// Initial instruction counter (octal).
    #[arg(long, default_value = "0", value_parser = parse_octal)]
    start: u32,

    /// Main memory size in words.
    #[arg(long, default_value_t = 1 << 18)]
    memory_size: u32,

    /// Fault base switches; faults vector at (fault-base << 5).
    #[arg(long, default_value = "2", value_parser = parse_octal)]
    fault_base: u32,

    /// Stop after this many cycles.
    #[arg(long, default_value_t = 1_000_000)]
    max_cycles: u64,

    /// Timer units counted down per cycle (0 disables the timer).
    #[arg(long, default_value_t = 0)]
    timer_rate: u32,

    /// Tracing filter, in RUST_LOG syntax (e.g. "cpu=trace").
    /// Overrides the RUST_LOG environment variable.
    #[arg(long)]
    trace: Option<String>,
}

fn parse_octal(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0o"), 8).map_err(|e| e.to_string())
}

fn load_image(mem: &mut MemoryUnit, text: &str) -> Result<u32, String> {
    let mut addr = 0;
    for token in text.split_whitespace() {
        let word =
            u64::from_str_radix(token, 8).map_err(|e| format!("bad octal word {token:?}: {e}"))?;
        mem.store_word(addr, word).map_err(|e| e.to_string())?;
        addr += 1;
    }
    Ok(addr)
}

fn run(options: &Options) -> Result<(), String> {
    let mut mem = MemoryUnit::new(&MemoryConfiguration {
        size_words: options.memory_size,
    });
    let text = read_to_string(&options.image)
        .map_err(|e| format!("cannot read {}: {e}", options.image.display()))?;
    let loaded = load_image(&mut mem, &text)?;
    event!(Level::INFO, "loaded {} words from image", loaded);

    let mut ctx = CpuContext::new(SwitchSettings {
        fault_base: options.fault_base,
        cpu_num: 0,
    });
    // Cold start: absolute mode, appending and BAR off.
    ctx.regs.ir.abs_mode = true;
    ctx.regs.ir.not_bar_mode = true;
    ctx.regs.ppr.ic = options.start;

    let mut exec = NullExecutor;
    let mut cycles: u64 = 0;
    let outcome = loop {
        if cycles >= options.max_cycles {
            break format!("cycle budget of {} exhausted", options.max_cycles);
        }
        if ctx.cycle == CycleState::Dis && !ctx.events.any_pending() && options.timer_rate == 0 {
            break "delayed until interrupt with nothing pending".to_string();
        }
        if options.timer_rate > 0 {
            ctx.tick_timer(options.timer_rate);
        }
        match ctx.step(&mut mem, &mut exec) {
            Ok(()) => cycles += 1,
            Err(stop) => break format!("stopped: {stop}"),
        }
    };

    println!("{outcome} after {cycles} cycles");
    print_state(&ctx);
    Ok(())
}

fn print_state(ctx: &CpuContext) {
    let snapshot = ctx.snapshot();
    let regs = &snapshot.regs;
    println!("cycle state: {:?}", snapshot.cycle);
    println!(
        "PPR: ring {} segment {:>05o} ic {:>06o} priv {}",
        regs.ppr.prr, regs.ppr.psr, regs.ppr.ic, regs.ppr.p
    );
    println!(
        "A {:>06o},{:>06o}  Q {:>06o},{:>06o}  E {:>03o}",
        upper_half(regs.a),
        lower_half(regs.a),
        upper_half(regs.q),
        lower_half(regs.q),
        regs.e
    );
    println!("working instruction: {}", snapshot.cu.instr);
    for (i, x) in regs.x.iter().enumerate() {
        print!("X{i} {x:>06o}  ");
        if i == 3 {
            println!();
        }
    }
    println!();
    println!(
        "timer {:>09o}  fault register {:>012o}",
        regs.timer, regs.fault_reg
    );
}

fn main() {
    let options = Options::parse_from(std::env::args_os().collect::<Vec<OsString>>());
    let filter = match &options.trace {
        Some(spec) => EnvFilter::new(spec),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    if let Err(e) = run(&options) {
        event!(Level::ERROR, "{e}");
        exit(1);
    }
}
