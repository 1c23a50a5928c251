use anyhow::{Context, Result};
use clap::Parser;

use mips_pipe_rs::pipeline::Stage;
use mips_pipe_rs::{utils, Cpu, Program, Word};

// MIPS pipeline simulator: load a machine-code file and step it to halt
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = None,
    styles = utils::arg_styles(),
    arg_required_else_help = true,
)]
struct Args {
    /// Path to the program file (one 32-bit machine word per line)
    input: String,

    /// Stop after this many cycles even without a halt
    #[arg(long, default_value_t = 10_000)]
    max_cycles: u64,

    /// Seed a data memory word before the run, e.g. --poke 0x10=0xdeadbeef
    #[arg(long, value_name = "ADDR=WORD")]
    poke: Vec<String>,

    /// Print the program listing and exit
    #[arg(long)]
    list: bool,

    /// Report only the final data memory contents
    #[arg(long)]
    diff: bool,

    /// Suppress the per-cycle trace
    #[arg(short, long)]
    quiet: bool,

    /// Print debug logs during simulation
    #[arg(short, long)]
    verbose: bool,
}

fn parse_poke(arg: &str) -> Result<(Word, Word)> {
    let (addr, val) = arg
        .split_once('=')
        .with_context(|| format!("`{arg}`: --poke expects ADDR=WORD"))?;
    let addr = utils::parse_literal(addr.trim())
        .with_context(|| format!("`{arg}`: bad address literal"))?;
    let val = utils::parse_literal(val.trim())
        .with_context(|| format!("`{arg}`: bad value literal"))?;
    Ok((Word::new(addr), Word::new(val)))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    utils::logging_setup(log_level, None::<&std::fs::File>);

    let content = std::fs::read_to_string(&args.input)
        .with_context(|| format!("could not read file `{}`", &args.input))?;
    let program = Program::from_source(&content)
        .with_context(|| format!("could not load program `{}`", &args.input))?;

    if args.list {
        print!("{program}");
        return Ok(());
    }

    let mut cpu = Cpu::new(program);
    for arg in &args.poke {
        let (addr, val) = parse_poke(arg)?;
        cpu.poke_mem(addr, val);
    }

    while !cpu.halted() && cpu.cycle() < args.max_cycles {
        cpu.step();
        if args.quiet || args.diff {
            continue;
        }
        if let Some(snap) = cpu.snapshot() {
            println!("{:=^60}", format!(" Cycle {} ", snap.cycle));
            for stage in Stage::PIPELINE {
                println!("{:4} {}", stage.name(), utils::format_slot(snap.pipeline.get(stage)));
            }
            for behavior in &snap.behaviors {
                println!("{behavior}");
            }
            println!();
        }
    }

    if args.diff {
        print!("{}", utils::mem_dump(cpu.mem()));
        return Ok(());
    }

    if cpu.halted() {
        println!("halted at cycle {}", cpu.cycle());
    } else {
        println!("max cycles ({}) reached without halt", args.max_cycles);
    }
    println!("{}", utils::reg_dump(cpu.regs()));
    let mem = utils::mem_dump(cpu.mem());
    if !mem.is_empty() {
        print!("{mem}");
    }
    Ok(())
}
