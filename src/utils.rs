use ansi_term::Colour::Fixed;
use clap::builder::styling::{AnsiColor, Color, Style};

use crate::behavior::StageStatus;
use crate::cpu::{DataMemory, RegisterFile};
use crate::isa::Word;

const GRAY: u8 = 8;

/// Parse a numeric literal, decimal or `0x`-prefixed hex.
pub fn parse_literal(s: &str) -> Option<u32> {
    if let Ok(r) = s.parse() {
        return Some(r);
    }
    if let Ok(r) = u32::from_str_radix(s.strip_prefix("0x")?, 16) {
        return Some(r);
    }
    None
}

/// Cargo-like terminal color style for the command line interface.
pub fn arg_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .usage(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::BrightGreen))),
        )
        .header(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::BrightGreen))),
        )
        .literal(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
        )
        .error(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
        )
        .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
}

/// Logging configuration: compact terminal output, plus an optional JSON
/// file layer for machine consumption.
pub fn logging_setup(
    max_level: tracing::Level,
    log_file: Option<impl std::io::Write + Clone + Send + 'static>,
) {
    use tracing_subscriber::{filter, prelude::*};

    let filter = filter::filter_fn(move |meta| *meta.level() <= max_level);

    let terminal_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_file(false)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(filter.clone());

    let file_log = log_file.map(|file| {
        let file = std::sync::Mutex::new(file);
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(move || file.lock().unwrap().clone())
            .with_filter(filter)
    });

    tracing_subscriber::registry()
        .with(file_log)
        .with(terminal_log)
        .init();
}

/// One pipeline slot of the per-cycle trace.
pub fn format_slot(status: Option<&StageStatus>) -> String {
    match status {
        Some(s) => format!("@{} [{}] (t_new={})", s.pc, s.disasm, s.t_new),
        None => Fixed(GRAY).paint("bubble").to_string(),
    }
}

fn format_reg_val(val: Word) -> String {
    if val == Word::ZERO {
        Fixed(GRAY).paint("00000000").to_string()
    } else {
        val.to_string()
    }
}

/// Register file dump, four registers per row.
pub fn reg_dump(regs: &RegisterFile) -> String {
    let mut out = String::new();
    for row in 0..8 {
        for col in 0..4 {
            let reg = (row * 4 + col) as u8;
            out.push_str(&format!("${reg:2} {}   ", format_reg_val(regs.read(reg))));
        }
        out.pop();
        out.pop();
        out.pop();
        out.push('\n');
    }
    out
}

/// Every touched data memory word, one per line.
pub fn mem_dump(mem: &DataMemory) -> String {
    let mut out = String::new();
    for (addr, val) in mem.snapshot() {
        out.push_str(&format!("{addr}: {val}\n"));
    }
    out
}
