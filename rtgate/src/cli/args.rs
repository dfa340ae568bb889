//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::domain::{Keywords, Level};
use rtgate_common::keywords;

#[derive(Parser)]
#[command(
    name = "rtgate",
    about = "Drive a simulated managed runtime through the profiling-event engine",
    after_help = "\
EXAMPLES:
    rtgate                                        Every keyword, 10 collections
    rtgate --keywords gc,loader --cycles 50       Only GC and loader events
    rtgate --heap-dumps 2 --export events.jsonl   Two heap dumps, exported"
)]
pub struct Args {
    /// Engine configuration file (JSON)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Mutator threads producing events
    #[arg(short, long, default_value = "4")]
    pub producers: usize,

    /// Garbage collections to run
    #[arg(long, default_value = "10")]
    pub cycles: u32,

    /// Objects reported per heap dump
    #[arg(long, default_value = "1000")]
    pub objects: usize,

    /// Heap-collect requests to queue (one per collection)
    #[arg(long, default_value = "0")]
    pub heap_dumps: u32,

    /// Mutator time between collections, in milliseconds
    #[arg(long, default_value = "20")]
    pub interval_ms: u64,

    /// Session keywords: names (gc,loader,...), hex (0x7ff) or "all"
    #[arg(short, long, default_value = "all", value_parser = parse_keywords)]
    pub keywords: Keywords,

    /// Session level: name (verbose, informational, ...) or 0-5
    #[arg(short, long, default_value = "verbose", value_parser = parse_level)]
    pub level: Level,

    /// Override the arena block size (bytes)
    #[arg(long, value_name = "BYTES")]
    pub block_size: Option<usize>,

    /// Override the arena budget (bytes)
    #[arg(long, value_name = "BYTES")]
    pub max_arena_bytes: Option<usize>,

    /// Capacity of the channel between the engine and the event consumer
    #[arg(long, default_value = "65536")]
    pub channel_capacity: usize,

    /// Export every event as JSON lines
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Print final engine statistics as JSON
    #[arg(long)]
    pub stats: bool,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

const KEYWORD_NAMES: [(&str, u64); 11] = [
    ("gc", keywords::GC),
    ("gc-handle", keywords::GC_HANDLE),
    ("loader", keywords::LOADER),
    ("jit", keywords::JIT),
    ("contention", keywords::CONTENTION),
    ("exception", keywords::EXCEPTION),
    ("threading", keywords::THREADING),
    ("type", keywords::TYPE),
    ("heap-dump", keywords::GC_HEAP_DUMP),
    ("heap-collect", keywords::GC_HEAP_COLLECT),
    ("allocation", keywords::GC_ALLOCATION),
];

/// Parse a keyword mask from names, hex or decimal
///
/// # Errors
/// Returns a message naming the unknown keyword or malformed number.
pub fn parse_keywords(s: &str) -> Result<Keywords, String> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("all") {
        return Ok(Keywords::ALL);
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map(Keywords).map_err(|e| format!("invalid keyword mask '{s}': {e}"));
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse().map(Keywords).map_err(|e| format!("invalid keyword mask '{s}': {e}"));
    }

    let mut mask = 0;
    for name in s.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let bit = KEYWORD_NAMES
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, bit)| *bit)
            .ok_or_else(|| format!("unknown keyword '{name}'"))?;
        mask |= bit;
    }
    Ok(Keywords(mask))
}

/// Parse a session level from its name or number
///
/// # Errors
/// Returns a message for unknown names and numbers above 5.
pub fn parse_level(s: &str) -> Result<Level, String> {
    if let Ok(n) = s.parse::<u8>() {
        return if n <= 5 { Ok(Level::from(n)) } else { Err(format!("level {n} out of range 0-5")) };
    }
    match s.to_ascii_lowercase().as_str() {
        "log-always" | "logalways" => Ok(Level::LogAlways),
        "critical" => Ok(Level::Critical),
        "error" => Ok(Level::Error),
        "warning" => Ok(Level::Warning),
        "informational" | "info" => Ok(Level::Informational),
        "verbose" => Ok(Level::Verbose),
        other => Err(format!("unknown level '{other}'")),
    }
}
