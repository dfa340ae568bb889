//! # rtgate - Main Entry Point
//!
//! Runs the simulated runtime against an engine and reports what came out:
//! - Events flow through a bounded channel to a consumer thread
//! - With `--export`, the consumer writes them as JSON lines
//! - A one-line summary (and optionally full engine statistics) at the end

#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use log::info;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::time::Duration;

use rtgate::cli::Args;
use rtgate::config::EngineConfig;
use rtgate::domain::ConfigError;
use rtgate::event::Event;
use rtgate::simulation::{self, SimulationConfig};
use rtgate::sink::{ChannelSink, EventSink, JsonLinesSink};
use rtgate::Engine;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_CONFIG: i32 = 78;

type ExportSink = JsonLinesSink<BufWriter<File>>;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.chain().any(|cause| cause.is::<ConfigError>()) {
        EXIT_CONFIG
    } else {
        EXIT_ERROR
    }
}

/// Load the configuration file (if any) and apply command-line overrides
fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match args.config {
        Some(ref path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(block_size) = args.block_size {
        config.arena.block_size = block_size;
    }
    if let Some(max_bytes) = args.max_arena_bytes {
        config.arena.max_bytes = Some(max_bytes);
    }

    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

/// Drain the event channel until every sender is gone
fn consume(rx: &Receiver<Event>, export: Option<&ExportSink>) -> BTreeMap<&'static str, u64> {
    let mut counts = BTreeMap::new();
    for event in rx {
        *counts.entry(event.name()).or_insert(0) += 1;
        if let Some(export) = export {
            export.fire(event);
        }
    }
    counts
}

fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;
    let config = load_config(&args)?;

    if !quiet {
        println!("rtgate v{}", env!("CARGO_PKG_VERSION"));
        println!("keywords: {} (level {})", args.keywords, args.level);
        println!("producers: {}, collections: {}", args.producers, args.cycles);
    }

    let export = args
        .export
        .as_ref()
        .map(|path| -> Result<ExportSink> {
            let file = File::create(path)
                .with_context(|| format!("Failed to create export file {}", path.display()))?;
            Ok(JsonLinesSink::new(BufWriter::new(file)))
        })
        .transpose()?;

    // Consumer thread owns the export sink until the channel closes
    let (sink, rx) = ChannelSink::bounded(args.channel_capacity);
    let sink = Arc::new(sink);
    let consumer = std::thread::spawn(move || {
        let counts = consume(&rx, export.as_ref());
        (counts, export)
    });

    let engine = Arc::new(Engine::new(config, sink.clone(), Arc::new(simulation::type_table())));
    let sim_config = SimulationConfig {
        producers: args.producers,
        cycles: args.cycles,
        objects: args.objects,
        heap_dumps: args.heap_dumps,
        interval: Duration::from_millis(args.interval_ms),
        keywords: args.keywords,
        level: args.level,
    };
    let report = simulation::run(&engine, &sim_config);

    engine.shutdown();
    let stats = engine.stats();
    let channel_dropped = sink.dropped();
    // Last senders: closing them ends the consumer loop
    drop(engine);
    drop(sink);

    let (counts, export) = consumer.join().map_err(|_| anyhow::anyhow!("Event consumer thread panicked"))?;
    let delivered: u64 = counts.values().sum();

    if let Some(export) = export {
        export.flush().context("Failed to flush exported events")?;
        if export.failed() > 0 {
            anyhow::bail!("{} events could not be written to the export file", export.failed());
        }
        if !quiet {
            if let Some(ref path) = args.export {
                println!("saved: {} ({} events)", path.display(), export.written());
            }
        }
    }

    info!("event counts: {counts:?}");
    if !quiet {
        eprintln!(
            "\n{} collections in {:.1}s, {} events delivered (producers: {}, replayed: {}, bulk types: {}, heap dumps: {}, dropped: {} log / {} channel, longest drain: {:.2}ms)",
            report.cycles,
            report.elapsed.as_secs_f64(),
            delivered,
            report.producer_events,
            report.records_replayed,
            report.bulk_type_events,
            report.heap_dumps_serviced,
            stats.log.dropped,
            channel_dropped,
            report.longest_drain.as_secs_f64() * 1000.0,
        );
    }

    if args.stats {
        let json = serde_json::to_string_pretty(&stats).context("Failed to serialize statistics")?;
        println!("{json}");
    }

    Ok(())
}
