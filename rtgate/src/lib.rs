//! # rtgate - Runtime Profiling-Event Gate and Buffering Engine
//!
//! rtgate lets a managed runtime emit structured diagnostic events (type
//! loads, GC activity, JIT, contention, ...) to a tracing consumer while the
//! state those events describe is changing underneath, including across
//! stop-the-world garbage collections where ordinary emission is unsafe.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Managed Runtime                             │
//! │   mutator threads ── dispatch(event)     collector ── 4 calls   │
//! └───────────┬───────────────────────────────────────┬─────────────┘
//!             │                                       │ pre_pause / paused
//!             ▼                                       ▼ pre_resume / resumed
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Engine (this crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ Hook table   │──▶│  Fire gate   │──▶│  EventSink   │         │
//! │  │ (keywords)   │   │ enter/pause  │   │ channel/json │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! │         ▲                  │ paused           ▲                 │
//! │         │                  ▼                  │ replay          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │ Subscription │   │ Buffered log │──▶│ Batch encoder│         │
//! │  │  + requests  │   │   (arena)    │   │ (bulk types) │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Core
//!
//! - [`gate`]: lock-free producer gate the collector pauses and drains
//! - [`arena`]: bump allocator over `mmap`ed blocks, used only while paused
//! - [`buffered_log`]: binary record log written during a pause and replayed
//!   in allocation order afterwards
//! - [`subscription`] + [`hooks`]: keyword-diff hook wiring and the queue of
//!   on-demand heap-collect requests
//! - [`batch`]: size-bounded bulk type events with parameter logging
//! - [`engine`]: the context object tying it all together
//!
//! ### Edges
//!
//! - [`event`] / [`sink`]: event shapes and where they go
//! - [`config`]: JSON configuration with defaults
//! - [`domain`]: newtypes and error types
//! - [`simulation`]: a simulated runtime driving an engine
//! - [`cli`]: command-line arguments of the `rtgate` binary
//!
//! ## Typical Usage
//!
//! ```bash
//! # Four mutator threads, 10 collections, every keyword
//! rtgate
//!
//! # Two heap dumps of 5000 objects, exported as JSON lines
//! rtgate --heap-dumps 2 --objects 5000 --export events.jsonl
//! ```

pub mod arena;
pub mod batch;
pub mod buffered_log;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod event;
pub mod gate;
pub mod hooks;
pub mod simulation;
pub mod sink;
pub mod subscription;

pub use engine::{CycleReport, Engine, EngineStats};
