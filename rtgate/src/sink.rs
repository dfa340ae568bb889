//! # Event Sinks
//!
//! The raw emission primitive. The engine calls [`EventSink::fire`] once per
//! event and never looks at the result: a sink that cannot deliver an event
//! counts or logs the loss and moves on, because losing a trace event must
//! never disturb the instrumented runtime.
//!
//! ## Implementations
//!
//! - [`ChannelSink`]: bounded crossbeam channel to a consumer thread; drops
//!   when the consumer falls behind
//! - [`JsonLinesSink`]: one JSON object per line to any writer
//! - [`RecordingSink`]: keeps everything in memory (tests, summaries)

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::warn;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::Event;

/// Downstream consumer of fired events
pub trait EventSink: Send + Sync {
    fn fire(&self, event: Event);
}

/// In-memory sink that records every event in fire order
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event fired so far
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Remove and return every event fired so far
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl EventSink for RecordingSink {
    fn fire(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Sink that forwards events to a consumer thread
pub struct ChannelSink {
    tx: Sender<Event>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx, dropped: AtomicU64::new(0) }, rx)
    }

    /// Events dropped because the channel was full or disconnected
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn fire(&self, event: Event) {
        // Non-blocking send (drop if the consumer is slow)
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Sink that writes each event as one line of JSON
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
    written: AtomicU64,
    failed: AtomicU64,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer), written: AtomicU64::new(0), failed: AtomicU64::new(0) }
    }

    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Flush the underlying writer
    ///
    /// # Errors
    /// Returns the writer's flush error
    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }

    /// Unwrap the writer (flushing is left to the caller)
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn fire(&self, event: Event) {
        let mut writer = self.writer.lock();
        let result = serde_json::to_writer(&mut *writer, &event)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"));
        match result {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Only the first failure is logged; a broken writer stays broken
                if self.failed.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("Failed to write {} event: {e}", event.name());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::GcPhase;

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::new();
        sink.fire(Event::ThreadStarted { thread_id: 1 });
        sink.fire(Event::ThreadStarted { thread_id: 2 });
        let events = sink.take();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "thread_started");
        assert!(sink.is_empty());
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (sink, rx) = ChannelSink::bounded(1);
        sink.fire(Event::GcResize { new_size: 1 });
        sink.fire(Event::GcResize { new_size: 2 });
        assert_eq!(sink.dropped(), 1);
        assert_eq!(rx.try_recv().unwrap(), Event::GcResize { new_size: 1 });
    }

    #[test]
    fn test_json_lines_sink_writes_one_object_per_line() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.fire(Event::GcPhase { phase: GcPhase::Start, generation: 0 });
        sink.fire(Event::GcRootUnregister { root_id: 9 });
        assert_eq!(sink.written(), 2);

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "gc_root_unregister");
        assert_eq!(second["root_id"], 9);
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_json_lines_sink_swallows_write_errors() {
        let sink = JsonLinesSink::new(BrokenWriter);
        sink.fire(Event::ThreadStarted { thread_id: 1 });
        sink.fire(Event::ThreadStarted { thread_id: 2 });
        assert_eq!(sink.failed(), 2);
        assert_eq!(sink.written(), 0);
    }
}
