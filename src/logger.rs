//! Logging infrastructure.
//!
//! Two channels: the `log` crate facade for formatted messages, routed
//! through a platform byte sink, and a fixed-size trace ring recording
//! the raw bytes moving through the serial endpoints. The ring is
//! written with a try-push and drained by whoever has time for it; on
//! two-core parts that is the second core, which only ever reads.
//! Nothing ever calls back into the protocol engine from here.

use heapless::Deque;
use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;

/// Platform destination for formatted log output.
pub trait LogSink: Sync {
    fn write_str(&self, text: &str);
}

struct SinkLogger {
    sink: spin::Once<&'static dyn LogSink>,
}

static LOGGER: SinkLogger = SinkLogger {
    sink: spin::Once::new(),
};

impl log::Log for SinkLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        let Some(sink) = self.sink.get() else {
            return;
        };
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        use core::fmt::Write;
        let mut line: heapless::String<256> = heapless::String::new();
        let _ = write!(line, "[{}] {}\r\n", level, record.args());
        sink.write_str(&line);
    }

    fn flush(&self) {}
}

/// Install the logger. Call once, before the scheduler runs.
pub fn init(sink: &'static dyn LogSink) {
    LOGGER.sink.call_once(|| sink);
    let _ = log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Debug));
}

pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Which pipe a traced byte travelled through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDir {
    /// From the handheld into the dongle.
    In,
    /// From the dongle to the handheld.
    Out,
}

const TRACE_CAPACITY: usize = 1024;

static TRACE: Mutex<Deque<u16, TRACE_CAPACITY>> = Mutex::new(Deque::new());

/// Record one byte. Never blocks; new entries are dropped when the
/// drain side falls behind.
pub fn trace_byte(dir: TraceDir, byte: u8) {
    let word = byte as u16
        | match dir {
            TraceDir::In => 0,
            TraceDir::Out => 0x100,
        };
    let _ = TRACE.lock().push_back(word);
}

/// Drain buffered trace entries, newest last. Intended for the async
/// log core; safe anywhere.
pub fn drain_trace(mut f: impl FnMut(TraceDir, u8)) {
    loop {
        let entry = TRACE.lock().pop_front();
        match entry {
            Some(word) => {
                let dir = if word & 0x100 != 0 {
                    TraceDir::Out
                } else {
                    TraceDir::In
                };
                f(dir, word as u8);
            }
            None => break,
        }
    }
}
