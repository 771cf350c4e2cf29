use std::fmt;
use std::sync::Arc;

pub use log::Level;

/// Destination for log lines produced by the engine components.
///
/// Any `Fn(Level, &str)` closure is a sink, which is how tests capture
/// output without touching the process-wide logger.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn enabled(&self, _level: Level) -> bool {
        true
    }
}

impl<F> LogSink for F
where
    F: Fn(Level, &str) + Send + Sync,
{
    fn log(&self, level: Level, message: &str) {
        self(level, message)
    }
}

struct NoopSink;

impl LogSink for NoopSink {
    fn log(&self, _level: Level, _message: &str) {}

    fn enabled(&self, _level: Level) -> bool {
        false
    }
}

/// Forwards to the `log` facade under a fixed target.
struct LogCrateSink {
    target: &'static str,
}

impl LogSink for LogCrateSink {
    fn log(&self, level: Level, message: &str) {
        log::log!(target: self.target, level, "{}", message);
    }

    fn enabled(&self, level: Level) -> bool {
        log::log_enabled!(target: self.target, level)
    }
}

/// Logging capability handed to each component at construction.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Logger")
    }
}

impl Logger {
    pub fn noop() -> Self {
        Self {
            sink: Arc::new(NoopSink),
        }
    }

    pub fn log_crate(target: &'static str) -> Self {
        Self {
            sink: Arc::new(LogCrateSink { target }),
        }
    }

    pub fn new<S: LogSink + 'static>(sink: S) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if self.sink.enabled(level) {
            self.sink.log(level, &args.to_string());
        }
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args)
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args)
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args)
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args)
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args)
    }
}
