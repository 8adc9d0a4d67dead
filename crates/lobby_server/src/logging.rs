//! Asynchronous log relay.
//!
//! Offloads log formatting and I/O from hot paths (tick loops, event
//! workers) to one background task. Producers enqueue owned records without
//! blocking; when the bounded queue is full the record is dropped rather
//! than stalling the producer.

use std::sync::OnceLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Severity of a relayed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Record sent to the relay worker.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub target: Option<String>,
}

/// Handle for non-blocking log submission.
#[derive(Debug, Clone)]
pub struct LogRelay {
    sender: mpsc::Sender<LogRecord>,
}

/// Default depth of the relay queue.
pub const DEFAULT_LOG_QUEUE_SIZE: usize = 256;

impl LogRelay {
    /// Creates a relay backed by a background worker draining a bounded
    /// queue of `queue_size` records.
    pub fn new(queue_size: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<LogRecord>(queue_size.max(1));

        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                Self::write(record);
            }
        });

        Self { sender }
    }

    /// Queues a record; drops it when the queue is full.
    pub fn log(&self, level: LogLevel, message: &str) {
        self.log_with_target(level, message, None);
    }

    /// Queues a record tagged with a target (e.g. a session name).
    pub fn log_with_target(&self, level: LogLevel, message: &str, target: Option<&str>) {
        let record = LogRecord {
            level,
            message: message.to_string(),
            target: target.map(str::to_string),
        };
        // Dropping on a full queue keeps producers non-blocking under load.
        let _ = self.sender.try_send(record);
    }

    fn write(record: LogRecord) {
        let message = match &record.target {
            Some(target) => format!("{}: {}", target, record.message),
            None => record.message,
        };
        match record.level {
            LogLevel::Error => error!("{message}"),
            LogLevel::Warn => warn!("{message}"),
            LogLevel::Info => info!("{message}"),
            LogLevel::Debug => debug!("{message}"),
            LogLevel::Trace => trace!("{message}"),
        }
    }
}

static GLOBAL_RELAY: OnceLock<LogRelay> = OnceLock::new();

/// Initializes the global relay. Later calls keep the first instance.
pub fn init_global_log_relay(queue_size: usize) {
    GLOBAL_RELAY.get_or_init(|| LogRelay::new(queue_size));
}

/// The global relay, initializing it with the default queue size if needed.
pub fn global_log_relay() -> &'static LogRelay {
    GLOBAL_RELAY.get_or_init(|| LogRelay::new(DEFAULT_LOG_QUEUE_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_accepts_records_without_blocking() {
        let relay = LogRelay::new(4);
        // Far more records than the queue holds; none of these may block.
        for i in 0..64 {
            relay.log(LogLevel::Info, &format!("record {i}"));
        }
        relay.log_with_target(LogLevel::Warn, "tagged", Some("session-1"));
    }

    #[tokio::test]
    async fn global_relay_is_a_singleton() {
        init_global_log_relay(8);
        let a = global_log_relay() as *const LogRelay;
        let b = global_log_relay() as *const LogRelay;
        assert_eq!(a, b);
    }
}
