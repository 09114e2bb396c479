//! Status and log delivery from the pipeline task to its observer.
//!
//! Status updates ride a `watch` channel: an observer that falls behind only
//! ever sees the latest phase (drop-latest is fine for progress). Log lines
//! ride an unbounded channel and are never dropped. Neither channel blocks
//! the pipeline on the observer's consumption rate.

use crate::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

pub type StatusReceiver = watch::Receiver<Phase>;
pub type LogReceiver = mpsc::UnboundedReceiver<LogMessage>;

/// Handle the pipeline uses to publish phase changes and log lines.
#[derive(Clone)]
pub struct Reporter {
    status: watch::Sender<Phase>,
    logs: mpsc::UnboundedSender<LogMessage>,
}

impl Reporter {
    pub fn channel() -> (Reporter, StatusReceiver, LogReceiver) {
        let (status_tx, status_rx) = watch::channel(Phase::Idle);
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        (
            Reporter {
                status: status_tx,
                logs: log_tx,
            },
            status_rx,
            log_rx,
        )
    }

    /// Publish a phase change. Terminal phases are sticky: once the
    /// operation has completed, failed or been cancelled, later updates are
    /// ignored, so a cancellation can never be overwritten by an error that
    /// raced with it.
    pub fn set_phase(&self, phase: Phase) {
        self.status.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = phase;
            true
        });
    }

    pub fn current_phase(&self) -> Phase {
        self.status.borrow().clone()
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(LogLevel::Warning, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(LogLevel::Error, message.into());
    }

    /// Append a failed command's full stderr to the operation log; the
    /// one-line error the caller raises carries only the first line.
    pub fn log_stderr(&self, result: &crate::process::CommandResult) {
        let stderr = result.stderr.trim();
        if !stderr.is_empty() {
            self.error(stderr.to_string());
        }
    }

    fn emit(&self, level: LogLevel, message: String) {
        log::debug!("{:?}: {}", level, message);
        // A closed receiver just means nobody is listening anymore.
        let _ = self.logs.send(LogMessage {
            timestamp: Utc::now(),
            level,
            message,
        });
    }
}

/// Rate limiter for per-chunk progress callbacks.
///
/// Copy and raw-write loops produce a progress candidate every chunk; this
/// gates delivery so fast storage cannot saturate the status channel.
pub struct Throttle {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Progress updates at roughly four per second.
    pub fn for_progress() -> Self {
        Self::new(Duration::from_millis(250))
    }

    /// True when enough time has passed since the last accepted update.
    pub fn ready(&mut self) -> bool {
        match self.last {
            Some(last) if last.elapsed() < self.min_interval => false,
            _ => {
                self.last = Some(Instant::now());
                true
            }
        }
    }
}
