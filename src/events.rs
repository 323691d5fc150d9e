//! Progress events emitted by background work.
//!
//! Worker tasks never touch the presentation surface directly: they send
//! events through a channel and a single consumer renders them. Raw command
//! output is forwarded verbatim, one line per event.

use chrono::Local;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone)]
pub enum Progress {
    /// A catalogue step is about to execute.
    StepStarted {
        index: usize,
        total: usize,
        title: &'static str,
    },
    /// A catalogue step was skipped because it is already recorded complete.
    StepSkipped {
        index: usize,
        total: usize,
        title: &'static str,
    },
    StepCompleted {
        index: usize,
        total: usize,
        title: &'static str,
    },
    /// One line of raw sub-command output, unmodified.
    CommandLine(String),
    Info(String),
    Warn(String),
}

/// Cloneable sender handle given to workers.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: UnboundedSender<Progress>,
}

impl LogSink {
    pub fn channel() -> (Self, UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A sink whose events are dropped. Useful in tests.
    pub fn discard() -> Self {
        let (sink, _rx) = Self::channel();
        sink
    }

    pub fn send(&self, event: Progress) {
        // A closed receiver just means nobody is watching anymore
        let _ = self.tx.send(event);
    }

    pub fn line(&self, line: impl Into<String>) {
        self.send(Progress::CommandLine(line.into()));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(Progress::Info(message.into()));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.send(Progress::Warn(message.into()));
    }
}

/// Render one event as a timestamped terminal line.
pub fn format_event(event: &Progress) -> String {
    let stamp = Local::now().format("%H:%M:%S");
    let body = match event {
        Progress::StepStarted { index, total, title } => {
            format!("step {}/{}: {}...", index + 1, total, title)
        }
        Progress::StepSkipped { index, total, title } => {
            format!("step {}/{}: {} (already completed)", index + 1, total, title)
        }
        Progress::StepCompleted { index, total, title } => {
            format!("step {}/{}: {} done", index + 1, total, title)
        }
        Progress::CommandLine(line) => line.clone(),
        Progress::Info(message) => message.clone(),
        Progress::Warn(message) => format!("warning: {message}"),
    };
    format!("[{stamp}] {body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_delivers_in_order() {
        let (sink, mut rx) = LogSink::channel();
        sink.info("first");
        sink.line("second");
        sink.warn("third");

        match rx.try_recv().unwrap() {
            Progress::Info(m) => assert_eq!(m, "first"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            Progress::CommandLine(m) => assert_eq!(m, "second"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.try_recv().unwrap() {
            Progress::Warn(m) => assert_eq!(m, "third"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_send_after_receiver_dropped_is_silent() {
        let (sink, rx) = LogSink::channel();
        drop(rx);
        sink.info("nobody listening");
    }

    #[test]
    fn test_format_event() {
        let line = format_event(&Progress::StepSkipped {
            index: 2,
            total: 7,
            title: "clone factor repository",
        });
        assert!(line.contains("step 3/7"));
        assert!(line.contains("already completed"));

        let warn = format_event(&Progress::Warn("disk full".to_string()));
        assert!(warn.contains("warning: disk full"));
    }
}
