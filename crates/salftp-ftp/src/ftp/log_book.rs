//! Per-connection log of commands and replies, as shown in the log window.
//!
//! Bounded by a byte budget; the oldest lines are dropped first. Passwords
//! never reach it (`PASS`/`ACCT` arguments are replaced by `(hidden)`).

use crate::ftp::protocol;
use crate::ftp::types::FtpReply;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

pub const DEFAULT_LOG_BUDGET: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLineKind {
    Command,
    Reply,
    Info,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub kind: LogLineKind,
    pub text: String,
}

#[derive(Debug)]
struct Inner {
    lines: VecDeque<LogLine>,
    bytes: usize,
    budget: usize,
}

#[derive(Debug)]
pub struct LogBook {
    inner: StdMutex<Inner>,
}

impl Default for LogBook {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUDGET)
    }
}

impl LogBook {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: StdMutex::new(Inner {
                lines: VecDeque::new(),
                bytes: 0,
                budget,
            }),
        }
    }

    fn push(&self, kind: LogLineKind, text: String) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.bytes += text.len();
        inner.lines.push_back(LogLine {
            at: Local::now(),
            kind,
            text,
        });
        while inner.bytes > inner.budget && inner.lines.len() > 1 {
            if let Some(old) = inner.lines.pop_front() {
                inner.bytes -= old.text.len();
            }
        }
    }

    pub fn add_command(&self, cmd: &str) {
        let shown = protocol::loggable_command(cmd);
        log::trace!(">>> {}", shown);
        self.push(LogLineKind::Command, shown.into_owned());
    }

    /// Command text that was already made loggable (proxy script lines).
    pub fn add_hidden_command(&self, shown: &str) {
        log::trace!(">>> {}", shown);
        self.push(LogLineKind::Command, shown.to_string());
    }

    pub fn add_reply(&self, reply: &FtpReply) {
        for line in &reply.lines {
            log::trace!("<<< {}", line);
            self.push(LogLineKind::Reply, line.clone());
        }
    }

    pub fn add_info(&self, text: impl Into<String>) {
        let text = text.into();
        log::debug!("{}", text);
        self.push(LogLineKind::Info, text);
    }

    pub fn add_error(&self, text: impl Into<String>) {
        let text = text.into();
        log::warn!("{}", text);
        self.push(LogLineKind::Error, text);
    }

    pub fn lines(&self) -> Vec<LogLine> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.lines.iter().cloned().collect()
    }

    /// Whole log as text, one entry per line.
    pub fn text(&self) -> String {
        self.lines()
            .iter()
            .map(|l| l.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.lines.clear();
        inner.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwords_are_hidden() {
        let log = LogBook::default();
        log.add_command("USER bob");
        log.add_command("PASS secret");
        assert_eq!(log.text(), "USER bob\nPASS (hidden)");
    }

    #[test]
    fn oldest_lines_are_dropped() {
        let log = LogBook::new(10);
        log.add_info("aaaaaa");
        log.add_info("bbbbbb");
        let lines = log.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].text, "bbbbbb");
    }

    #[test]
    fn replies_are_split_into_lines() {
        let log = LogBook::default();
        log.add_reply(&FtpReply {
            code: Some(211),
            lines: vec!["211-Features:".into(), "211 End".into()],
        });
        assert_eq!(log.lines().len(), 2);
        assert!(log.lines().iter().all(|l| l.kind == LogLineKind::Reply));
    }
}
