use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{PoisonError, RwLock};

const DEFAULT_MAX_LINES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// Engine stdout
    Stdout,
    /// Engine stderr
    Stderr,
    /// Engine process lifecycle and connection transitions
    Daemon,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
            LogSource::Daemon => "daemon",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub source: LogSource,
    pub text: String,
}

impl LogLine {
    pub fn render(&self) -> String {
        format!(
            "{} [{}] {}",
            self.at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.source.as_str(),
            self.text
        )
    }
}

/// Ring buffer of captured engine output and daemon events.
pub struct LogBuffer {
    max_lines: usize,
    lines: RwLock<VecDeque<LogLine>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            lines: RwLock::new(VecDeque::new()),
        }
    }

    /// Append a line, evicting the oldest when over capacity.
    pub fn push(&self, source: LogSource, text: impl Into<String>) {
        let mut lines = self.lines.write().unwrap_or_else(PoisonError::into_inner);
        lines.push_back(LogLine {
            at: Utc::now(),
            source,
            text: text.into(),
        });
        while lines.len() > self.max_lines {
            lines.pop_front();
        }
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogLine> {
        let lines = self.lines.read().unwrap_or_else(PoisonError::into_inner);
        let start = lines.len().saturating_sub(n);
        lines.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[LogLine]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn tail_returns_last_n_lines() {
        let buf = LogBuffer::new(100);
        for i in 0..10 {
            buf.push(LogSource::Stdout, format!("line {i}"));
        }
        assert_eq!(texts(&buf.tail(3)), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let buf = LogBuffer::new(5);
        for i in 0..10 {
            buf.push(LogSource::Stderr, format!("line {i}"));
        }
        assert_eq!(buf.len(), 5);
        assert_eq!(
            texts(&buf.tail(100)),
            vec!["line 5", "line 6", "line 7", "line 8", "line 9"]
        );
    }

    #[test]
    fn rendered_line_carries_source() {
        let buf = LogBuffer::default();
        assert!(buf.is_empty());
        buf.push(LogSource::Daemon, "engine running");
        let line = buf.tail(1).remove(0).render();
        assert!(line.ends_with("[daemon] engine running"), "{line}");
    }
}
