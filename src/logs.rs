// Diagnostic capture for the server's stdout/stderr
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Receives diagnostic lines from the supervised server. Lines are opaque
/// log text and are never parsed or interpreted by this crate.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

#[derive(Debug, Clone)]
pub struct RingLine {
    pub seq: u64,
    pub text: String,
}

/// Bounded in-memory buffer of recent server log lines.
#[derive(Debug)]
pub struct LogRingBuffer {
    max_lines: usize,
    seq: AtomicU64,
    dropped_total: AtomicU64,
    lines: RwLock<VecDeque<RingLine>>,
}

impl LogRingBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines,
            seq: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            lines: RwLock::new(VecDeque::new()),
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn push(&self, text: String) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut guard = self.lines.write().unwrap();
        guard.push_back(RingLine { seq, text });

        while guard.len() > self.max_lines {
            guard.pop_front();
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
        }

        seq
    }

    pub fn snapshot(&self, last_n: usize) -> Vec<RingLine> {
        let guard = self.lines.read().unwrap();
        let len = guard.len();
        let start = len.saturating_sub(last_n);
        guard.iter().skip(start).cloned().collect()
    }

    pub fn since(&self, seq: u64) -> Vec<RingLine> {
        let guard = self.lines.read().unwrap();
        guard.iter().filter(|l| l.seq > seq).cloned().collect()
    }
}

impl LogSink for LogRingBuffer {
    fn append(&self, line: &str) {
        self.push(line.to_string());
    }
}
