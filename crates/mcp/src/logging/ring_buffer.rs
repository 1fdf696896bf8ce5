//! Bounded buffer of recent diagnostic entries for one backend.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use super::{LogEntry, LogSource};

/// A ring buffer for storing log entries with a maximum capacity.
#[derive(Debug)]
pub struct LogRingBuffer {
    buffer: VecDeque<LogEntry>,
    max_size: usize,
}

impl LogRingBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(max_size.min(64)),
            max_size: max_size.max(1),
        }
    }

    /// Add an entry, dropping the oldest one when full.
    pub fn add_entry(&mut self, entry: LogEntry) {
        if self.buffer.len() >= self.max_size {
            self.buffer.pop_front();
        }
        self.buffer.push_back(entry);
    }

    /// Get the most recent `count` entries, oldest first.
    pub fn get_recent(&self, count: usize) -> Vec<LogEntry> {
        let start = self.buffer.len().saturating_sub(count);
        self.buffer.iter().skip(start).cloned().collect()
    }

    /// Messages from `source` recorded at or after `since`, newest `count` kept.
    pub fn tail_since(&self, source: LogSource, since: DateTime<Utc>, count: usize) -> Vec<String> {
        let mut lines: Vec<String> = self
            .buffer
            .iter()
            .rev()
            .filter(|entry| entry.source == source && entry.timestamp >= since)
            .take(count)
            .map(|entry| entry.message.clone())
            .collect();
        lines.reverse();
        lines
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for LogRingBuffer {
    fn default() -> Self {
        Self::new(1000)
    }
}
