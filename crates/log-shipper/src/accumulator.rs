// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Accumulation of normalized entries into the open batch.
//!
//! The accumulator only counts bytes and hands out closed batches. Whether
//! an append should flush right away is decided by the owner, which also
//! knows about retry backoff.
//!
//! # Size accounting
//!
//! Only the `line` text of each entry is counted, so a batch closed at the
//! limit serializes to somewhat more than `flush_byte_limit` bytes.

use crate::payload::LogEntry;

/// A closed, ordered group of entries queued for one delivery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub(crate) entries: Vec<LogEntry>,
}

impl Batch {
    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Text of the first entry.
    #[must_use]
    pub fn first_line(&self) -> Option<&str> {
        self.entries.first().map(LogEntry::line)
    }

    /// Text of the last entry, when the batch has more than one.
    #[must_use]
    pub fn last_line(&self) -> Option<&str> {
        if self.entries.len() > 1 {
            self.entries.last().map(LogEntry::line)
        } else {
            None
        }
    }

    /// Keeps only the entries at the indices `keep` returns `true` for,
    /// preserving order.
    pub(crate) fn retain_indexed<F>(&mut self, mut keep: F)
    where
        F: FnMut(usize) -> bool,
    {
        let mut index = 0;
        self.entries.retain(|_| {
            let kept = keep(index);
            index += 1;
            kept
        });
    }
}

impl From<Vec<LogEntry>> for Batch {
    fn from(entries: Vec<LogEntry>) -> Self {
        Self { entries }
    }
}

/// Owns the open batch and its running byte size.
#[derive(Debug, Clone)]
pub struct Accumulator {
    open: Vec<LogEntry>,
    size_bytes: usize,
    flush_byte_limit: usize,
}

impl Accumulator {
    #[must_use]
    pub fn new(flush_byte_limit: usize) -> Self {
        Accumulator {
            open: Vec::new(),
            size_bytes: 0,
            flush_byte_limit,
        }
    }

    /// Adds an entry to the open batch.
    ///
    /// Returns `true` once the running size has reached the flush limit.
    pub fn append(&mut self, entry: LogEntry) -> bool {
        self.size_bytes += entry.size_bytes();
        self.open.push(entry);
        self.is_full()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size_bytes >= self.flush_byte_limit
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Closes the open batch and starts a fresh one.
    ///
    /// Returns `None` when nothing has been appended since the last close.
    pub fn take_batch(&mut self) -> Option<Batch> {
        if self.open.is_empty() {
            return None;
        }
        self.size_bytes = 0;
        Some(Batch::from(std::mem::take(&mut self.open)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::AgentLine;
    use proptest::prelude::*;

    fn entry(line: &str) -> LogEntry {
        LogEntry::Agent(AgentLine::new(line))
    }

    #[test]
    fn test_append_tracks_size() {
        let mut accumulator = Accumulator::new(100);
        assert!(!accumulator.append(entry("hello")));
        assert!(!accumulator.append(entry("world!")));
        assert_eq!(accumulator.size_bytes(), 11);
        assert_eq!(accumulator.len(), 2);
    }

    #[test]
    fn test_limit_reached_on_third_entry() {
        let mut accumulator = Accumulator::new(25);
        let ten = "x".repeat(10);
        assert!(!accumulator.append(entry(&ten)));
        assert!(!accumulator.append(entry(&ten)));
        assert!(accumulator.append(entry(&ten)));
    }

    #[test]
    fn test_take_batch_resets() {
        let mut accumulator = Accumulator::new(100);
        assert_eq!(accumulator.take_batch(), None);

        accumulator.append(entry("a"));
        accumulator.append(entry("bc"));
        let batch = accumulator.take_batch().expect("batch should be closed");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.first_line(), Some("a"));
        assert_eq!(batch.last_line(), Some("bc"));
        assert!(accumulator.is_empty());
        assert_eq!(accumulator.size_bytes(), 0);
    }

    #[test]
    fn test_single_entry_batch_has_no_last_line() {
        let batch = Batch::from(vec![entry("only")]);
        assert_eq!(batch.first_line(), Some("only"));
        assert_eq!(batch.last_line(), None);
    }

    #[test]
    fn test_retain_indexed() {
        let mut batch = Batch::from(vec![entry("a"), entry("b"), entry("c")]);
        batch.retain_indexed(|i| i == 1);
        assert_eq!(batch.entries(), &[entry("b")]);
    }

    proptest! {
        #[test]
        fn prop_full_batch_overshoots_by_at_most_one_entry(
            sizes in prop::collection::vec(1usize..64, 1..50),
            limit in 1usize..512,
        ) {
            let mut accumulator = Accumulator::new(limit);
            for size in sizes {
                let full = accumulator.append(entry(&"x".repeat(size)));
                if full {
                    let batch = accumulator.take_batch().expect("non-empty");
                    let total: usize = batch.entries().iter().map(LogEntry::size_bytes).sum();
                    let last = batch.entries().last().map_or(0, LogEntry::size_bytes);
                    prop_assert!(total >= limit);
                    prop_assert!(total - last < limit);
                }
                prop_assert!(accumulator.size_bytes() < limit);
            }
        }
    }
}
