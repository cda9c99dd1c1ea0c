// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! FIFO of closed batches awaiting delivery.
//!
//! Only the head batch is ever delivered. A batch leaves the queue after a
//! terminal outcome, never on retry.

use std::collections::VecDeque;

use crate::accumulator::Batch;

#[derive(Debug, Default)]
pub struct DeliveryQueue {
    batches: VecDeque<Batch>,
    total_lines: usize,
}

impl DeliveryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, batch: Batch) {
        self.total_lines += batch.len();
        self.batches.push_back(batch);
    }

    #[must_use]
    pub fn head(&self) -> Option<&Batch> {
        self.batches.front()
    }

    /// Removes the head batch after a terminal outcome.
    pub fn pop_front(&mut self) -> Option<Batch> {
        let batch = self.batches.pop_front()?;
        self.total_lines -= batch.len();
        Some(batch)
    }

    /// Lines across every queued batch.
    #[must_use]
    pub fn total_lines_ready(&self) -> usize {
        self.total_lines
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{AgentLine, LogEntry};

    fn batch(lines: &[&str]) -> Batch {
        Batch::from(
            lines
                .iter()
                .map(|l| LogEntry::Agent(AgentLine::new(*l)))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_fifo_order_and_counts() {
        let mut queue = DeliveryQueue::new();
        queue.push_back(batch(&["a", "b"]));
        queue.push_back(batch(&["c"]));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_lines_ready(), 3);
        assert_eq!(queue.head().and_then(Batch::first_line), Some("a"));

        let first = queue.pop_front().expect("head");
        assert_eq!(first.len(), 2);
        assert_eq!(queue.total_lines_ready(), 1);
        assert_eq!(queue.head().and_then(Batch::first_line), Some("c"));

        queue.pop_front();
        assert!(queue.is_empty());
        assert_eq!(queue.pop_front(), None);
        assert_eq!(queue.total_lines_ready(), 0);
    }
}
