use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};

pub const LOSS_WINDOW_CAPACITY: usize = 8;
pub const LOSS_WINDOW_SPAN: TimeDelta = TimeDelta::seconds(7_200);

/// Recent connection losses inside a sliding time window.
///
/// Holds at most `capacity` timestamps, oldest evicted first. Recording a loss first drops
/// every entry older than `span` before the new one, then reports whether the window is full.
#[derive(Debug, Clone)]
pub struct LossWindow {
    entries: VecDeque<DateTime<Utc>>,
    capacity: usize,
    span: TimeDelta,
}

impl Default for LossWindow {
    fn default() -> Self {
        Self::new(LOSS_WINDOW_CAPACITY, LOSS_WINDOW_SPAN)
    }
}

impl LossWindow {
    pub fn new(capacity: usize, span: TimeDelta) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            span,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a loss at `at`; true when the window is full and a rescan is due
    pub fn record(&mut self, at: DateTime<Utc>) -> bool {
        let horizon = at - self.span;
        while self.entries.front().is_some_and(|oldest| *oldest < horizon) {
            self.entries.pop_front();
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(at);
        self.entries.len() >= self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
