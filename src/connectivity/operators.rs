use crate::at::parse::ScannedOperator;

pub const MAX_OPERATORS: usize = 30;

/// Operators found by the last network scan, tried round-robin on reselect.
#[derive(Debug, Clone, Default)]
pub struct OperatorList {
    entries: Vec<ScannedOperator>,
    next: usize,
}

impl OperatorList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ScannedOperator] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next = 0;
    }

    /// Adds an operator unless its short name is already known or the list is full
    pub fn insert(&mut self, operator: ScannedOperator) -> bool {
        if self.entries.len() >= MAX_OPERATORS
            || operator.short_name.is_empty()
            || self.entries.iter().any(|o| o.short_name == operator.short_name)
        {
            return false;
        }
        self.entries.push(operator);
        true
    }

    /// Replaces the list with a fresh scan
    pub fn rebuild(&mut self, scanned: impl IntoIterator<Item = ScannedOperator>) {
        self.clear();
        for operator in scanned {
            self.insert(operator);
        }
    }

    /// Short name to try next; advances the round-robin index
    pub fn next_candidate(&mut self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.next % self.entries.len();
        self.next = (index + 1) % self.entries.len();
        Some(self.entries[index].short_name.clone())
    }
}
