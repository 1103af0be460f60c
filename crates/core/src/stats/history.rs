use std::collections::VecDeque;

use super::EtlRunStats;

/// Ring buffer of the most recent batch statistics.
#[derive(Debug, Clone)]
pub struct StatsHistory {
    capacity: usize,
    entries: VecDeque<EtlRunStats>,
}

impl StatsHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, stats: EtlRunStats) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(stats);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<EtlRunStats> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&EtlRunStats> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_most_recent() {
        let mut history = StatsHistory::new(3);
        for id in 1..=5 {
            history.push(EtlRunStats::new(id));
        }

        let ids: Vec<u64> = history.snapshot().iter().map(|s| s.batch_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(history.latest().map(|s| s.batch_id), Some(5));
        assert_eq!(history.len(), 3);
    }
}
