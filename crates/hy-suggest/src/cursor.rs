//! Grid progress records: param id → next unissued grid index.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::ops::Range;

/// Transactional storage for grid cursors.
///
/// `claim` must be a single atomic read-modify-write per param id: two
/// concurrent claims never return overlapping ranges.
pub trait CursorStore: Send + Sync {
    /// Reserve up to `count` indices below `total` (all remaining when
    /// `count` is `None`). Returns an empty range once exhausted.
    fn claim(&self, param_id: &str, total: usize, count: Option<usize>) -> Range<usize>;

    /// Next unissued index (0 for unknown ids).
    fn position(&self, param_id: &str) -> usize;

    /// Forget the cursor, e.g. when its parameter set is deleted.
    fn remove(&self, param_id: &str);
}

#[derive(Debug, Clone)]
struct CursorRecord {
    next: usize,
    updated_at: DateTime<Utc>,
}

/// In-memory cursor store. Each claim holds the shard lock of its entry for
/// the duration of the update and nothing else.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: DashMap<String, CursorRecord>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_updated(&self, param_id: &str) -> Option<DateTime<Utc>> {
        self.cursors.get(param_id).map(|c| c.updated_at)
    }
}

impl CursorStore for MemoryCursorStore {
    fn claim(&self, param_id: &str, total: usize, count: Option<usize>) -> Range<usize> {
        let mut record = self
            .cursors
            .entry(param_id.to_string())
            .or_insert_with(|| CursorRecord {
                next: 0,
                updated_at: Utc::now(),
            });

        let start = record.next.min(total);
        let end = match count {
            Some(n) => start.saturating_add(n).min(total),
            None => total,
        };
        record.next = end;
        record.updated_at = Utc::now();
        start..end
    }

    fn position(&self, param_id: &str) -> usize {
        self.cursors.get(param_id).map(|c| c.next).unwrap_or(0)
    }

    fn remove(&self, param_id: &str) {
        self.cursors.remove(param_id);
    }
}
