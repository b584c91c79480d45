//! Retention policy: which archives to delete once the catalog is over limit

use std::cmp::Ordering;

use crate::catalog::ArchiveRecord;

/// Newest-first ordering; equal creation times put the greater path first
fn newest_first(a: &ArchiveRecord, b: &ArchiveRecord) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.path.cmp(&a.path))
}

/// Sort records newest first
pub fn sort_newest_first(records: &mut [ArchiveRecord]) {
    records.sort_by(newest_first);
}

/// Select the records to delete so that at most `max_count` remain.
///
/// Pure: the input is not modified and nothing is touched on disk. Returns
/// the oldest `records.len() - max_count` records (empty when the catalog is
/// within the limit). `max_count == 0` selects everything.
pub fn select(records: &[ArchiveRecord], max_count: usize) -> Vec<ArchiveRecord> {
    let mut ordered = records.to_vec();
    sort_newest_first(&mut ordered);
    ordered.into_iter().skip(max_count).collect()
}
