use std::sync::atomic::{AtomicU64, Ordering};

use super::domain::GroupId;

/// Issues group identifiers from a single atomic counter.
///
/// The counter is seeded once from the highest identifier already in the store and only
/// moves forward afterwards, so concurrent enrollments never receive the same value.
#[derive(Debug)]
pub struct GroupIdAllocator {
    prefix: String,
    width: usize,
    last_issued: AtomicU64,
}

impl GroupIdAllocator {
    pub fn new(prefix: impl Into<String>, width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            width,
            last_issued: AtomicU64::new(0),
        }
    }

    /// Seed the counter from existing identifiers. Identifiers with another prefix or a
    /// malformed suffix are ignored; with nothing usable the sequence starts at 1.
    pub fn seeded<'a>(
        prefix: impl Into<String>,
        width: usize,
        existing: impl IntoIterator<Item = &'a GroupId>,
    ) -> Self {
        let allocator = Self::new(prefix, width);
        let peak = existing
            .into_iter()
            .filter_map(|id| allocator.sequence_of(id))
            .max()
            .unwrap_or(0);
        allocator.observe(peak);
        allocator
    }

    /// Numeric suffix of an identifier issued under this allocator's prefix.
    pub fn sequence_of(&self, id: &GroupId) -> Option<u64> {
        let suffix = id.0.strip_prefix(self.prefix.as_str())?;
        if suffix.is_empty() || !suffix.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }

    pub fn format(&self, sequence: u64) -> GroupId {
        GroupId(format!(
            "{}{:0width$}",
            self.prefix,
            sequence,
            width = self.width
        ))
    }

    /// Raise the counter to at least `sequence`, e.g. after finding a collision in the store.
    pub fn observe(&self, sequence: u64) {
        let mut current = self.last_issued.load(Ordering::Acquire);
        while sequence > current {
            match self.last_issued.compare_exchange_weak(
                current,
                sequence,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn next(&self) -> GroupId {
        let sequence = self.last_issued.fetch_add(1, Ordering::AcqRel) + 1;
        self.format(sequence)
    }
}
