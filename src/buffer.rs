//! Bounded circular buffers for per-run output.
//!
//! Each active run owns a [`LineBuffer`] of formatted text lines and an
//! [`EntryBuffer`] of structured [`LogEntry`]s. Both are fixed-capacity
//! rings: appends are O(1) and overwrite the oldest slot once full, with
//! total-write and total-eviction counters so callers can tell how much
//! history was dropped.
//!
//! The wraparound arithmetic lives entirely in [`Ring`]; everything else is
//! a thin locked wrapper around it.

use std::sync::RwLock;

use crate::event::LogEntry;

/// Fixed-size circular store: a slot array, a write cursor, and modulo
/// arithmetic. Not thread-safe on its own; the public buffers wrap it in a
/// lock.
#[derive(Debug)]
struct Ring<T> {
    slots: Vec<Option<T>>,
    capacity: usize,
    /// Next slot to write. Wraps modulo `capacity`.
    cursor: usize,
    /// Total values ever written, including evicted ones.
    written: u64,
}

impl<T: Clone> Ring<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be nonzero");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            capacity,
            cursor: 0,
            written: 0,
        }
    }

    fn push(&mut self, value: T) {
        self.slots[self.cursor] = Some(value);
        self.cursor = (self.cursor + 1) % self.capacity;
        self.written += 1;
    }

    /// Number of live values.
    #[allow(clippy::cast_possible_truncation)]
    fn len(&self) -> usize {
        self.written.min(self.capacity as u64) as usize
    }

    /// Physical index of the oldest live value.
    fn oldest(&self) -> usize {
        if self.written <= self.capacity as u64 {
            0
        } else {
            self.cursor
        }
    }

    /// Physical index of the logical (oldest-first) index `i`.
    fn physical(&self, i: usize) -> usize {
        (self.oldest() + i) % self.capacity
    }

    fn get(&self, i: usize) -> Option<&T> {
        if i >= self.len() {
            return None;
        }
        self.slots[self.physical(i)].as_ref()
    }

    fn last_mut(&mut self) -> Option<&mut T> {
        if self.written == 0 {
            return None;
        }
        let idx = (self.cursor + self.capacity - 1) % self.capacity;
        self.slots[idx].as_mut()
    }

    /// The full live window, oldest first. `None` when nothing was ever
    /// written — callers distinguish "nothing yet" from an empty result.
    fn window(&self) -> Option<Vec<T>> {
        if self.written == 0 {
            return None;
        }
        Some(
            (0..self.len())
                .filter_map(|i| self.slots[self.physical(i)].clone())
                .collect(),
        )
    }

    /// The last `n` values, clamped to what's available.
    fn tail(&self, n: usize) -> Vec<T> {
        let len = self.len();
        let start = len.saturating_sub(n);
        (start..len)
            .filter_map(|i| self.slots[self.physical(i)].clone())
            .collect()
    }

    fn evicted(&self) -> u64 {
        self.written.saturating_sub(self.capacity as u64)
    }
}

/// Bounded circular buffer of formatted text lines.
#[derive(Debug)]
pub struct LineBuffer {
    ring: RwLock<Ring<String>>,
}

impl LineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Ring::new(capacity)),
        }
    }

    pub fn push(&self, line: String) {
        self.write().push(line);
    }

    /// All live lines in chronological order; `None` if nothing was written.
    pub fn lines(&self) -> Option<Vec<String>> {
        self.read().window()
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        self.read().tail(n)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_written(&self) -> u64 {
        self.read().written
    }

    pub fn total_evicted(&self) -> u64 {
        self.read().evicted()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Ring<String>> {
        self.ring
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Ring<String>> {
        self.ring
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Bounded circular buffer of structured log entries, with random access by
/// logical index and in-place update of the most recent entry (for content
/// that streams in, like a growing tool result).
#[derive(Debug)]
pub struct EntryBuffer {
    ring: RwLock<Ring<LogEntry>>,
}

impl EntryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(Ring::new(capacity)),
        }
    }

    pub fn push(&self, entry: LogEntry) {
        self.write().push(entry);
    }

    /// All live entries in chronological order; `None` if nothing was written.
    pub fn entries(&self) -> Option<Vec<LogEntry>> {
        self.read().window()
    }

    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        self.read().tail(n)
    }

    /// Entry at logical index `i` (0 = oldest live entry).
    pub fn get(&self, i: usize) -> Option<LogEntry> {
        self.read().get(i).cloned()
    }

    /// Mutate the most recently appended entry in place. Returns false when
    /// the buffer is empty.
    pub fn update_last(&self, f: impl FnOnce(&mut LogEntry)) -> bool {
        match self.write().last_mut() {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_written(&self) -> u64 {
        self.read().written
    }

    pub fn total_evicted(&self) -> u64 {
        self.read().evicted()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Ring<LogEntry>> {
        self.ring
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Ring<LogEntry>> {
        self.ring
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::{LogKind, StreamEvent};
    use chrono::NaiveTime;

    fn entry(text: &str) -> LogEntry {
        LogEntry::from_event(
            NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            "",
            &StreamEvent::Text(text.to_string()),
        )
    }

    #[test]
    fn empty_buffer_returns_none() {
        let buf = LineBuffer::new(4);
        assert!(buf.lines().is_none());
        assert!(buf.tail(3).is_empty());
        assert_eq!(buf.total_written(), 0);
        assert_eq!(buf.total_evicted(), 0);
    }

    #[test]
    fn fills_in_insertion_order() {
        let buf = LineBuffer::new(4);
        for i in 0..3 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(
            buf.lines().unwrap(),
            vec!["line 0", "line 1", "line 2"]
        );
        assert_eq!(buf.total_written(), 3);
        assert_eq!(buf.total_evicted(), 0);
    }

    #[test]
    fn wraparound_evicts_oldest() {
        let buf = LineBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(
            buf.lines().unwrap(),
            vec!["line 2", "line 3", "line 4"]
        );
        assert_eq!(buf.total_written(), 5);
        assert_eq!(buf.total_evicted(), 2);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn counter_laws_hold_for_many_shapes() {
        for capacity in [1, 2, 3, 7, 64] {
            for n in [0usize, 1, 2, 6, 7, 8, 63, 64, 65, 200] {
                let buf = LineBuffer::new(capacity);
                for i in 0..n {
                    buf.push(i.to_string());
                }
                let expected_len = n.min(capacity);
                let lines = buf.lines();
                if n == 0 {
                    assert!(lines.is_none());
                } else {
                    let lines = lines.unwrap();
                    assert_eq!(lines.len(), expected_len, "cap={capacity} n={n}");
                    // Oldest surviving value first.
                    assert_eq!(lines[0], (n - expected_len).to_string());
                    assert_eq!(lines[expected_len - 1], (n - 1).to_string());
                }
                assert_eq!(buf.total_written(), n as u64);
                assert_eq!(
                    buf.total_evicted(),
                    (n as u64).saturating_sub(capacity as u64)
                );
            }
        }
    }

    #[test]
    fn tail_clamps_to_available() {
        let buf = LineBuffer::new(5);
        for i in 0..3 {
            buf.push(i.to_string());
        }
        assert_eq!(buf.tail(2), vec!["1", "2"]);
        assert_eq!(buf.tail(10), vec!["0", "1", "2"]);
    }

    #[test]
    fn entry_get_by_logical_index() {
        let buf = EntryBuffer::new(2);
        buf.push(entry("a"));
        buf.push(entry("b"));
        buf.push(entry("c"));
        assert_eq!(buf.get(0).unwrap().summary, "b");
        assert_eq!(buf.get(1).unwrap().summary, "c");
        assert!(buf.get(2).is_none());
    }

    #[test]
    fn update_last_mutates_newest_entry() {
        let buf = EntryBuffer::new(4);
        assert!(!buf.update_last(|_| {}));
        buf.push(entry("partial"));
        let updated = buf.update_last(|e| {
            e.detail = Some("full output".to_string());
            e.complete = true;
        });
        assert!(updated);
        let newest = buf.get(0).unwrap();
        assert_eq!(newest.detail.as_deref(), Some("full output"));
        assert!(newest.complete);
        assert_eq!(newest.kind, LogKind::Text);
    }

    #[test]
    fn capacity_one_keeps_only_newest() {
        let buf = LineBuffer::new(1);
        buf.push("a".into());
        buf.push("b".into());
        assert_eq!(buf.lines().unwrap(), vec!["b"]);
        assert_eq!(buf.total_evicted(), 1);
    }
}
