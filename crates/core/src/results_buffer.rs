use std::collections::VecDeque;

use crate::pagination::FetchDirection;

pub const DISPLAY_BUFFER_CAPACITY: usize = 5_000;

/// Sliding window over a tab's result rows.
///
/// `offset` counts the logical rows that precede the first buffered row.
/// Pages are applied in the order they arrive; ordering is the caller's job.
#[derive(Debug, Clone)]
pub struct DisplayBuffer<T> {
    capacity: usize,
    rows: VecDeque<T>,
    offset: u64,
}

impl<T> Default for DisplayBuffer<T> {
    fn default() -> Self {
        Self::new(DISPLAY_BUFFER_CAPACITY)
    }
}

impl<T> DisplayBuffer<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0,
            "display buffer capacity must be greater than 0"
        );
        Self {
            capacity,
            rows: VecDeque::with_capacity(capacity.min(DISPLAY_BUFFER_CAPACITY)),
            offset: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Logical row number of the buffered row at `index`.
    #[must_use]
    pub fn absolute_index(&self, index: usize) -> u64 {
        self.offset + index as u64
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.offset = 0;
    }

    /// Applies one fetched page and returns how many rows were evicted.
    pub fn push_page(&mut self, direction: FetchDirection, rows: Vec<T>) -> usize {
        match direction {
            FetchDirection::Forward => self.append(rows),
            FetchDirection::Backward => self.prepend(rows),
        }
    }

    fn append(&mut self, rows: Vec<T>) -> usize {
        self.rows.extend(rows);
        let excess = self.rows.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.rows.drain(..excess);
            self.offset += excess as u64;
        }
        excess
    }

    fn prepend(&mut self, rows: Vec<T>) -> usize {
        let added = rows.len();
        for row in rows.into_iter().rev() {
            self.rows.push_front(row);
        }
        self.offset = self.offset.saturating_sub(added as u64);
        let excess = self.rows.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.rows.truncate(self.capacity);
        }
        excess
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.rows.get(index)
    }

    #[must_use]
    pub fn visible_rows(&self, start: usize, limit: usize) -> Vec<&T> {
        if limit == 0 || start >= self.rows.len() {
            return Vec::new();
        }

        let end = (start + limit).min(self.rows.len());
        self.rows
            .iter()
            .skip(start)
            .take(end - start)
            .collect::<Vec<_>>()
    }
}
