//! Container id allocation.

use std::sync::{Mutex, PoisonError};

/// Ids are `1..RESERVED`; 0 and `u16::MAX` are never handed out.
const RESERVED: u16 = u16::MAX;

/// Counter handing out the next free container id.
///
/// The counter wraps before [`RESERVED`] and skips 0. Releasing an id below
/// the counter rewinds it, so freed ids are handed out again first.
#[derive(Debug, Default)]
pub struct Sequence {
    last: Mutex<u16>,
}

impl Sequence {
    /// Creates a sequence whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id for which `taken` is false.
    ///
    /// Returns `None` when every id is taken.
    pub fn next(&self, taken: impl Fn(u16) -> bool) -> Option<u16> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..RESERVED {
            *last = last.wrapping_add(1) % RESERVED;
            if *last == 0 || taken(*last) {
                continue;
            }
            return Some(*last);
        }
        None
    }

    /// Marks `id` free again.
    pub fn release(&self, id: u16) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if id != 0 && id <= *last {
            *last = id - 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_starts_at_one() {
        let seq = Sequence::new();
        assert_eq!(seq.next(|_| false), Some(1));
        assert_eq!(seq.next(|_| false), Some(2));
    }

    #[test]
    fn test_skips_taken() {
        let seq = Sequence::new();
        let live: HashSet<u16> = [1, 2, 4].into_iter().collect();
        assert_eq!(seq.next(|id| live.contains(&id)), Some(3));
        assert_eq!(seq.next(|id| live.contains(&id)), Some(5));
    }

    #[test]
    fn test_wraps_before_reserved() {
        let seq = Sequence::new();
        *seq.last.lock().expect("lock") = RESERVED - 1;
        assert_eq!(seq.next(|_| false), Some(1));
    }

    #[test]
    fn test_reuses_released_id_after_wrap() {
        let seq = Sequence::new();
        *seq.last.lock().expect("lock") = 10;
        // only id 3 is free
        assert_eq!(seq.next(|id| id != 3), Some(3));
    }

    #[test]
    fn test_release_rewinds() {
        let seq = Sequence::new();
        let live: HashSet<u16> = [2].into_iter().collect();
        assert_eq!(seq.next(|_| false), Some(1));
        assert_eq!(seq.next(|_| false), Some(2));

        seq.release(1);
        assert_eq!(seq.next(|id| live.contains(&id)), Some(1));
        assert_eq!(seq.next(|id| id <= 2), Some(3));

        // releasing above the counter changes nothing
        seq.release(9);
        assert_eq!(seq.next(|_| false), Some(4));
    }

    #[test]
    fn test_exhausted() {
        let seq = Sequence::new();
        assert_eq!(seq.next(|_| true), None);
    }
}
