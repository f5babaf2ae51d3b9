//! In-flight progress tracking for one crawl cursor.
//!
//! The persisted position of a cursor must never move past work still
//! in flight. `ProgressTracker` keeps a committed end state plus an
//! ordered multiset of held states; what gets persisted is `begin()`,
//! the minimum held state, falling back to the end state when nothing
//! is held. Restarting from `begin()` can repeat work but never skips
//! any.

use crate::state::CrawlState;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug)]
struct ProgressInner {
    end: CrawlState,
    held: BTreeMap<CrawlState, usize>,
}

/// Committed-plus-held view of a cursor's position.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    inner: Arc<Mutex<ProgressInner>>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(initial: CrawlState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProgressInner {
                end: initial,
                held: BTreeMap::new(),
            })),
        }
    }

    /// The position safe to persist: the minimum in-flight state, or
    /// the end state when nothing is in flight.
    #[must_use]
    pub fn begin(&self) -> CrawlState {
        let inner = self.inner.lock();
        inner
            .held
            .keys()
            .next()
            .copied()
            .unwrap_or(inner.end)
    }

    /// The committed end state (the cursor's own position).
    #[must_use]
    pub fn end(&self) -> CrawlState {
        self.inner.lock().end
    }

    /// Pin `state` as in flight and advance the end state to it if it
    /// sorts later.
    #[must_use]
    pub fn hold(&self, state: CrawlState) -> ProgressHolder {
        let mut inner = self.inner.lock();
        *inner.held.entry(state).or_insert(0) += 1;
        if state > inner.end {
            inner.end = state;
        }
        ProgressHolder {
            inner: Arc::clone(&self.inner),
            state,
        }
    }

    /// Advance the end state to `state` if it sorts later, without
    /// pinning anything.
    pub fn advance(&self, state: CrawlState) {
        let mut inner = self.inner.lock();
        if state > inner.end {
            inner.end = state;
        }
    }
}

/// Scoped pin on one in-flight state; removed on drop.
#[derive(Debug)]
pub struct ProgressHolder {
    inner: Arc<Mutex<ProgressInner>>,
    state: CrawlState,
}

impl ProgressHolder {
    #[must_use]
    pub fn get(&self) -> CrawlState {
        self.state
    }
}

impl Drop for ProgressHolder {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.held.get_mut(&self.state) {
            *count -= 1;
            if *count == 0 {
                inner.held.remove(&self.state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbs_types::RootId;

    fn state(objectid: u64, offset: u64) -> CrawlState {
        CrawlState {
            root: RootId(5),
            objectid,
            offset,
            min_transid: 0,
            max_transid: 100,
            started: 0,
        }
    }

    #[test]
    fn begin_is_end_without_holds() {
        let tracker = ProgressTracker::new(state(1, 0));
        assert_eq!(tracker.begin(), state(1, 0));
        assert_eq!(tracker.end(), state(1, 0));
    }

    #[test]
    fn begin_is_min_held() {
        let tracker = ProgressTracker::new(state(1, 0));
        let _late = tracker.hold(state(9, 0));
        let early = tracker.hold(state(2, 0));
        assert_eq!(tracker.begin(), state(2, 0));
        assert_eq!(tracker.end(), state(9, 0));
        drop(early);
        assert_eq!(tracker.begin(), state(9, 0));
    }

    #[test]
    fn end_never_regresses() {
        let tracker = ProgressTracker::new(state(9, 0));
        tracker.advance(state(2, 0));
        assert_eq!(tracker.end(), state(9, 0));
        let hold = tracker.hold(state(2, 0));
        assert_eq!(tracker.end(), state(9, 0));
        assert_eq!(tracker.begin(), state(2, 0));
        drop(hold);
        assert_eq!(tracker.begin(), state(9, 0));
    }

    #[test]
    fn duplicate_holds_count() {
        let tracker = ProgressTracker::new(state(1, 0));
        let a = tracker.hold(state(3, 0));
        let b = tracker.hold(state(3, 0));
        drop(a);
        assert_eq!(tracker.begin(), state(3, 0));
        drop(b);
        assert_eq!(tracker.begin(), state(3, 0));
        assert_eq!(tracker.end(), state(3, 0));
    }

    #[test]
    fn crash_resume_is_at_or_before_dropped_holder() {
        // A work unit holds its next position, then vanishes before
        // committing. The persisted begin() never moved past it.
        let tracker = ProgressTracker::new(state(1, 0));
        let committed = tracker.hold(state(4, 0));
        let in_flight = tracker.hold(state(5, 0));
        assert!(tracker.begin() <= in_flight.get());
        drop(in_flight); // crash: never committed
        assert!(tracker.begin() <= state(5, 0));
        drop(committed);
    }
}
