//! Named monotonic event counters.
//!
//! Every component reports through one shared table so degraded
//! operation stays visible without log spelunking. Counter names are
//! static strings; a name's first bump creates the entry.

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Shared counter table.
#[derive(Debug, Default)]
pub struct Counters {
    table: Mutex<BTreeMap<&'static str, u64>>,
}

impl Counters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `name` by one.
    pub fn bump(&self, name: &'static str) {
        *self.table.lock().entry(name).or_insert(0) += 1;
    }

    /// Current value of `name` (0 if never bumped).
    #[must_use]
    pub fn get(&self, name: &str) -> u64 {
        self.table.lock().get(name).copied().unwrap_or(0)
    }

    /// Snapshot of the whole table.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        self.table.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_snapshot() {
        let counters = Counters::new();
        assert_eq!(counters.get("crawl_scan"), 0);
        counters.bump("crawl_scan");
        counters.bump("crawl_scan");
        counters.bump("crawl_hole");
        assert_eq!(counters.get("crawl_scan"), 2);
        let snap = counters.snapshot();
        assert_eq!(snap.get("crawl_hole"), Some(&1));
    }
}
