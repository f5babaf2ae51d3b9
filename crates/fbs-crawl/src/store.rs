//! Durable crawl state: the `beescrawl.dat` text file.
//!
//! One cursor per line, `key value` pairs separated by single spaces.
//! The format (including the `gen_current`/`gen_next` read aliases) is
//! shared with the original daemon, so either implementation can pick
//! up the other's state file.

use crate::counters::Counters;
use crate::state::CrawlState;
use chrono::TimeZone;
use fbs_error::{FbsError, Result};
use fbs_types::RootId;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// State file name. A legacy UUID suffix was removed long ago.
pub const CRAWL_STATE_FILENAME: &str = "beescrawl.dat";

/// Dirty/clean generation pair guarding state writeback.
///
/// `dirty` advances on every cursor mutation; `clean` records the dirty
/// generation present when a flush succeeded. `dirty >= clean` always.
#[derive(Debug, Default)]
pub struct DirtyGen {
    dirty: AtomicU64,
    clean: AtomicU64,
}

impl DirtyGen {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&self) {
        self.dirty.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn dirty(&self) -> u64 {
        self.dirty.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn clean(&self) -> u64 {
        self.clean.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty() != self.clean()
    }

    fn mark_clean(&self, generation: u64) {
        self.clean.store(generation, Ordering::Release);
    }
}

/// Parse one state file value: `0x`-prefixed hex, decimal, or bare hex.
fn parse_u64(token: &str) -> Option<u64> {
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    token
        .parse::<u64>()
        .ok()
        .or_else(|| u64::from_str_radix(token, 16).ok())
}

fn format_started(started: u64) -> String {
    let Ok(secs) = i64::try_from(started) else {
        return String::from("invalid");
    };
    match chrono::Local.timestamp_opt(secs, 0).single() {
        Some(ts) => ts.format("%Y-%m-%d-%H-%M-%S").to_string(),
        None => String::from("invalid"),
    }
}

/// Text-format load/save of all cursor states.
pub struct CrawlStateStore {
    home: PathBuf,
    dirt: Arc<DirtyGen>,
    counters: Arc<Counters>,
}

impl CrawlStateStore {
    #[must_use]
    pub fn new(home: impl Into<PathBuf>, dirt: Arc<DirtyGen>, counters: Arc<Counters>) -> Self {
        Self {
            home: home.into(),
            dirt,
            counters,
        }
    }

    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.home.join(CRAWL_STATE_FILENAME)
    }

    fn parse_line(&self, lineno: usize, line: &str) -> Result<CrawlState> {
        let mut fields: HashMap<&str, u64> = HashMap::new();
        let mut tokens = line.split_whitespace();
        while let Some(key) = tokens.next() {
            let Some(value) = tokens.next() else {
                return Err(FbsError::StateParse {
                    line: lineno,
                    detail: format!("key {key:?} has no value"),
                });
            };
            // The timestamp is for humans; `started` carries the data.
            if key == "start_ts" {
                continue;
            }
            let Some(value) = parse_u64(value) else {
                return Err(FbsError::StateParse {
                    line: lineno,
                    detail: format!("unparseable value {value:?} for key {key:?}"),
                });
            };
            if fields.insert(key, value).is_some() {
                return Err(FbsError::StateParse {
                    line: lineno,
                    detail: format!("duplicate key {key:?}"),
                });
            }
        }
        let require = |key: &str| {
            fields.get(key).copied().ok_or_else(|| FbsError::StateParse {
                line: lineno,
                detail: format!("missing key {key:?}"),
            })
        };
        let min_transid = fields
            .get("gen_current")
            .or_else(|| fields.get("min_transid"))
            .copied()
            .ok_or_else(|| FbsError::StateParse {
                line: lineno,
                detail: "missing key \"min_transid\"".to_owned(),
            })?;
        let max_transid = fields
            .get("gen_next")
            .or_else(|| fields.get("max_transid"))
            .copied()
            .ok_or_else(|| FbsError::StateParse {
                line: lineno,
                detail: "missing key \"max_transid\"".to_owned(),
            })?;
        let mut state = CrawlState {
            root: RootId(require("root")?),
            objectid: require("objectid")?,
            offset: require("offset")?,
            min_transid,
            max_transid,
            started: fields.get("started").copied().unwrap_or(0),
        };
        if state.min_transid == u64::MAX {
            warn!(root = %state.root, "bad min_transid in state file, resetting to 0");
            state.min_transid = 0;
            self.counters.bump("bug_bad_min_transid");
        }
        if state.max_transid == u64::MAX {
            warn!(
                root = %state.root,
                min_transid = state.min_transid,
                "bad max_transid in state file, resetting to min_transid"
            );
            state.max_transid = state.min_transid;
            self.counters.bump("bug_bad_max_transid");
        }
        Ok(state)
    }

    /// Load all persisted cursor states.
    ///
    /// A missing file is an empty state. A malformed line stops the
    /// load; lines parsed before it are kept.
    pub fn load(&self) -> Result<Vec<CrawlState>> {
        let path = self.path();
        let data = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no crawl state file, starting fresh");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };
        let mut states = Vec::new();
        for (idx, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match self.parse_line(idx + 1, line) {
                Ok(state) => {
                    debug!(%state, "loaded crawl state");
                    states.push(state);
                }
                Err(err) => {
                    warn!(error = %err, "stopping state load at malformed line");
                    break;
                }
            }
        }
        Ok(states)
    }

    /// Write all cursor states if anything changed since the last
    /// successful save.
    ///
    /// The file is replaced atomically (write to temp, rename). On
    /// failure the clean generation is untouched and the next interval
    /// retries.
    pub fn save(&self, states: &[CrawlState]) -> Result<()> {
        if !self.dirt.is_dirty() {
            debug!("crawl state clean, nothing to save");
            return Ok(());
        }
        let saved_generation = self.dirt.dirty();
        let save_timer = Instant::now();

        let mut text = String::new();
        for state in states {
            // A zero max_transid cursor has never observed a transid;
            // writing it would only seed garbage on reload.
            if state.max_transid == 0 {
                continue;
            }
            text.push_str(&format!(
                "root {} objectid {} offset {} min_transid {} max_transid {} started {} start_ts {}\n",
                state.root,
                state.objectid,
                state.offset,
                state.min_transid,
                state.max_transid,
                state.started,
                format_started(state.started),
            ));
        }

        if text.is_empty() {
            warn!("crawl state empty, not writing");
            self.dirt.mark_clean(saved_generation);
            return Ok(());
        }

        let path = self.path();
        let tmp = self.home.join(format!("{CRAWL_STATE_FILENAME}.tmp"));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;

        // This records the generation we saved, which is not
        // necessarily the current one.
        self.dirt.mark_clean(saved_generation);
        info!(
            path = %path.display(),
            elapsed_ms = save_timer.elapsed().as_millis() as u64,
            "saved crawl state"
        );
        Ok(())
    }

    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> CrawlStateStore {
        CrawlStateStore::new(dir, Arc::new(DirtyGen::new()), Arc::new(Counters::new()))
    }

    fn state(root: u64, objectid: u64, offset: u64, min: u64, max: u64) -> CrawlState {
        CrawlState {
            root: RootId(root),
            objectid,
            offset,
            min_transid: min,
            max_transid: max,
            started: 1_700_000_000,
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let states = vec![state(5, 258, 0, 0, 100), state(256, 0, 0, 100, 120)];
        store.dirt.mark_dirty();
        store.save(&states).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, states);
    }

    #[test]
    fn read_aliases_and_default_started() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CRAWL_STATE_FILENAME),
            "root 5 objectid 258 offset 0 gen_current 10 gen_next 20\n",
        )
        .unwrap();
        let store = store_in(dir.path());
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].min_transid, 10);
        assert_eq!(loaded[0].max_transid, 20);
        assert_eq!(loaded[0].started, 0);
    }

    #[test]
    fn hex_values_accepted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CRAWL_STATE_FILENAME),
            "root 5 objectid 0x102 offset 0 min_transid 0 max_transid 64\n",
        )
        .unwrap();
        let store = store_in(dir.path());
        let loaded = store.load().unwrap();
        assert_eq!(loaded[0].objectid, 0x102);
        assert_eq!(loaded[0].max_transid, 64);
    }

    #[test]
    fn corrupted_max_transid_repaired() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CRAWL_STATE_FILENAME),
            "root 5 objectid 0 offset 0 min_transid 42 max_transid ffffffffffffffff\n",
        )
        .unwrap();
        let counters = Arc::new(Counters::new());
        let store =
            CrawlStateStore::new(dir.path(), Arc::new(DirtyGen::new()), Arc::clone(&counters));
        let loaded = store.load().unwrap();
        assert_eq!(loaded[0].max_transid, 42);
        assert_eq!(counters.get("bug_bad_max_transid"), 1);
        assert_eq!(counters.get("bug_bad_min_transid"), 0);
    }

    #[test]
    fn malformed_line_keeps_earlier_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CRAWL_STATE_FILENAME),
            "root 5 objectid 1 offset 0 min_transid 0 max_transid 9\nroot oops\n",
        )
        .unwrap();
        let store = store_in(dir.path());
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].root, RootId(5));
    }

    #[test]
    fn save_is_idempotent_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let states = vec![state(5, 1, 0, 0, 9)];
        store.dirt.mark_dirty();
        store.save(&states).unwrap();
        // Remove the file; a second save with no new dirt must not
        // rewrite it.
        fs::remove_file(store.path()).unwrap();
        store.save(&states).unwrap();
        assert!(!store.path().exists());
        // New dirt triggers a real write again.
        store.dirt.mark_dirty();
        store.save(&states).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn zero_max_transid_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.dirt.mark_dirty();
        store.save(&[state(5, 0, 0, 0, 0)]).unwrap();
        // Nothing written; treated as clean.
        assert!(!store.path().exists());
        assert!(!store.dirt.is_dirty());
    }
}
