//! `egress-rate`: per-exit-IP rolling-window rate accounting.
//!
//! This crate keeps track of how many times each named user action has been
//! performed through each exit IP, over a rolling window configured per
//! action.  It is the bookkeeping half of an egress manager: the manager
//! decides *when* to rotate an exit; this crate answers *whether* an exit
//! still has budget left.
//!
//! The store is deliberately simple: a map from IP to a map from action name
//! to an append-only series of millisecond timestamps, oldest first.  Old
//! entries are preened lazily, and the whole map can be snapshotted to (and
//! reloaded from) a JSON cache file so that restarting the process does not
//! forget recent usage.

#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

/// Wrapper type for Results returned from this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// How many distinct IPs we track before [`RateStore::needs_compact`]
/// starts returning true.
pub const DEFAULT_COMPACT_THRESHOLD: usize = 500;

/// Rolling window applied to an action when none is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Exit IPs that must never be used, no matter what the counts say.
///
/// These are known-bad exits (sinkholes, interception boxes); an IP on this
/// list is reported as exhausted on sight.
const DEFAULT_BLACKLIST: &[&str] = &["163.172.67.180"];

/// Milliseconds since the Unix epoch, as used for every timestamp in the
/// store.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Return the default cache file name for this version of the crate.
///
/// The version tag means an upgraded process starts from a clean cache
/// rather than trying to interpret an older layout.
pub fn default_cache_file_name() -> String {
    format!("proxyratecache-{}.json", env!("CARGO_PKG_VERSION"))
}

/// The limit and window configured for one named action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct ActionLimit {
    /// Maximum number of actions allowed within the window.
    pub limit: u32,
    /// Length of the rolling window.
    pub window: Duration,
}

/// Timestamp series for every action performed through a single IP.
type IpRecord = HashMap<String, Vec<u64>>;

/// Rolling-window usage accounting, keyed by exit IP.
///
/// The store is indexed by IP rather than by circuit: several circuits can
/// transit the same exit IP, and a single circuit's exit IP changes over
/// time.  Circuits remember their *current* IP; this store is the source of
/// truth for usage under that IP.
#[derive(Debug, Clone)]
pub struct RateStore {
    /// Catalog of registered actions and their limits.
    actions: HashMap<String, ActionLimit>,
    /// Per-IP, per-action series of ms-epoch timestamps, oldest first.
    ips: HashMap<String, IpRecord>,
    /// Exit IPs refused on sight.
    blacklist: HashSet<String>,
    /// Tracked-IP count above which compaction is requested.
    compact_threshold: usize,
}

impl Default for RateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RateStore {
    /// Create an empty store with the compiled-in blacklist.
    pub fn new() -> Self {
        RateStore {
            actions: HashMap::new(),
            ips: HashMap::new(),
            blacklist: DEFAULT_BLACKLIST.iter().map(|s| s.to_string()).collect(),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }

    /// Register (or re-register) an action.
    ///
    /// Registration is keyed by name; a later registration overwrites the
    /// previous limit and window.
    pub fn register_action(&mut self, name: &str, limit: u32, window: Option<Duration>) {
        let window = window.unwrap_or(DEFAULT_WINDOW);
        self.actions
            .insert(name.to_owned(), ActionLimit { limit, window });
    }

    /// Return the configured limit for `action`, if registered.
    pub fn action_limit(&self, action: &str) -> Option<ActionLimit> {
        self.actions.get(action).copied()
    }

    /// Add `ip` to the blacklist.
    pub fn blacklist_ip(&mut self, ip: &str) {
        self.blacklist.insert(ip.to_owned());
    }

    /// Return true if `ip` is blacklisted.
    pub fn is_blacklisted(&self, ip: &str) -> bool {
        self.blacklist.contains(ip)
    }

    /// Ensure an entry exists for `ip`, with a (possibly empty) series for
    /// every registered action.
    pub fn touch(&mut self, ip: &str) {
        let rec = self.ips.entry(ip.to_owned()).or_default();
        for name in self.actions.keys() {
            rec.entry(name.clone()).or_default();
        }
    }

    /// Append `now_ms` to the series for (`ip`, `action`), creating entries
    /// as needed.
    ///
    /// The timestamp is captured when the action is *reported*, not when it
    /// completes at the wire.
    pub fn record(&mut self, ip: &str, action: &str, now_ms: u64) -> Result<()> {
        if !self.actions.contains_key(action) {
            return Err(Error::UnknownAction(action.to_owned()));
        }
        self.touch(ip);
        let rec = self.ips.entry(ip.to_owned()).or_default();
        rec.entry(action.to_owned()).or_default().push(now_ms);
        Ok(())
    }

    /// Number of recorded timestamps for (`ip`, `action`), without preening.
    pub fn count(&self, ip: &str, action: &str) -> usize {
        self.ips
            .get(ip)
            .and_then(|rec| rec.get(action))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Would one more `action` through `ip` stay under the limit?
    ///
    /// An IP we have never seen is fresh and therefore available; a
    /// blacklisted IP is exhausted regardless of its counts.  Otherwise the
    /// series is preened and compared against the action's limit.
    pub fn is_available(&mut self, ip: &str, action: &str, now_ms: u64) -> Result<bool> {
        let limits = *self
            .actions
            .get(action)
            .ok_or_else(|| Error::UnknownAction(action.to_owned()))?;
        if self.blacklist.contains(ip) {
            debug!("exit IP {} is blacklisted; reporting exhausted", ip);
            return Ok(false);
        }
        if !self.ips.contains_key(ip) {
            return Ok(true);
        }
        self.preen(ip, now_ms);
        let used = self.count(ip, action);
        Ok(used < limits.limit as usize)
    }

    /// Drop timestamps for `ip` that have aged out of their action's window.
    ///
    /// The comparison is strict: an entry is dropped only when
    /// `now - t > window`, so a timestamp exactly at the boundary survives.
    pub fn preen(&mut self, ip: &str, now_ms: u64) {
        let Some(rec) = self.ips.get_mut(ip) else {
            return;
        };
        for (action, series) in rec.iter_mut() {
            let window_ms = self
                .actions
                .get(action)
                .map(|a| a.window.as_millis() as u64)
                .unwrap_or(DEFAULT_WINDOW.as_millis() as u64);
            let cutoff = now_ms.saturating_sub(window_ms);
            // Series are oldest-first, so expired entries form a prefix.
            let keep_from = series.partition_point(|&t| now_ms.saturating_sub(t) > window_ms);
            debug_assert!(series[keep_from..].iter().all(|&t| t >= cutoff));
            if keep_from > 0 {
                series.drain(..keep_from);
            }
        }
    }

    /// True once the number of tracked IPs exceeds the compaction
    /// threshold.
    pub fn needs_compact(&self) -> bool {
        self.ips.len() > self.compact_threshold
    }

    /// Preen every IP, then drop any IP whose series are all empty and
    /// which is not in `keep` (the set of IPs some live circuit is
    /// currently presenting).
    pub fn compact(&mut self, now_ms: u64, keep: &HashSet<String>) {
        let ips: Vec<String> = self.ips.keys().cloned().collect();
        for ip in &ips {
            self.preen(ip, now_ms);
        }
        let before = self.ips.len();
        self.ips
            .retain(|ip, rec| keep.contains(ip) || rec.values().any(|s| !s.is_empty()));
        debug!(
            "compacted rate store: {} tracked IPs -> {}",
            before,
            self.ips.len()
        );
    }

    /// Copy (not move) the timestamps of `old_ip` strictly newer than
    /// `since_ms` into `new_ip`'s series, action by action.
    ///
    /// Actions reported between the last poll of a circuit and the moment a
    /// new IP was observed may have gone out through either exit; counting
    /// them against both keeps every exit under its limit at the cost of
    /// some double-counting over that narrow window.
    pub fn copy_ambiguous(&mut self, old_ip: &str, new_ip: &str, since_ms: u64) {
        self.touch(new_ip);
        let Some(old_rec) = self.ips.get(old_ip) else {
            return;
        };
        let mut moved: Vec<(String, Vec<u64>)> = Vec::new();
        for (action, series) in old_rec.iter() {
            let from = series.partition_point(|&t| t <= since_ms);
            if from < series.len() {
                moved.push((action.clone(), series[from..].to_vec()));
            }
        }
        if moved.is_empty() {
            return;
        }
        let new_rec = self.ips.entry(new_ip.to_owned()).or_default();
        for (action, mut tail) in moved {
            let series = new_rec.entry(action).or_default();
            series.append(&mut tail);
            series.sort_unstable();
        }
    }

    /// Serialize the full per-IP map to `path` as a JSON object
    /// `{ "<ip>": { "<action>": [ms, ...] } }`, overwriting any previous
    /// file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(&self.ips).map_err(store_error)?;
        std::fs::write(path, bytes)?;
        debug!("saved rate cache ({} IPs) to {:?}", self.ips.len(), path);
        Ok(())
    }

    /// Replace the per-IP map with the contents of `path`.
    ///
    /// An absent or unreadable file yields an empty map: the cache is
    /// best-effort, and losing it only means we may briefly over-use an
    /// exit after a restart.
    pub fn load(&mut self, path: &Path) {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.ips = HashMap::new();
                return;
            }
            Err(e) => {
                warn!("could not read rate cache {:?}: {}", path, e);
                self.ips = HashMap::new();
                return;
            }
        };
        match serde_json::from_slice::<HashMap<String, IpRecord>>(&bytes) {
            Ok(map) => {
                debug!("loaded rate cache ({} IPs) from {:?}", map.len(), path);
                self.ips = map;
            }
            Err(e) => {
                warn!("rate cache {:?} is unreadable ({}); starting empty", path, e);
                self.ips = HashMap::new();
            }
        }
    }

    /// Number of IPs currently tracked.
    pub fn n_tracked_ips(&self) -> usize {
        self.ips.len()
    }
}

/// An error from the rate store.
//
// IO and JSON sources are wrapped in Arc so that this error stays Clone and
// callers can `#[from]` it into their own error types.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Tried to record or query an action that was never registered.
    #[error("action {0:?} is not registered")]
    UnknownAction(String),

    /// An IO error occurred while reading or writing the cache file.
    #[error("IO error on rate cache")]
    Io(#[source] Arc<std::io::Error>),

    /// Problem when serializing JSON data.
    ///
    /// There is no deserialization counterpart: an unreadable cache file
    /// is not an error, it is an empty store.
    #[error("JSON serialization error")]
    Serialize(#[source] Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(Arc::new(e))
    }
}

/// Error conversion for JSON errors; use only when storing.
fn store_error(e: serde_json::Error) -> Error {
    Error::Serialize(Arc::new(e))
}
