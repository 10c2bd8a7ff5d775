//! Server-side record of which content hashes were already announced.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::hash::ContentHash;

/// Hashes reported by a sync-check and not yet requested by any client.
///
/// A hash in the set is left out of the next report. Requesting a hash
/// removes it. With a TTL, an announcement older than the TTL no longer
/// suppresses the hash, so content announced to a client that never asks
/// for it is eventually offered again.
#[derive(Debug)]
pub struct AnnouncedSet {
    ttl: Option<Duration>,
    entries: Mutex<HashMap<ContentHash, Instant>>,
}

impl AnnouncedSet {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn is_live(&self, announced_at: Instant, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(announced_at) < ttl,
            None => true,
        }
    }

    /// Filter a scan down to the hashes not currently announced and record
    /// those as announced. Filtering and recording happen under one lock, so
    /// concurrent checks never report the same hash twice.
    pub fn announce<I>(&self, scanned: I) -> BTreeSet<ContentHash>
    where
        I: IntoIterator<Item = ContentHash>,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, at| self.is_live(*at, now));

        let mut fresh = BTreeSet::new();
        for hash in scanned {
            if entries.contains_key(&hash) {
                continue;
            }
            entries.insert(hash, now);
            fresh.insert(hash);
        }
        fresh
    }

    /// Forget hashes a client has requested.
    pub fn mark_delivered<'a, I>(&self, hashes: I)
    where
        I: IntoIterator<Item = &'a ContentHash>,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for hash in hashes {
            entries.remove(hash);
        }
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(hash)
            .is_some_and(|at| self.is_live(*at, Instant::now()))
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|at| self.is_live(**at, now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AnnouncedSet {
    fn default() -> Self {
        Self::new(None)
    }
}
