use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

mod entry;
pub mod evictor;

pub use entry::{BeaconCacheEntry, CacheRecord};

/// Shared store of serialized records, keyed by beacon id.
///
/// Appends, chunk extraction, and eviction run concurrently; each entry is
/// guarded by its map shard and the byte total is a single atomic counter.
/// The counter tracks pending records only; records moved to the in-flight
/// shadow slot are invisible to eviction until restored.
#[derive(Default)]
pub struct BeaconCache {
    entries: DashMap<i32, BeaconCacheEntry>,
    total_bytes: AtomicUsize,
}

impl BeaconCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a serialized event record for `beacon_id`.
    pub fn add_event_data(&self, beacon_id: i32, timestamp: i64, data: String) {
        let record = CacheRecord::new(timestamp, data);
        let size = record.size();
        self.entries
            .entry(beacon_id)
            .or_default()
            .events
            .push_back(record);
        self.total_bytes.fetch_add(size, Ordering::AcqRel);
    }

    /// Appends a serialized action record for `beacon_id`.
    pub fn add_action_data(&self, beacon_id: i32, timestamp: i64, data: String) {
        let record = CacheRecord::new(timestamp, data);
        let size = record.size();
        self.entries
            .entry(beacon_id)
            .or_default()
            .actions
            .push_back(record);
        self.total_bytes.fetch_add(size, Ordering::AcqRel);
    }

    /// Extracts the next chunk for `beacon_id`.
    ///
    /// Records move oldest-first (events before actions) into the in-flight
    /// shadow slot and are joined onto `prefix` with `delimiter`. The size
    /// check runs before each append, so a chunk may exceed `max_size_bytes`
    /// by at most one record, guaranteeing forward progress. Any leftover
    /// shadow data from an aborted extraction is restored first. Returns an
    /// empty string when there is nothing to send.
    pub fn next_chunk(
        &self,
        beacon_id: i32,
        prefix: &str,
        max_size_bytes: usize,
        delimiter: char,
    ) -> String {
        let Some(mut entry) = self.entries.get_mut(&beacon_id) else {
            return String::new();
        };

        if entry.has_in_flight_data() {
            let restored = entry.restore_in_flight();
            self.total_bytes.fetch_add(restored, Ordering::AcqRel);
        }

        if !entry.has_pending_data() {
            return String::new();
        }

        let mut chunk = String::with_capacity(max_size_bytes.min(64 * 1024));
        chunk.push_str(prefix);
        let mut moved_bytes = 0;

        while chunk.len() <= max_size_bytes {
            let Some(record) = entry.events.pop_front() else {
                break;
            };
            chunk.push(delimiter);
            chunk.push_str(&record.data);
            moved_bytes += record.size();
            entry.sent_events.push(record);
        }

        while chunk.len() <= max_size_bytes {
            let Some(record) = entry.actions.pop_front() else {
                break;
            };
            chunk.push(delimiter);
            chunk.push_str(&record.data);
            moved_bytes += record.size();
            entry.sent_actions.push(record);
        }

        self.total_bytes.fetch_sub(moved_bytes, Ordering::AcqRel);
        chunk
    }

    /// Puts in-flight records back at the front of their sequences, so the
    /// next extraction rebuilds byte-identical content.
    pub fn restore_chunk(&self, beacon_id: i32) {
        if let Some(mut entry) = self.entries.get_mut(&beacon_id) {
            let restored = entry.restore_in_flight();
            self.total_bytes.fetch_add(restored, Ordering::AcqRel);
        }
    }

    /// Discards in-flight records after an acknowledged send.
    pub fn commit_chunk(&self, beacon_id: i32) {
        if let Some(mut entry) = self.entries.get_mut(&beacon_id) {
            entry.commit_in_flight();
        }
    }

    /// Drops all data for `beacon_id`, pending and in-flight alike.
    pub fn delete_entry(&self, beacon_id: i32) {
        if let Some((_, entry)) = self.entries.remove(&beacon_id) {
            let pending: usize = entry
                .events
                .iter()
                .chain(entry.actions.iter())
                .map(|r| r.size())
                .sum();
            self.total_bytes.fetch_sub(pending, Ordering::AcqRel);
        }
    }

    /// True when no data whatsoever remains for `beacon_id`.
    pub fn is_empty(&self, beacon_id: i32) -> bool {
        self.entries
            .get(&beacon_id)
            .map(|entry| entry.is_empty())
            .unwrap_or(true)
    }

    /// Total pending bytes across all beacons (in-flight data excluded).
    pub fn num_bytes_in_cache(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    /// One eviction pass.
    ///
    /// Age eviction runs unconditionally, dropping records captured before
    /// `now - max_record_age`. Memory eviction only engages once the byte
    /// total exceeds `upper_bound_bytes` and then removes globally-oldest
    /// records until the total is at or below `lower_bound_bytes`.
    pub fn run_eviction(
        &self,
        now: i64,
        max_record_age: Duration,
        lower_bound_bytes: usize,
        upper_bound_bytes: usize,
    ) {
        let min_timestamp = now - max_record_age.as_millis() as i64;
        let mut freed_by_age = 0;
        for mut entry in self.entries.iter_mut() {
            freed_by_age += entry.evict_records_older_than(min_timestamp);
        }
        if freed_by_age > 0 {
            self.total_bytes.fetch_sub(freed_by_age, Ordering::AcqRel);
            debug!(freed_bytes = freed_by_age, "evicted expired records");
        }

        if self.num_bytes_in_cache() <= upper_bound_bytes {
            return;
        }

        let mut freed_by_size = 0;
        while self.num_bytes_in_cache() > lower_bound_bytes {
            let Some(oldest_id) = self.find_beacon_with_oldest_record() else {
                break;
            };
            let Some(mut entry) = self.entries.get_mut(&oldest_id) else {
                continue;
            };
            let freed = entry.evict_oldest_record();
            if freed == 0 {
                break;
            }
            freed_by_size += freed;
            self.total_bytes.fetch_sub(freed, Ordering::AcqRel);
        }

        if freed_by_size > 0 {
            debug!(
                freed_bytes = freed_by_size,
                remaining_bytes = self.num_bytes_in_cache(),
                "evicted records over memory bound",
            );
        }
    }

    fn find_beacon_with_oldest_record(&self) -> Option<i32> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .oldest_pending_timestamp()
                    .map(|ts| (*entry.key(), ts))
            })
            .min_by_key(|(_, ts)| *ts)
            .map(|(id, _)| id)
    }
}
