use std::collections::VecDeque;

/// One timestamped, pre-serialized record waiting to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Serialized key=value record data.
    pub data: String,
}

impl CacheRecord {
    pub fn new(timestamp: i64, data: String) -> Self {
        Self { timestamp, data }
    }

    /// Bytes this record contributes to the cache total.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Per-beacon record storage: normal event/action sequences plus the
/// in-flight shadow slot holding records of the chunk currently being sent.
///
/// Shadow records are excluded from the byte total so eviction can never
/// touch data an active send might still restore.
#[derive(Debug, Default)]
pub struct BeaconCacheEntry {
    pub events: VecDeque<CacheRecord>,
    pub actions: VecDeque<CacheRecord>,
    pub sent_events: Vec<CacheRecord>,
    pub sent_actions: Vec<CacheRecord>,
}

impl BeaconCacheEntry {
    /// True iff both normal sequences and the shadow slot are empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.actions.is_empty()
            && self.sent_events.is_empty()
            && self.sent_actions.is_empty()
    }

    pub fn has_pending_data(&self) -> bool {
        !self.events.is_empty() || !self.actions.is_empty()
    }

    pub fn has_in_flight_data(&self) -> bool {
        !self.sent_events.is_empty() || !self.sent_actions.is_empty()
    }

    /// Moves shadow records back to the front of their sequences,
    /// preserving the order in which they were extracted.
    pub fn restore_in_flight(&mut self) -> usize {
        let mut restored_bytes = 0;

        for record in self.sent_events.drain(..).rev() {
            restored_bytes += record.size();
            self.events.push_front(record);
        }
        for record in self.sent_actions.drain(..).rev() {
            restored_bytes += record.size();
            self.actions.push_front(record);
        }

        restored_bytes
    }

    /// Discards the shadow slot after a successful send.
    pub fn commit_in_flight(&mut self) {
        self.sent_events.clear();
        self.sent_actions.clear();
    }

    /// Removes records older than `min_timestamp`, returning freed bytes.
    pub fn evict_records_older_than(&mut self, min_timestamp: i64) -> usize {
        let mut freed = 0;
        freed += Self::evict_from(&mut self.events, min_timestamp);
        freed += Self::evict_from(&mut self.actions, min_timestamp);
        freed
    }

    fn evict_from(records: &mut VecDeque<CacheRecord>, min_timestamp: i64) -> usize {
        let before = records.len();
        let mut freed = 0;
        records.retain(|r| {
            if r.timestamp < min_timestamp {
                freed += r.size();
                false
            } else {
                true
            }
        });
        debug_assert!(records.len() <= before);
        freed
    }

    /// Timestamp of the oldest pending record, if any.
    pub fn oldest_pending_timestamp(&self) -> Option<i64> {
        let oldest_event = self.events.front().map(|r| r.timestamp);
        let oldest_action = self.actions.front().map(|r| r.timestamp);
        match (oldest_event, oldest_action) {
            (Some(e), Some(a)) => Some(e.min(a)),
            (Some(e), None) => Some(e),
            (None, Some(a)) => Some(a),
            (None, None) => None,
        }
    }

    /// Removes the single oldest pending record, returning freed bytes.
    pub fn evict_oldest_record(&mut self) -> usize {
        let oldest_event = self.events.front().map(|r| r.timestamp);
        let oldest_action = self.actions.front().map(|r| r.timestamp);

        let from_events = match (oldest_event, oldest_action) {
            (Some(e), Some(a)) => e <= a,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => return 0,
        };

        let removed = if from_events {
            self.events.pop_front()
        } else {
            self.actions.pop_front()
        };

        removed.map(|r| r.size()).unwrap_or(0)
    }
}
