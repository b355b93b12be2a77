use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::protocol::beacon::Beacon;
use crate::protocol::status::ResponseAttributes;

/// Handle tying one session's beacon to its sending lifecycle.
///
/// The sender task partitions handles by the `configured` and `finished`
/// flags: new sessions await their server configuration, open configured
/// sessions are sent periodically, finished configured sessions are drained
/// and removed.
pub struct SessionHandle {
    beacon: Arc<Beacon>,
    configured: AtomicBool,
    finished: AtomicBool,
}

impl SessionHandle {
    /// Creates the handle and records the session start marker.
    pub fn new(beacon: Arc<Beacon>) -> Arc<Self> {
        beacon.start_session();
        Arc::new(Self {
            beacon,
            configured: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    pub fn beacon(&self) -> &Arc<Beacon> {
        &self.beacon
    }

    pub fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Applies the server configuration snapshot and marks the session ready
    /// for sending.
    pub fn configure(&self, attrs: &ResponseAttributes, capture: bool) {
        self.beacon.update_server_configuration(attrs, capture);
        self.configured.store(true, Ordering::Release);
    }

    /// Ends the session; only the first call records the end marker.
    pub fn end(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.beacon.end_session();
        }
    }

    /// Drops all unsent data for this session.
    pub fn clear_captured_data(&self) {
        self.beacon.clear_data();
    }

    /// True when nothing remains to send for this session.
    pub fn is_data_empty(&self) -> bool {
        self.beacon.is_empty()
    }
}
