use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::BeaconCache;
use crate::config::Config;
use crate::protocol::beacon::Beacon;
use crate::protocol::http::HttpClient;
use crate::protocol::status::{ServerPolicy, StatusResponse};
use crate::providers::{
    DefaultPrnGenerator, DefaultThreadIdProvider, PrnGenerator, SystemTimingProvider,
    ThreadIdProvider, ThreadSuspender, TimingProvider,
};
use crate::session::SessionHandle;

/// One-shot latch signalling the end of the initial server handshake.
///
/// Completes at most once; any number of waiters observe the same outcome.
pub struct InitLatch {
    tx: watch::Sender<Option<bool>>,
}

impl Default for InitLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl InitLatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Records the outcome; later calls are ignored.
    pub fn complete(&self, success: bool) {
        self.tx.send_if_modified(|value| {
            if value.is_none() {
                *value = Some(success);
                true
            } else {
                false
            }
        });
    }

    pub fn is_completed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn was_successful(&self) -> bool {
        *self.tx.borrow() == Some(true)
    }

    /// Waits until completion, returning the outcome.
    pub async fn wait(&self) -> bool {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(|value| value.is_some()).await {
            Ok(value) => value.unwrap_or(false),
            Err(_) => false,
        };
        outcome
    }

    /// Waits until completion or the timeout; `None` on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<bool> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

/// Shared state of the sender task: transport, policy, cache, session
/// registry, and the timestamps the state machine schedules from.
pub struct SendingContext<H: HttpClient> {
    http: H,
    config: Config,
    cache: Arc<BeaconCache>,
    policy: Arc<ServerPolicy>,
    timing: Arc<dyn TimingProvider>,
    thread_ids: Arc<dyn ThreadIdProvider>,
    prng: Box<dyn PrnGenerator>,
    cancel: CancellationToken,
    suspender: ThreadSuspender,
    init_latch: InitLatch,
    sessions: Mutex<Vec<Arc<SessionHandle>>>,
    next_beacon_id: AtomicI32,
    last_status_check_time: AtomicI64,
    last_open_session_send_time: AtomicI64,
}

impl<H: HttpClient> SendingContext<H> {
    pub fn new(config: Config, http: H) -> Self {
        Self::with_providers(
            config,
            http,
            Arc::new(SystemTimingProvider),
            Arc::new(DefaultThreadIdProvider),
            Box::new(DefaultPrnGenerator),
        )
    }

    pub fn with_providers(
        config: Config,
        http: H,
        timing: Arc<dyn TimingProvider>,
        thread_ids: Arc<dyn ThreadIdProvider>,
        prng: Box<dyn PrnGenerator>,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            http,
            cache: Arc::new(BeaconCache::new()),
            policy: Arc::new(ServerPolicy::with_default_server_id(
                config.send.default_server_id,
            )),
            config,
            timing,
            thread_ids,
            prng,
            suspender: ThreadSuspender::new(cancel.clone()),
            cancel,
            init_latch: InitLatch::new(),
            sessions: Mutex::new(Vec::new()),
            next_beacon_id: AtomicI32::new(0),
            last_status_check_time: AtomicI64::new(0),
            last_open_session_send_time: AtomicI64::new(0),
        }
    }

    pub fn http(&self) -> &H {
        &self.http
    }

    pub fn cache(&self) -> &Arc<BeaconCache> {
        &self.cache
    }

    pub fn policy(&self) -> &Arc<ServerPolicy> {
        &self.policy
    }

    pub fn timing(&self) -> &Arc<dyn TimingProvider> {
        &self.timing
    }

    pub fn suspender(&self) -> &ThreadSuspender {
        &self.suspender
    }

    pub fn init_latch(&self) -> &InitLatch {
        &self.init_latch
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn last_status_check_time(&self) -> i64 {
        self.last_status_check_time.load(Ordering::Acquire)
    }

    pub fn set_last_status_check_time(&self, timestamp: i64) {
        self.last_status_check_time
            .store(timestamp, Ordering::Release);
    }

    pub fn last_open_session_send_time(&self) -> i64 {
        self.last_open_session_send_time.load(Ordering::Acquire)
    }

    pub fn set_last_open_session_send_time(&self, timestamp: i64) {
        self.last_open_session_send_time
            .store(timestamp, Ordering::Release);
    }

    // --- Session registry ---

    /// Creates a new session and registers it for sending.
    pub fn create_session(&self) -> Arc<SessionHandle> {
        let beacon_id = self.next_beacon_id.fetch_add(1, Ordering::AcqRel) + 1;
        let beacon = Arc::new(Beacon::new(
            beacon_id,
            &self.config,
            Arc::clone(&self.cache),
            Arc::clone(&self.policy),
            Arc::clone(&self.timing),
            Arc::clone(&self.thread_ids),
            self.prng.as_ref(),
        ));

        let session = SessionHandle::new(beacon);
        self.sessions.lock().push(Arc::clone(&session));
        session
    }

    pub fn all_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.lock().clone()
    }

    /// Sessions still waiting for their server configuration.
    pub fn new_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .iter()
            .filter(|s| !s.is_configured())
            .cloned()
            .collect()
    }

    /// Configured sessions that are still running.
    pub fn open_configured_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.is_configured() && !s.is_finished())
            .cloned()
            .collect()
    }

    /// Configured sessions that have ended and await draining.
    pub fn finished_configured_sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.is_configured() && s.is_finished())
            .cloned()
            .collect()
    }

    pub fn remove_session(&self, session: &Arc<SessionHandle>) {
        self.sessions.lock().retain(|s| !Arc::ptr_eq(s, session));
    }

    /// Turns capture off and discards everything already recorded.
    ///
    /// Finished sessions have nothing left to contribute and are dropped
    /// from the registry.
    pub fn disable_capture_and_clear(&self) {
        self.policy.disable_capture();
        self.clear_all_session_data();
    }

    /// Applies a collector response; when it leaves capture disabled, all
    /// recorded data is discarded.
    pub fn handle_status_response(&self, response: &StatusResponse) {
        self.policy.handle_status_response(response);
        if !self.policy.is_capture_on() {
            self.clear_all_session_data();
        }
    }

    fn clear_all_session_data(&self) {
        let sessions = self.all_sessions();
        for session in &sessions {
            session.clear_captured_data();
            if session.is_finished() {
                self.remove_session(session);
            }
        }
    }
}
