//! Deterministic fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::protocol::http::HttpClient;
use crate::protocol::status::StatusResponse;
use crate::providers::{PrnGenerator, ThreadIdProvider, TimingProvider};

/// Manually advanced clock.
pub struct FakeTiming {
    now: AtomicI64,
}

impl FakeTiming {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::AcqRel);
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::Release);
    }
}

impl TimingProvider for FakeTiming {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Returns a fixed thread id.
pub struct FakeThreadIdProvider {
    id: i32,
}

impl FakeThreadIdProvider {
    pub fn new(id: i32) -> Self {
        Self { id }
    }
}

impl ThreadIdProvider for FakeThreadIdProvider {
    fn thread_id(&self) -> i32 {
        self.id
    }
}

/// Returns a fixed "random" number.
pub struct FakePrng {
    value: i64,
}

impl FakePrng {
    pub fn new(value: i64) -> Self {
        Self { value }
    }
}

impl PrnGenerator for FakePrng {
    fn next_i64(&self, bound: i64) -> i64 {
        self.value.min(bound.saturating_sub(1)).max(0)
    }
}

/// Scriptable transport fake recording every request.
///
/// Queued responses are consumed first; once a queue is exhausted the
/// default response repeats.
pub struct FakeHttpClient {
    default_response: Option<StatusResponse>,
    status_queue: Mutex<VecDeque<Option<StatusResponse>>>,
    beacon_queue: Mutex<VecDeque<Option<StatusResponse>>>,
    status_calls: AtomicI32,
    status_request_times: Mutex<Vec<tokio::time::Instant>>,
    beacon_payloads: Mutex<Vec<Vec<u8>>>,
}

impl FakeHttpClient {
    pub fn new(default_response: Option<StatusResponse>) -> Self {
        Self {
            default_response,
            status_queue: Mutex::new(VecDeque::new()),
            beacon_queue: Mutex::new(VecDeque::new()),
            status_calls: AtomicI32::new(0),
            status_request_times: Mutex::new(Vec::new()),
            beacon_payloads: Mutex::new(Vec::new()),
        }
    }

    /// Every request succeeds with capture enabled.
    pub fn always_ok() -> Self {
        Self::new(Some(StatusResponse::parse(200, "cp=1")))
    }

    /// Scripted beacon responses, then successes.
    pub fn with_beacon_responses(responses: Vec<Option<StatusResponse>>) -> Self {
        let client = Self::always_ok();
        *client.beacon_queue.lock() = responses.into();
        client
    }

    /// Scripted status responses, then successes.
    pub fn with_status_responses(responses: Vec<Option<StatusResponse>>) -> Self {
        let client = Self::always_ok();
        *client.status_queue.lock() = responses.into();
        client
    }

    pub fn queue_status(&self, response: Option<StatusResponse>) {
        self.status_queue.lock().push_back(response);
    }

    pub fn status_calls(&self) -> i32 {
        self.status_calls.load(Ordering::Acquire)
    }

    pub fn status_request_times(&self) -> Vec<tokio::time::Instant> {
        self.status_request_times.lock().clone()
    }

    pub fn beacon_payloads(&self) -> Vec<Vec<u8>> {
        self.beacon_payloads.lock().clone()
    }
}

impl HttpClient for FakeHttpClient {
    async fn send_status_request(&self, _server_id: i32) -> Option<StatusResponse> {
        self.status_calls.fetch_add(1, Ordering::AcqRel);
        self.status_request_times
            .lock()
            .push(tokio::time::Instant::now());

        self.status_queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }

    async fn send_beacon_request(
        &self,
        _client_ip: &str,
        payload: &[u8],
        _server_id: i32,
    ) -> Option<StatusResponse> {
        self.beacon_payloads.lock().push(payload.to_vec());

        self.beacon_queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone())
    }
}
