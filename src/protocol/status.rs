use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// HTTP status code signalling collector backpressure.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Fallback wait when a 429 response carries no usable Retry-After header.
pub const DEFAULT_RETRY_AFTER_MS: i64 = 10 * 60 * 1000;

/// Server-dictated sending parameters parsed from a status response.
///
/// Snapshots are immutable once built; updates swap the whole value so
/// concurrent readers always observe a consistent set.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseAttributes {
    /// Interval between open-session sends, in milliseconds.
    pub send_interval_ms: i64,
    /// Upper bound for a single beacon request, in bytes.
    pub max_beacon_size: usize,
    /// Server id to address beacon requests to.
    pub server_id: i32,
    /// Whether error records may be sent.
    pub capture_errors: bool,
    /// Whether crash records may be sent.
    pub capture_crashes: bool,
    /// Traffic multiplicity assigned by the server.
    pub multiplicity: i32,
}

impl Default for ResponseAttributes {
    fn default() -> Self {
        Self {
            send_interval_ms: 120_000,
            max_beacon_size: 30 * 1024,
            server_id: 1,
            capture_errors: true,
            capture_crashes: true,
            multiplicity: 1,
        }
    }
}

/// Parsed collector response to a status or beacon request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusResponse {
    pub response_code: u16,
    pub capture: bool,
    pub send_interval_ms: Option<i64>,
    pub server_id: Option<i32>,
    pub max_beacon_size: Option<usize>,
    pub capture_errors: Option<bool>,
    pub capture_crashes: Option<bool>,
    pub multiplicity: Option<i32>,
    pub retry_after_ms: Option<i64>,
}

impl StatusResponse {
    /// True for any HTTP error response (4xx/5xx).
    pub fn is_erroneous(&self) -> bool {
        self.response_code >= 400
    }

    pub fn is_too_many_requests(&self) -> bool {
        self.response_code == TOO_MANY_REQUESTS
    }

    /// Retry-After wait in milliseconds, falling back to the protocol default.
    pub fn retry_after_millis(&self) -> i64 {
        self.retry_after_ms.unwrap_or(DEFAULT_RETRY_AFTER_MS)
    }

    /// Parses a `key=value&...` status response body.
    ///
    /// `si` arrives in seconds and `bl` in kilobytes; both are normalized
    /// here. Unknown keys and malformed values are skipped.
    pub fn parse(response_code: u16, body: &str) -> Self {
        let mut response = Self {
            response_code,
            ..Default::default()
        };

        for pair in body.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "cp" => {
                    if let Ok(v) = value.parse::<i32>() {
                        response.capture = v == 1;
                    }
                }
                "si" => {
                    if let Ok(v) = value.parse::<i64>() {
                        response.send_interval_ms = Some(v * 1000);
                    }
                }
                "id" => {
                    if let Ok(v) = value.parse::<i32>() {
                        response.server_id = Some(v);
                    }
                }
                "bl" => {
                    if let Ok(v) = value.parse::<usize>() {
                        response.max_beacon_size = Some(v * 1024);
                    }
                }
                "er" => {
                    if let Ok(v) = value.parse::<i32>() {
                        response.capture_errors = Some(v == 1);
                    }
                }
                "cr" => {
                    if let Ok(v) = value.parse::<i32>() {
                        response.capture_crashes = Some(v == 1);
                    }
                }
                "mp" => {
                    if let Ok(v) = value.parse::<i32>() {
                        response.multiplicity = Some(v);
                    }
                }
                _ => {}
            }
        }

        response
    }
}

/// True when the optional response is present and not an error.
pub fn is_successful(response: &Option<StatusResponse>) -> bool {
    matches!(response, Some(r) if !r.is_erroneous())
}

/// True when the optional response is a 429.
pub fn is_too_many_requests(response: &Option<StatusResponse>) -> bool {
    matches!(response, Some(r) if r.is_too_many_requests())
}

/// Shared capture policy and server attributes.
///
/// The capture flag reflects every response seen (errors disable it);
/// attribute snapshots only advance on successful responses.
pub struct ServerPolicy {
    attributes: RwLock<Arc<ResponseAttributes>>,
    capture_enabled: AtomicBool,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerPolicy {
    pub fn new() -> Self {
        Self {
            attributes: RwLock::new(Arc::new(ResponseAttributes::default())),
            capture_enabled: AtomicBool::new(true),
        }
    }

    /// Policy whose initial snapshot addresses the given server.
    pub fn with_default_server_id(server_id: i32) -> Self {
        let policy = Self::new();
        *policy.attributes.write() = Arc::new(ResponseAttributes {
            server_id,
            ..Default::default()
        });
        policy
    }

    /// Current attribute snapshot.
    pub fn attributes(&self) -> Arc<ResponseAttributes> {
        Arc::clone(&self.attributes.read())
    }

    pub fn is_capture_on(&self) -> bool {
        self.capture_enabled.load(Ordering::Acquire)
    }

    pub fn capture_errors(&self) -> bool {
        self.is_capture_on() && self.attributes().capture_errors
    }

    pub fn capture_crashes(&self) -> bool {
        self.is_capture_on() && self.attributes().capture_crashes
    }

    /// Turns capture off without touching the attribute snapshot.
    pub fn disable_capture(&self) {
        self.capture_enabled.store(false, Ordering::Release);
    }

    /// Applies a collector response to the policy.
    ///
    /// Error responses only clear the capture flag. Successful responses
    /// set the flag from the body and merge attributes, with absent fields
    /// keeping their previous values.
    pub fn handle_status_response(&self, response: &StatusResponse) {
        if response.is_erroneous() {
            self.disable_capture();
            return;
        }

        self.capture_enabled
            .store(response.capture, Ordering::Release);

        let mut guard = self.attributes.write();
        let old = guard.as_ref();
        *guard = Arc::new(ResponseAttributes {
            send_interval_ms: response.send_interval_ms.unwrap_or(old.send_interval_ms),
            max_beacon_size: response.max_beacon_size.unwrap_or(old.max_beacon_size),
            server_id: response.server_id.unwrap_or(old.server_id),
            capture_errors: response.capture_errors.unwrap_or(old.capture_errors),
            capture_crashes: response.capture_crashes.unwrap_or(old.capture_crashes),
            multiplicity: response.multiplicity.unwrap_or(old.multiplicity),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_response(body: &str) -> StatusResponse {
        StatusResponse::parse(200, body)
    }

    #[test]
    fn test_parse_full_body() {
        let r = ok_response("cp=1&si=120&id=5&bl=64&er=1&cr=0&mp=2");
        assert!(r.capture);
        assert_eq!(r.send_interval_ms, Some(120_000));
        assert_eq!(r.server_id, Some(5));
        assert_eq!(r.max_beacon_size, Some(64 * 1024));
        assert_eq!(r.capture_errors, Some(true));
        assert_eq!(r.capture_crashes, Some(false));
        assert_eq!(r.multiplicity, Some(2));
    }

    #[test]
    fn test_parse_skips_malformed_pairs() {
        let r = ok_response("cp=1&garbage&si=abc&id=7");
        assert!(r.capture);
        assert_eq!(r.send_interval_ms, None);
        assert_eq!(r.server_id, Some(7));
    }

    #[test]
    fn test_erroneous_threshold() {
        assert!(!StatusResponse::parse(200, "").is_erroneous());
        assert!(!StatusResponse::parse(399, "").is_erroneous());
        assert!(StatusResponse::parse(400, "").is_erroneous());
        assert!(StatusResponse::parse(429, "").is_too_many_requests());
        assert!(StatusResponse::parse(429, "").is_erroneous());
    }

    #[test]
    fn test_retry_after_default() {
        let r = StatusResponse::parse(429, "");
        assert_eq!(r.retry_after_millis(), DEFAULT_RETRY_AFTER_MS);

        let mut with_header = r.clone();
        with_header.retry_after_ms = Some(30_000);
        assert_eq!(with_header.retry_after_millis(), 30_000);
    }

    #[test]
    fn test_policy_error_response_only_disables_capture() {
        let policy = ServerPolicy::new();
        let before = policy.attributes();

        policy.handle_status_response(&StatusResponse::parse(503, ""));

        assert!(!policy.is_capture_on());
        assert_eq!(*policy.attributes(), *before);
    }

    #[test]
    fn test_policy_merges_absent_fields_from_previous_snapshot() {
        let policy = ServerPolicy::new();
        policy.handle_status_response(&ok_response("cp=1&si=60&id=9"));

        let attrs = policy.attributes();
        assert_eq!(attrs.send_interval_ms, 60_000);
        assert_eq!(attrs.server_id, 9);
        // Fields absent from the body keep their defaults.
        assert_eq!(attrs.max_beacon_size, 30 * 1024);
        assert!(attrs.capture_errors);

        policy.handle_status_response(&ok_response("cp=1&bl=100"));
        let attrs = policy.attributes();
        assert_eq!(attrs.max_beacon_size, 100 * 1024);
        assert_eq!(attrs.send_interval_ms, 60_000);
    }

    #[test]
    fn test_policy_capture_follows_every_success() {
        let policy = ServerPolicy::new();
        assert!(policy.is_capture_on());

        policy.handle_status_response(&ok_response("cp=0"));
        assert!(!policy.is_capture_on());

        policy.handle_status_response(&ok_response("cp=1"));
        assert!(policy.is_capture_on());
    }

    #[test]
    fn test_policy_error_and_crash_gates_need_capture() {
        let policy = ServerPolicy::new();
        assert!(policy.capture_errors());
        assert!(policy.capture_crashes());

        policy.handle_status_response(&ok_response("cp=1&er=0&cr=1"));
        assert!(!policy.capture_errors());
        assert!(policy.capture_crashes());

        policy.disable_capture();
        assert!(!policy.capture_crashes());
    }

    #[test]
    fn test_optional_helpers() {
        assert!(!is_successful(&None));
        assert!(is_successful(&Some(StatusResponse::parse(200, "cp=1"))));
        assert!(!is_successful(&Some(StatusResponse::parse(500, ""))));
        assert!(is_too_many_requests(&Some(StatusResponse::parse(429, ""))));
        assert!(!is_too_many_requests(&None));
    }
}
