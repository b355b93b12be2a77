use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::cache::BeaconCache;
use crate::config::Config;
use crate::protocol::encode::{append_num, append_str, encode_value, truncate_name};
use crate::protocol::http::HttpClient;
use crate::protocol::status::{ResponseAttributes, ServerPolicy, StatusResponse};
use crate::protocol::{
    CrashReportingLevel, DataCollectionLevel, EventKind, AGENT_TECHNOLOGY_TYPE, MAX_NAME_LEN,
    PLATFORM_TYPE, PROTOCOL_VERSION,
};
use crate::providers::{PrnGenerator, ThreadIdProvider, TimingProvider};

/// Per-session capture settings, swapped whole-value on reconfiguration.
#[derive(Debug, Clone)]
pub struct BeaconConfiguration {
    pub data_collection_level: DataCollectionLevel,
    pub crash_reporting_level: CrashReportingLevel,
    pub multiplicity: i32,
    pub capturing_allowed: bool,
}

/// A completed user action, ready to be serialized.
#[derive(Debug, Clone)]
pub struct FinishedAction {
    pub id: i32,
    pub parent_id: i32,
    pub name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub start_sequence_no: i32,
    pub end_sequence_no: i32,
}

/// A traced web request, ready to be serialized.
#[derive(Debug, Clone, Default)]
pub struct WebRequestTrace {
    pub url: String,
    pub start_time: i64,
    pub end_time: i64,
    pub start_sequence_no: i32,
    pub end_sequence_no: i32,
    pub bytes_sent: Option<i64>,
    pub bytes_received: Option<i64>,
    pub response_code: Option<i32>,
}

/// Protocol encoder for one session.
///
/// Serializes records into the key=value wire format and hands them to the
/// shared cache; `send` later drains them in bounded chunks. Every producing
/// operation re-checks the capture gates, so a call made after capture was
/// revoked is a complete no-op.
pub struct Beacon {
    beacon_id: i32,
    session_number: i32,
    device_id: i64,
    session_start_time: i64,
    client_ip: String,
    server_id: i32,
    app_id_encoded: String,
    basic_beacon_data: String,
    safety_margin: usize,
    next_id: AtomicI32,
    next_sequence_no: AtomicI32,
    config: RwLock<Arc<BeaconConfiguration>>,
    cache: Arc<BeaconCache>,
    policy: Arc<ServerPolicy>,
    timing: Arc<dyn TimingProvider>,
    thread_ids: Arc<dyn ThreadIdProvider>,
}

impl Beacon {
    pub fn new(
        beacon_id: i32,
        cfg: &Config,
        cache: Arc<BeaconCache>,
        policy: Arc<ServerPolicy>,
        timing: Arc<dyn TimingProvider>,
        thread_ids: Arc<dyn ThreadIdProvider>,
        prng: &dyn PrnGenerator,
    ) -> Self {
        let level = cfg.privacy.data_collection_level;

        // Below the full collection level, sessions and devices must not be
        // correlatable: fixed session number, randomized device id.
        let session_number = if level == DataCollectionLevel::UserBehavior {
            beacon_id
        } else {
            1
        };
        let device_id = if level == DataCollectionLevel::UserBehavior {
            cfg.device.device_id
        } else {
            prng.next_i64(i64::MAX)
        };

        let client_ip = if cfg.device.client_ip.parse::<IpAddr>().is_ok() {
            cfg.device.client_ip.clone()
        } else {
            if !cfg.device.client_ip.is_empty() {
                debug!(ip = %cfg.device.client_ip, "ignoring invalid client IP");
            }
            String::new()
        };

        let session_start_time = timing.now_millis();
        let server_id = policy.attributes().server_id;

        let beacon_config = BeaconConfiguration {
            data_collection_level: level,
            crash_reporting_level: cfg.privacy.crash_reporting_level,
            multiplicity: 1,
            capturing_allowed: true,
        };

        let basic_beacon_data = Self::build_basic_beacon_data(
            cfg,
            &beacon_config,
            device_id,
            session_number,
            &client_ip,
        );

        Self {
            beacon_id,
            session_number,
            device_id,
            session_start_time,
            client_ip,
            server_id,
            app_id_encoded: encode_value(&cfg.http.application_id),
            basic_beacon_data,
            safety_margin: cfg.send.beacon_size_safety_margin,
            next_id: AtomicI32::new(0),
            next_sequence_no: AtomicI32::new(0),
            config: RwLock::new(Arc::new(beacon_config)),
            cache,
            policy,
            timing,
            thread_ids,
        }
    }

    fn build_basic_beacon_data(
        cfg: &Config,
        beacon_config: &BeaconConfiguration,
        device_id: i64,
        session_number: i32,
        client_ip: &str,
    ) -> String {
        let mut out = String::with_capacity(256);
        append_num(&mut out, "vv", PROTOCOL_VERSION);
        append_str(&mut out, "va", env!("CARGO_PKG_VERSION"));
        append_str(&mut out, "ap", &cfg.http.application_id);
        append_str(&mut out, "an", &cfg.device.application_name);
        if !cfg.http.application_version.is_empty() {
            append_str(&mut out, "vn", &cfg.http.application_version);
        }
        append_num(&mut out, "pt", PLATFORM_TYPE);
        append_str(&mut out, "tt", AGENT_TECHNOLOGY_TYPE);
        append_num(&mut out, "vi", device_id);
        append_num(&mut out, "sn", session_number);
        append_str(&mut out, "ip", client_ip);
        if !cfg.device.operating_system.is_empty() {
            append_str(&mut out, "os", &cfg.device.operating_system);
        }
        if !cfg.device.manufacturer.is_empty() {
            append_str(&mut out, "mf", &cfg.device.manufacturer);
        }
        if !cfg.device.model_id.is_empty() {
            append_str(&mut out, "md", &cfg.device.model_id);
        }
        append_num(
            &mut out,
            "dl",
            beacon_config.data_collection_level.as_wire_value(),
        );
        append_num(
            &mut out,
            "cl",
            beacon_config.crash_reporting_level.as_wire_value(),
        );
        out
    }

    pub fn beacon_id(&self) -> i32 {
        self.beacon_id
    }

    pub fn session_number(&self) -> i32 {
        self.session_number
    }

    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    pub fn session_start_time(&self) -> i64 {
        self.session_start_time
    }

    /// Next unique identifier for actions within this session.
    pub fn create_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Next sequence number within this session.
    pub fn create_sequence_number(&self) -> i32 {
        self.next_sequence_no.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Applies a server configuration, keeping the privacy levels.
    pub fn update_server_configuration(&self, attrs: &ResponseAttributes, capture: bool) {
        let mut guard = self.config.write();
        let old = guard.as_ref();
        *guard = Arc::new(BeaconConfiguration {
            data_collection_level: old.data_collection_level,
            crash_reporting_level: old.crash_reporting_level,
            multiplicity: attrs.multiplicity,
            capturing_allowed: capture && attrs.multiplicity > 0,
        });
    }

    fn snapshot(&self) -> Arc<BeaconConfiguration> {
        Arc::clone(&self.config.read())
    }

    fn capturing_allowed(&self) -> bool {
        self.snapshot().capturing_allowed
    }

    fn level_at_least(&self, level: DataCollectionLevel) -> bool {
        self.snapshot().data_collection_level >= level
    }

    // --- Producing operations ---

    /// Records the session start marker.
    pub fn start_session(&self) {
        if !self.capturing_allowed() {
            return;
        }

        let mut data = self.basic_event_data(EventKind::SessionStart, None);
        append_num(&mut data, "pa", 0);
        append_num(&mut data, "s0", self.create_sequence_number());
        append_num(&mut data, "t0", 0);

        self.cache
            .add_event_data(self.beacon_id, self.session_start_time, data);
    }

    /// Records the session end marker.
    pub fn end_session(&self) {
        if !self.capturing_allowed() || !self.level_at_least(DataCollectionLevel::Performance) {
            return;
        }

        let now = self.timing.now_millis();
        let mut data = self.basic_event_data(EventKind::SessionEnd, None);
        append_num(&mut data, "pa", 0);
        append_num(&mut data, "s0", self.create_sequence_number());
        append_num(&mut data, "t0", self.time_since_session_start(now));

        self.cache.add_event_data(self.beacon_id, now, data);
    }

    /// Records a completed action.
    pub fn add_action(&self, action: &FinishedAction) {
        if !self.capturing_allowed() || !self.level_at_least(DataCollectionLevel::Performance) {
            return;
        }

        let mut data = self.basic_event_data(EventKind::Action, Some(&action.name));
        append_num(&mut data, "ca", action.id);
        append_num(&mut data, "pa", action.parent_id);
        append_num(&mut data, "s0", action.start_sequence_no);
        append_num(
            &mut data,
            "t0",
            self.time_since_session_start(action.start_time),
        );
        append_num(&mut data, "s1", action.end_sequence_no);
        append_num(&mut data, "t1", action.end_time - action.start_time);

        self.cache
            .add_action_data(self.beacon_id, action.start_time, data);
    }

    /// Records a named event on an action.
    pub fn report_event(&self, parent_action_id: i32, name: &str) {
        if !self.capturing_allowed() || !self.level_at_least(DataCollectionLevel::UserBehavior) {
            return;
        }
        let (data, now) = self.timed_event_data(EventKind::NamedEvent, Some(name), parent_action_id);
        self.cache.add_event_data(self.beacon_id, now, data);
    }

    /// Records a named integer value on an action.
    pub fn report_int_value(&self, parent_action_id: i32, name: &str, value: i64) {
        if !self.capturing_allowed() || !self.level_at_least(DataCollectionLevel::UserBehavior) {
            return;
        }
        let (mut data, now) =
            self.timed_event_data(EventKind::ValueInt, Some(name), parent_action_id);
        append_num(&mut data, "vl", value);
        self.cache.add_event_data(self.beacon_id, now, data);
    }

    /// Records a named floating-point value on an action.
    pub fn report_double_value(&self, parent_action_id: i32, name: &str, value: f64) {
        if !self.capturing_allowed() || !self.level_at_least(DataCollectionLevel::UserBehavior) {
            return;
        }
        let (mut data, now) =
            self.timed_event_data(EventKind::ValueDouble, Some(name), parent_action_id);
        append_num(&mut data, "vl", value);
        self.cache.add_event_data(self.beacon_id, now, data);
    }

    /// Records a named string value on an action.
    pub fn report_string_value(&self, parent_action_id: i32, name: &str, value: &str) {
        if !self.capturing_allowed() || !self.level_at_least(DataCollectionLevel::UserBehavior) {
            return;
        }
        let (mut data, now) =
            self.timed_event_data(EventKind::ValueString, Some(name), parent_action_id);
        append_str(&mut data, "vl", truncate_name(value, MAX_NAME_LEN));
        self.cache.add_event_data(self.beacon_id, now, data);
    }

    /// Records an error on an action.
    pub fn report_error(&self, parent_action_id: i32, name: &str, error_code: i32, reason: &str) {
        if !self.capturing_allowed()
            || !self.level_at_least(DataCollectionLevel::Performance)
            || !self.policy.capture_errors()
        {
            return;
        }

        let now = self.timing.now_millis();
        let mut data = self.basic_event_data(EventKind::Error, Some(name));
        append_num(&mut data, "pa", parent_action_id);
        append_num(&mut data, "s0", self.create_sequence_number());
        append_num(&mut data, "t0", self.time_since_session_start(now));
        append_num(&mut data, "ev", error_code);
        append_str(&mut data, "rs", reason);

        self.cache.add_event_data(self.beacon_id, now, data);
    }

    /// Records a crash.
    pub fn report_crash(&self, name: &str, reason: &str, stacktrace: &str) {
        let crash_opted_in =
            self.snapshot().crash_reporting_level == CrashReportingLevel::OptIn;
        if !self.capturing_allowed() || !crash_opted_in || !self.policy.capture_crashes() {
            return;
        }

        let now = self.timing.now_millis();
        let mut data = self.basic_event_data(EventKind::Crash, Some(name));
        append_num(&mut data, "pa", 0);
        append_num(&mut data, "s0", self.create_sequence_number());
        append_num(&mut data, "t0", self.time_since_session_start(now));
        append_str(&mut data, "rs", reason);
        append_str(&mut data, "st", stacktrace);

        self.cache.add_event_data(self.beacon_id, now, data);
    }

    /// Records a traced web request.
    pub fn add_web_request(&self, parent_action_id: i32, trace: &WebRequestTrace) {
        if !self.capturing_allowed() || !self.level_at_least(DataCollectionLevel::Performance) {
            return;
        }

        let mut data = self.basic_event_data(EventKind::WebRequest, Some(&trace.url));
        append_num(&mut data, "pa", parent_action_id);
        append_num(&mut data, "s0", trace.start_sequence_no);
        append_num(
            &mut data,
            "t0",
            self.time_since_session_start(trace.start_time),
        );
        append_num(&mut data, "s1", trace.end_sequence_no);
        append_num(&mut data, "t1", trace.end_time - trace.start_time);
        if let Some(bytes_sent) = trace.bytes_sent {
            append_num(&mut data, "bs", bytes_sent);
        }
        if let Some(bytes_received) = trace.bytes_received {
            append_num(&mut data, "br", bytes_received);
        }
        if let Some(response_code) = trace.response_code {
            append_num(&mut data, "rc", response_code);
        }

        self.cache
            .add_event_data(self.beacon_id, trace.start_time, data);
    }

    /// Records a user identification event.
    pub fn identify_user(&self, user_tag: &str) {
        if !self.capturing_allowed() || !self.level_at_least(DataCollectionLevel::UserBehavior) {
            return;
        }

        let now = self.timing.now_millis();
        let mut data = self.basic_event_data(EventKind::IdentifyUser, Some(user_tag));
        append_num(&mut data, "pa", 0);
        append_num(&mut data, "s0", self.create_sequence_number());
        append_num(&mut data, "t0", self.time_since_session_start(now));

        self.cache.add_event_data(self.beacon_id, now, data);
    }

    /// Builds the cross-process correlation tag for an outgoing web request.
    ///
    /// Empty when data collection is off, so callers never propagate a tag
    /// for traffic the collector will never see.
    pub fn create_tag(&self, parent_action_id: i32, sequence_no: i32) -> String {
        if self.snapshot().data_collection_level == DataCollectionLevel::Off {
            return String::new();
        }

        format!(
            "MT_{}_{}_{}_{}_{}_{}_{}_{}",
            PROTOCOL_VERSION,
            self.server_id,
            self.device_id,
            self.session_number,
            self.app_id_encoded,
            parent_action_id,
            self.thread_ids.thread_id(),
            sequence_no,
        )
    }

    // --- Sending ---

    /// Drains this session's cached records in bounded chunks.
    ///
    /// The prefix is rebuilt for every chunk so each request carries a fresh
    /// transmission timestamp. A null or erroneous response restores the
    /// in-flight chunk and stops; the failed response is returned so the
    /// caller can react to 429s.
    pub async fn send<H: HttpClient>(&self, http: &H) -> Option<StatusResponse> {
        let max_beacon_size = self.policy.attributes().max_beacon_size;
        let max_chunk_size = max_beacon_size.saturating_sub(self.safety_margin);
        let mut response = None;

        loop {
            let prefix = self.chunk_prefix();
            let chunk = self
                .cache
                .next_chunk(self.beacon_id, &prefix, max_chunk_size, '&');
            if chunk.is_empty() {
                return response;
            }

            let chunk_response = http
                .send_beacon_request(&self.client_ip, chunk.as_bytes(), self.server_id)
                .await;

            match &chunk_response {
                Some(r) if !r.is_erroneous() => {
                    self.cache.commit_chunk(self.beacon_id);
                    response = chunk_response;
                }
                _ => {
                    self.cache.restore_chunk(self.beacon_id);
                    return chunk_response;
                }
            }
        }
    }

    /// Drops all cached data for this session.
    pub fn clear_data(&self) {
        self.cache.delete_entry(self.beacon_id);
    }

    /// True when no record data remains for this session.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty(self.beacon_id)
    }

    // --- Serialization helpers ---

    fn chunk_prefix(&self) -> String {
        let mut prefix = self.basic_beacon_data.clone();
        append_num(&mut prefix, "tx", self.timing.now_millis());
        append_num(&mut prefix, "tv", self.session_start_time);
        append_num(&mut prefix, "mp", self.snapshot().multiplicity);
        prefix
    }

    fn basic_event_data(&self, kind: EventKind, name: Option<&str>) -> String {
        let mut data = String::with_capacity(64);
        append_num(&mut data, "et", kind.as_wire_value());
        if let Some(name) = name {
            append_str(&mut data, "na", truncate_name(name, MAX_NAME_LEN));
        }
        append_num(&mut data, "it", self.thread_ids.thread_id());
        data
    }

    fn timed_event_data(
        &self,
        kind: EventKind,
        name: Option<&str>,
        parent_action_id: i32,
    ) -> (String, i64) {
        let now = self.timing.now_millis();
        let mut data = self.basic_event_data(kind, name);
        append_num(&mut data, "pa", parent_action_id);
        append_num(&mut data, "s0", self.create_sequence_number());
        append_num(&mut data, "t0", self.time_since_session_start(now));
        (data, now)
    }

    fn time_since_session_start(&self, timestamp: i64) -> i64 {
        timestamp - self.session_start_time
    }
}
