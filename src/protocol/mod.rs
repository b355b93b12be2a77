use serde::Deserialize;

pub mod beacon;
pub mod encode;
pub mod http;
pub mod status;
#[cfg(test)]
pub mod testutil;

/// Version of the key=value wire protocol spoken with the collector.
pub const PROTOCOL_VERSION: i32 = 3;

/// Platform type reported in the beacon preamble.
pub const PLATFORM_TYPE: i32 = 1;

/// Agent technology type reported in the beacon preamble and monitor URL.
pub const AGENT_TECHNOLOGY_TYPE: &str = "rust";

/// Maximum length of user-supplied names before encoding.
pub const MAX_NAME_LEN: usize = 250;

/// Privacy setting controlling which record kinds a session may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCollectionLevel {
    Off = 0,
    Performance = 1,
    UserBehavior = 2,
}

impl DataCollectionLevel {
    /// Numeric wire value for the `dl` preamble field.
    pub fn as_wire_value(self) -> i32 {
        self as i32
    }
}

/// Privacy setting controlling crash reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashReportingLevel {
    Off = 0,
    OptOut = 1,
    OptIn = 2,
}

impl CrashReportingLevel {
    /// Numeric wire value for the `cl` preamble field.
    pub fn as_wire_value(self) -> i32 {
        self as i32
    }
}

/// Numeric record type written to the `et` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Action = 1,
    NamedEvent = 10,
    ValueString = 11,
    ValueInt = 12,
    ValueDouble = 13,
    SessionStart = 18,
    SessionEnd = 19,
    WebRequest = 30,
    Error = 40,
    Crash = 50,
    IdentifyUser = 60,
}

impl EventKind {
    pub fn as_wire_value(self) -> i32 {
        self as i32
    }
}
