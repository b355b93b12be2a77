//! Transport core for an APM telemetry client.
//!
//! Sessions serialize records through a [`protocol::beacon::Beacon`] into
//! the shared [`cache::BeaconCache`]; the background
//! [`send::BeaconSender`] task drains it to the collector, adapting to
//! server-dictated capture policy and backpressure.

pub mod cache;
pub mod config;
pub mod protocol;
pub mod providers;
pub mod send;
pub mod session;
