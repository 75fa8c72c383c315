//! # oxibridge-core
//!
//! Core logic for oxibridge, a daemon that streams readings from a BLE
//! pulse oximeter into a time-series database.
//!
//! This crate provides:
//! - Decoding and classification of the oximeter's notification frames
//! - A session state machine with reconnect backoff and inactivity release
//! - A metric sink abstraction with an InfluxDB v2 implementation
//! - Configuration management and validation
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`frame`] - Notification payloads and the frame decoder
//! - [`activity`] - Productive/unproductive classification and liveness counters
//! - [`backoff`] - Exponential reconnect backoff
//! - [`link`] - The transport seam ([`Link`]) and the vendor GATT layout
//! - `bluetooth` - [`Link`] over BlueZ (feature `bluetooth`)
//! - [`session`] - The connection lifecycle
//! - [`sink`] / [`influx`] - Where samples go
//! - [`forwarder`] - Bounded queue between the session and the sink
//! - [`status`] - Snapshots of the session for observers
//! - [`config`] - Layered configuration
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod activity;
pub mod backoff;
#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod frame;
pub mod influx;
pub mod link;
pub mod session;
pub mod sink;
pub mod status;
pub mod types;

// Re-export primary types for convenience
pub use activity::{ActivityMonitor, LivenessState, Observation};
pub use backoff::BackoffState;
#[cfg(feature = "bluetooth")]
pub use bluetooth::BluerLink;
pub use config::{
    default_config_path, is_valid_mac_address, Config, ConfigError, ConfigResult, DeviceConfig,
    RearmPolicy, SessionConfig, SinkConfig, StatusConfig,
};
pub use error::{OxibridgeError, Result};
pub use forwarder::{Forwarder, ForwarderStats};
pub use frame::{decode, DecodeError, RawFrame};
pub use influx::{InfluxSettings, InfluxSink};
pub use link::{AddressKind, GattHandles, HandshakeError, Link, LinkError};
pub use session::{Session, SessionSettings, SessionSummary};
pub use sink::{write_with_retry, MetricSink, RetryPolicy, SinkError, SinkErrorKind};
pub use status::{SessionStatus, StatusReceiver};
pub use types::{Classification, MetricSample, SessionPhase};
