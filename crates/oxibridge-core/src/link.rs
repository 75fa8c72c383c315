//! Abstraction over the wireless link to the oximeter.
//!
//! The session never talks to a radio stack directly. It drives a [`Link`],
//! which the daemon backs with BlueZ (see [`crate::bluetooth`]) and tests back
//! with scripted fakes. Notifications are pulled with an explicit timeout
//! instead of being pushed through a callback, which keeps the session loop
//! linear.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::RawFrame;

/// Vendor GATT constants for the Viatom/Wellue oximeter family.
pub mod protocol {
    use uuid::Uuid;

    /// Primary service carrying the command and data characteristics.
    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x1483_9ac4_7d7e_415c_9a42_1673_40cf_2339);

    /// The command characteristic's UUID starts with this.
    pub const WRITE_UUID_PREFIX: &str = "8b00ace7";

    /// Client characteristic configuration descriptors start with this.
    pub const NOTIFY_CONFIG_UUID_PREFIX: &str = "00002902";

    /// Request that starts periodic measurement notifications.
    pub const STREAM_COMMAND: [u8; 8] = [0xaa, 0x17, 0xe8, 0x00, 0x00, 0x00, 0x00, 0x1b];
}

/// Bluetooth LE addressing mode of the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// Public (IEEE-assigned) address.
    Public,
    /// Random static address. The oximeter advertises with one.
    #[default]
    Random,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Random => f.write_str("random"),
        }
    }
}

impl FromStr for AddressKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(Self::Public),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown address type '{other}', expected public or random")),
        }
    }
}

/// Attribute handles located during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattHandles {
    /// Command characteristic.
    pub write: u16,
    /// Notification configuration descriptor.
    pub notify: u16,
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The address could not be parsed.
    #[error("invalid device address '{address}'")]
    InvalidAddress {
        /// The rejected address.
        address: String,
    },

    /// The link could not be established.
    #[error("failed to connect to {address}: {message}")]
    ConnectFailed {
        /// Target device.
        address: String,
        /// Reason reported by the transport.
        message: String,
    },

    /// An operation did not finish in time.
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        /// What was being attempted.
        operation: &'static str,
        /// How long we waited.
        after: Duration,
    },

    /// The peer went away while the link was up.
    #[error("transport lost")]
    TransportLost,

    /// Waiting for notifications before a successful handshake.
    #[error("notifications are not armed")]
    NotArmed,

    /// Any other transport error.
    #[error("bluetooth error: {0}")]
    Bluetooth(String),
}

/// Failures while locating handles and arming notifications.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The vendor service is not exposed by the peer.
    #[error("service {service} not found")]
    ServiceNotFound {
        /// The service we looked for.
        service: String,
    },

    /// The service lacks the command or notification handle.
    #[error("required handles not found (write: {write_found}, notify: {notify_found})")]
    HandlesNotFound {
        /// Whether the command characteristic was found.
        write_found: bool,
        /// Whether the configuration descriptor was found.
        notify_found: bool,
    },

    /// The transport failed while handshaking.
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// A connection to a single oximeter.
///
/// Implementations must tolerate `perform_handshake` being called again on a
/// live link to re-arm notifications, and `disconnect` being called at any
/// time, including when nothing is connected.
#[async_trait]
pub trait Link: Send {
    /// Establish the link.
    async fn connect(&mut self, address: &str, kind: AddressKind) -> Result<(), LinkError>;

    /// Locate the command and notification handles, enable notifications and
    /// send the streaming command. Both writes require acknowledgment.
    async fn perform_handshake(&mut self) -> Result<GattHandles, HandshakeError>;

    /// Wait up to `timeout` for the next notification.
    ///
    /// Returns `Ok(None)` on timeout and `Err(LinkError::TransportLost)` when
    /// the peer disconnected.
    async fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawFrame>, LinkError>;

    /// Drop the link. Never fails.
    async fn disconnect(&mut self);
}

#[async_trait]
impl<L: Link + ?Sized> Link for Box<L> {
    async fn connect(&mut self, address: &str, kind: AddressKind) -> Result<(), LinkError> {
        (**self).connect(address, kind).await
    }

    async fn perform_handshake(&mut self) -> Result<GattHandles, HandshakeError> {
        (**self).perform_handshake().await
    }

    async fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawFrame>, LinkError> {
        (**self).wait_for_notification(timeout).await
    }

    async fn disconnect(&mut self) {
        (**self).disconnect().await;
    }
}
