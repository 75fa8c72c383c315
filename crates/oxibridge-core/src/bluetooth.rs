//! BlueZ-backed [`Link`] implementation.
//!
//! Talks to `bluetoothd` over D-Bus through `bluer`. BlueZ owns client
//! characteristic configuration descriptors, so notifications are enabled
//! with `StartNotify`, which performs the `01 00` descriptor write on our
//! behalf and hands back the notification stream.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, Address, AddressType, Device, Session};
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::frame::RawFrame;
use crate::link::{protocol, AddressKind, GattHandles, HandshakeError, Link, LinkError};

type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// How often to poll BlueZ while it resolves GATT services.
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Give up on service resolution after this many polls.
const SERVICES_POLL_ATTEMPTS: u32 = 40;

impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::NotConnected => Self::TransportLost,
            _ => Self::Bluetooth(err.to_string()),
        }
    }
}

impl From<AddressKind> for AddressType {
    fn from(kind: AddressKind) -> Self {
        match kind {
            AddressKind::Public => Self::LePublic,
            AddressKind::Random => Self::LeRandom,
        }
    }
}

/// Characteristics and stream kept alive between handshakes.
struct Armed {
    command: Characteristic,
    handles: GattHandles,
    notifications: NotificationStream,
}

/// A link to the oximeter through the local Bluetooth adapter.
pub struct BluerLink {
    _session: Session,
    adapter: Adapter,
    device: Option<Device>,
    armed: Option<Armed>,
}

impl BluerLink {
    /// Open a D-Bus session and power up the adapter.
    ///
    /// `adapter_name` selects an adapter such as `hci1`; `None` uses the
    /// default one.
    ///
    /// # Errors
    ///
    /// Returns an error if BlueZ is unreachable or the adapter is missing.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self, LinkError> {
        let session = Session::new().await?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };

        if !adapter.is_powered().await? {
            info!(adapter = adapter.name(), "Powering on Bluetooth adapter");
            adapter.set_powered(true).await?;
        }

        Ok(Self {
            _session: session,
            adapter,
            device: None,
            armed: None,
        })
    }

    async fn wait_for_services(device: &Device) -> Result<(), LinkError> {
        for _ in 0..SERVICES_POLL_ATTEMPTS {
            if device.is_services_resolved().await? {
                return Ok(());
            }
            tokio::time::sleep(SERVICES_POLL_INTERVAL).await;
        }
        Err(LinkError::Timeout {
            operation: "service resolution",
            after: SERVICES_POLL_INTERVAL * SERVICES_POLL_ATTEMPTS,
        })
    }

    async fn locate(device: &Device) -> Result<(Characteristic, Characteristic, GattHandles), HandshakeError> {
        let mut found_service = false;
        let mut command = None;
        let mut notify = None;

        for service in device.services().await.map_err(LinkError::from)? {
            if service.uuid().await.map_err(LinkError::from)? != protocol::SERVICE_UUID {
                continue;
            }
            found_service = true;
            debug!(handle = service.id(), "Found vendor service");

            for characteristic in service.characteristics().await.map_err(LinkError::from)? {
                let uuid = characteristic
                    .uuid()
                    .await
                    .map_err(LinkError::from)?
                    .to_string();
                if uuid.starts_with(protocol::WRITE_UUID_PREFIX) {
                    debug!(handle = characteristic.id(), "Found write handle");
                    command = Some(characteristic);
                    continue;
                }

                for descriptor in characteristic.descriptors().await.map_err(LinkError::from)? {
                    let uuid = descriptor.uuid().await.map_err(LinkError::from)?.to_string();
                    if uuid.starts_with(protocol::NOTIFY_CONFIG_UUID_PREFIX) {
                        debug!(handle = descriptor.id(), "Found subscribe handle");
                        notify = Some((characteristic.clone(), descriptor.id()));
                    }
                }
            }
        }

        if !found_service {
            return Err(HandshakeError::ServiceNotFound {
                service: protocol::SERVICE_UUID.to_string(),
            });
        }

        match (command, notify) {
            (Some(command), Some((notify, descriptor))) => {
                let handles = GattHandles {
                    write: command.id(),
                    notify: descriptor,
                };
                Ok((command, notify, handles))
            }
            (command, notify) => Err(HandshakeError::HandlesNotFound {
                write_found: command.is_some(),
                notify_found: notify.is_some(),
            }),
        }
    }

    async fn send_command(command: &Characteristic) -> Result<(), LinkError> {
        let mut request = CharacteristicWriteRequest::default();
        request.op_type = WriteOp::Request;
        command
            .write_ext(&protocol::STREAM_COMMAND, &request)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Link for BluerLink {
    async fn connect(&mut self, address: &str, kind: AddressKind) -> Result<(), LinkError> {
        let parsed: Address = address.parse().map_err(|_| LinkError::InvalidAddress {
            address: address.to_string(),
        })?;
        self.armed = None;

        let connect_failed = |err: bluer::Error| LinkError::ConnectFailed {
            address: address.to_string(),
            message: err.to_string(),
        };

        let known = self
            .adapter
            .device_addresses()
            .await?
            .contains(&parsed);
        let device = if known {
            let device = self.adapter.device(parsed)?;
            self.device = Some(device.clone());
            if !device.is_connected().await? {
                device.connect().await.map_err(connect_failed)?;
            }
            device
        } else {
            // Not cached by BlueZ yet, so connect without a discovery pass.
            self.adapter
                .connect_device(parsed, kind.into())
                .await
                .map_err(connect_failed)?
        };

        // Held before services resolve so an abandoned connect can still be
        // torn down by `disconnect`.
        self.device = Some(device.clone());
        Self::wait_for_services(&device).await
    }

    async fn perform_handshake(&mut self) -> Result<GattHandles, HandshakeError> {
        let device = self.device.as_ref().ok_or(LinkError::TransportLost)?;

        if let Some(armed) = &self.armed {
            // Stream is still subscribed; only the request needs repeating.
            Self::send_command(&armed.command).await?;
            return Ok(armed.handles);
        }

        let (command, notify, handles) = Self::locate(device).await?;
        let notifications = notify.notify().await.map_err(LinkError::from)?;
        Self::send_command(&command).await?;

        self.armed = Some(Armed {
            command,
            handles,
            notifications: Box::pin(notifications),
        });
        Ok(handles)
    }

    async fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<RawFrame>, LinkError> {
        let armed = self.armed.as_mut().ok_or(LinkError::NotArmed)?;

        match tokio::time::timeout(timeout, armed.notifications.next()).await {
            Ok(Some(bytes)) => Ok(Some(RawFrame::new(bytes))),
            Ok(None) => Err(LinkError::TransportLost),
            Err(_) => {
                let connected = match &self.device {
                    Some(device) => device.is_connected().await.unwrap_or(false),
                    None => false,
                };
                if connected {
                    Ok(None)
                } else {
                    Err(LinkError::TransportLost)
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        self.armed = None;
        if let Some(device) = self.device.take() {
            if let Err(e) = device.disconnect().await {
                warn!(error = %e, "Disconnect failed, ignoring");
            } else {
                debug!(address = %device.address(), "Disconnected");
            }
        }
    }
}
