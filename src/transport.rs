use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc::Receiver;

use crate::settings::ProvisionedDevice;
use crate::message::{DirectMethodInvocation, DirectMethodResponse, Message, MethodInvocation, MethodResponse};

/// Protocol the device client talks to the hub with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    ///
    Mqtt,
    ///
    MqttWebSockets,
    ///
    Amqp,
    ///
    AmqpWebSockets,
    /// HTTP polling, which cannot receive device methods
    Http,
}

impl TransportKind {
    /// Whether the hub can deliver device methods over this transport
    pub fn supports_methods(self) -> bool {
        !matches!(self, TransportKind::Http)
    }
}

/// Connection state reported by the device transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    ///
    Unauthenticated,
    ///
    Authenticated,
    ///
    Disconnected,
}

/// Why the device transport reported a [`ConnectionStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatusReason {
    ///
    Ok,
    ///
    ExpiredSasToken,
    ///
    DeviceDisabled,
    ///
    BadCredential,
    ///
    RetryExpired,
    ///
    NoNetwork,
    ///
    CommunicationError,
}

/// Final result of an asynchronous blob upload
#[cfg(feature = "file-upload")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResult {
    ///
    Ok,
    ///
    Error,
}

/// Events delivered by a device transport on its receiver
#[derive(Debug)]
pub enum DeviceEvent {
    /// Connection state changed
    ConnectionStatus {
        ///
        status: ConnectionStatus,
        ///
        reason: ConnectionStatusReason,
    },
    /// Cloud sending a direct method invocation
    DirectMethod(DirectMethodInvocation),
    /// A previously initiated upload finished
    #[cfg(feature = "file-upload")]
    UploadComplete(UploadResult),
}

/// Device side of the hub connection
///
/// Implementations are cheap handles; clones share one connection.
#[async_trait]
pub trait DeviceTransport: Clone + Send + Sync + 'static {
    /// Take the event stream. Only the first call succeeds.
    async fn get_receiver(&self) -> crate::Result<Receiver<DeviceEvent>>;
    /// Ask the hub to start delivering device methods
    async fn subscribe_methods(&self) -> crate::Result<()>;
    /// Send a device to cloud message
    async fn send_message(&self, message: Message) -> crate::Result<()>;
    /// Answer a [`DeviceEvent::DirectMethod`]
    async fn respond_to_direct_method(&self, response: DirectMethodResponse) -> crate::Result<()>;
    /// Start uploading `content` as `blob_name`. Completion arrives as
    /// [`DeviceEvent::UploadComplete`].
    #[cfg(feature = "file-upload")]
    async fn upload_to_blob(&self, blob_name: &str, content: Vec<u8>) -> crate::Result<()>;
    /// Close the connection. Calling it again has no effect.
    async fn destroy(&self);
}

/// Service side client able to invoke device methods
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Invoke a method and wait for the device's answer
    async fn invoke_method(
        &self,
        device_id: &str,
        invocation: &MethodInvocation,
    ) -> crate::Result<MethodResponse>;
    /// Release the client. Calling it again has no effect.
    async fn destroy(&self);
}

/// Factory for both sides of a hub connection
#[async_trait]
pub trait HubBackend: Send + Sync {
    ///
    type Device: DeviceTransport;
    ///
    type Service: ServiceClient;

    /// Open a device connection with the device's credentials
    async fn connect(
        &self,
        device: &ProvisionedDevice,
        transport: TransportKind,
    ) -> crate::Result<Self::Device>;

    /// Create a service client from a shared access policy connection string
    async fn create_service_client(&self, connection_string: &str) -> crate::Result<Self::Service>;
}
