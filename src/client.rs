use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::connection::ConnectionMonitor;
use crate::message::{DirectMethodInvocation, DirectMethodResponse, Message, MethodResponse};
use crate::responder::MethodHandler;
use crate::transport::{DeviceEvent, DeviceTransport};

/// Answer to an invocation that arrives while another is still being handled
pub const METHOD_RESPONSE_BUSY: i32 = 409;
/// Answer to an invocation that arrives before a handler is installed
pub const METHOD_RESPONSE_NOT_IMPLEMENTED: i32 = 501;

/// Device side of a test: owns the transport and routes its events
///
/// Connection status and upload completions are written into the
/// [`ConnectionMonitor`]; method invocations go to the installed [`MethodHandler`],
/// one at a time.
pub struct DeviceClient<T: DeviceTransport> {
    device_id: String,
    transport: T,
    monitor: ConnectionMonitor,
    dispatcher: MethodDispatcher,
    receive_loop: Option<JoinHandle<()>>,
    destroyed: bool,
}

impl<T: DeviceTransport> std::fmt::Debug for DeviceClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("device_id", &self.device_id)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl<T: DeviceTransport> DeviceClient<T> {
    /// Take the transport's event stream and start routing it
    pub async fn start(
        device_id: impl Into<String>,
        transport: T,
        monitor: ConnectionMonitor,
    ) -> crate::Result<Self> {
        let device_id = device_id.into();
        let receiver = transport.get_receiver().await?;
        let dispatcher = MethodDispatcher::default();

        let receive_loop = tokio::spawn(receive_loop(
            receiver,
            transport.clone(),
            monitor.clone(),
            dispatcher.clone(),
        ));
        debug!("Started receive loop for {}", device_id);

        Ok(Self {
            device_id,
            transport,
            monitor,
            dispatcher,
            receive_loop: Some(receive_loop),
            destroyed: false,
        })
    }

    ///
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    ///
    pub fn transport(&self) -> &T {
        &self.transport
    }

    ///
    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// Block until the transport reports an authenticated connection
    pub async fn wait_until_authenticated(&self, timeout: Duration) -> crate::Result<()> {
        self.monitor.wait_until_authenticated(timeout).await
    }

    /// Install the method handler and subscribe to method invocations
    pub async fn set_method_handler(&self, handler: Arc<dyn MethodHandler>) -> crate::Result<()> {
        *self.dispatcher.handler.lock().await = Some(handler);
        self.transport.subscribe_methods().await
    }

    /// Send a device to cloud message
    pub async fn send_message(&self, message: Message) -> crate::Result<()> {
        trace!("Sending message {:?}", message);
        self.transport.send_message(message).await
    }

    /// Stop routing events and close the transport. Safe to call more than once.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.transport.destroy().await;
        if let Some(handle) = self.receive_loop.take() {
            handle.abort();
        }
        debug!("Destroyed device client {}", self.device_id);
    }
}

#[derive(Clone)]
struct MethodDispatcher {
    handler: Arc<Mutex<Option<Arc<dyn MethodHandler>>>>,
    in_flight: Arc<Semaphore>,
}

impl std::fmt::Debug for MethodDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDispatcher")
            .field("idle", &(self.in_flight.available_permits() > 0))
            .finish()
    }
}

impl Default for MethodDispatcher {
    fn default() -> Self {
        Self {
            handler: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Semaphore::new(1)),
        }
    }
}

impl MethodDispatcher {
    /// Answer the invocation on its own task so status events keep flowing
    async fn dispatch<T: DeviceTransport>(&self, invocation: DirectMethodInvocation, transport: T) {
        let handler = self.handler.lock().await.clone();
        let permit = self.in_flight.clone().try_acquire_owned();

        tokio::spawn(async move {
            let response = match (&handler, &permit) {
                (None, _) => {
                    warn!(
                        "No handler for method {} (rid = {})",
                        invocation.method_name, invocation.request_id
                    );
                    MethodResponse::status_only(METHOD_RESPONSE_NOT_IMPLEMENTED)
                }
                (Some(_), Err(_)) => {
                    warn!(
                        "Rejecting method {} (rid = {}) while another invocation is in flight",
                        invocation.method_name, invocation.request_id
                    );
                    MethodResponse::status_only(METHOD_RESPONSE_BUSY)
                }
                (Some(handler), Ok(_)) => {
                    handler
                        .on_method_invoked(&invocation.method_name, &invocation.payload)
                        .await
                }
            };

            trace!(
                "Responding to direct method with rid = {} status = {}",
                invocation.request_id,
                response.status
            );
            let reply = DirectMethodResponse::new(invocation.request_id, response.status, response.payload);
            if let Err(e) = transport.respond_to_direct_method(reply).await {
                error!("Failed to respond to direct method: {}", e);
            }
            // the next invocation may only start once this answer is out
            drop(permit);
        });
    }
}

async fn receive_loop<T: DeviceTransport>(
    mut receiver: Receiver<DeviceEvent>,
    transport: T,
    monitor: ConnectionMonitor,
    dispatcher: MethodDispatcher,
) {
    while let Some(event) = receiver.recv().await {
        trace!("Received event {:?}", event);
        match event {
            DeviceEvent::ConnectionStatus { status, reason } => {
                monitor.on_status_changed(status, reason)
            }
            DeviceEvent::DirectMethod(invocation) => {
                dispatcher.dispatch(invocation, transport.clone()).await
            }
            #[cfg(feature = "file-upload")]
            DeviceEvent::UploadComplete(result) => monitor.on_upload_complete(result),
        }
    }
    debug!("Device event stream closed");
}
