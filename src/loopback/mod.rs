//! In-process hub for running the harness without a live IoT Hub
//!
//! [`LoopbackHub`] hands out device connections ([`LoopbackDevice`]) and service
//! clients ([`LoopbackServiceClient`]) that talk to each other through channels. It
//! authenticates devices with their SAS token or certificate, routes method calls by
//! request id, honours fault control messages and stores uploaded blobs. Latencies come
//! from [`LoopbackSettings`] and run on the tokio clock, so paused-time tests see them
//! elapse instantly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;

use crate::error::HarnessError;
#[cfg(feature = "fault-injection")]
use crate::fault::FaultSpec;
use crate::message::{DirectMethodInvocation, DirectMethodResponse, Message, MethodInvocation, MethodResponse};
use crate::settings::{DeviceAuth, ProvisionedDevice};
use crate::token::{
    device_resource_uri, verify_sas, DeviceConnectionString, DeviceKeyTokenSource, SasTokenSource,
    ServiceConnectionString, TokenSource,
};
#[cfg(feature = "file-upload")]
use crate::transport::UploadResult;
use crate::transport::{ConnectionStatus, ConnectionStatusReason, DeviceEvent, HubBackend, TransportKind};

mod device;
mod service;

pub use device::LoopbackDevice;
pub use service::LoopbackServiceClient;

/// Name of the shared access policy in [`LoopbackHub::service_connection_string`]
pub const LOOPBACK_POLICY_NAME: &str = "iothubowner";

/// Latencies and limits of a [`LoopbackHub`]
#[derive(Debug, Clone)]
pub struct LoopbackSettings {
    /// Time between connecting and the first status report
    pub connect_latency: Duration,
    /// Time before a method subscription starts receiving calls
    pub subscribe_propagation: Duration,
    /// Time a dropped connection stays down before it is re-established
    pub reconnect_backoff: Duration,
    /// Time an upload takes to complete
    pub upload_latency: Duration,
    /// Capacity of each device's event channel
    pub event_capacity: usize,
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            connect_latency: Duration::from_millis(50),
            subscribe_propagation: Duration::from_millis(250),
            reconnect_backoff: Duration::from_millis(500),
            upload_latency: Duration::from_millis(100),
            event_capacity: 16,
        }
    }
}

/// An in-process hub. Clones share the same registry.
#[derive(Debug, Clone)]
pub struct LoopbackHub {
    inner: Arc<Hub>,
}

#[derive(Debug)]
struct Hub {
    host_name: String,
    policy_key: String,
    settings: LoopbackSettings,
    state: Mutex<HubState>,
}

#[derive(Debug, Default)]
struct HubState {
    devices: HashMap<String, DeviceRecord>,
    next_session_id: u64,
    next_request_id: u64,
    messages: Vec<(String, Message)>,
    blobs: HashMap<String, Vec<u8>>,
    fail_uploads: bool,
}

#[derive(Debug)]
struct DeviceRecord {
    auth: RegisteredAuth,
    session: Option<Session>,
}

#[derive(Debug)]
enum RegisteredAuth {
    Sas { key: String },
    X509 { certificate: String },
}

#[derive(Debug)]
enum Credential {
    Token(String),
    Certificate(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Connecting,
    Connected,
    Dropped,
    Rejected,
}

#[derive(Debug)]
struct Session {
    id: u64,
    transport: TransportKind,
    link: Link,
    methods_requested: bool,
    methods_active: bool,
    events: mpsc::Sender<DeviceEvent>,
    pending: HashMap<String, oneshot::Sender<DirectMethodResponse>>,
}

fn generate_key() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill(&mut key);
    STANDARD.encode(key)
}

fn not_connected(device_id: &str) -> HarnessError {
    HarnessError::Transport(format!("device {} is not connected", device_id))
}

impl HubState {
    /// The session `session_id` of `device_id`, if it is still the current one
    fn session_mut(&mut self, device_id: &str, session_id: u64) -> crate::Result<&mut Session> {
        self.devices
            .get_mut(device_id)
            .and_then(|record| record.session.as_mut())
            .filter(|session| session.id == session_id)
            .ok_or_else(|| HarnessError::Transport(format!("session of {} is closed", device_id)))
    }
}

async fn emit(events: mpsc::Sender<DeviceEvent>, event: DeviceEvent) {
    if events.send(event).await.is_err() {
        trace!("Device is no longer listening for events");
    }
}

async fn emit_status(events: mpsc::Sender<DeviceEvent>, status: ConnectionStatus, reason: ConnectionStatusReason) {
    emit(events, DeviceEvent::ConnectionStatus { status, reason }).await
}

impl LoopbackHub {
    /// Hub with default latencies
    pub fn new(host_name: impl Into<String>) -> Self {
        Self::with_settings(host_name, LoopbackSettings::default())
    }

    ///
    pub fn with_settings(host_name: impl Into<String>, settings: LoopbackSettings) -> Self {
        Self {
            inner: Arc::new(Hub {
                host_name: host_name.into(),
                policy_key: generate_key(),
                settings,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    ///
    pub fn host_name(&self) -> &str {
        &self.inner.host_name
    }

    /// Connection string of the hub's owner policy
    pub fn service_connection_string(&self) -> String {
        format!(
            "HostName={};SharedAccessKeyName={};SharedAccessKey={}",
            self.inner.host_name, LOOPBACK_POLICY_NAME, self.inner.policy_key
        )
    }

    /// Register a device with a freshly generated shared access key
    pub async fn register_sas_device(&self, device_id: &str) -> ProvisionedDevice {
        let key = generate_key();
        let connection_string = format!(
            "HostName={};DeviceId={};SharedAccessKey={}",
            self.inner.host_name, device_id, key
        );
        self.register(device_id, RegisteredAuth::Sas { key }).await;

        ProvisionedDevice {
            device_id: device_id.to_string(),
            connection_string,
            auth: DeviceAuth::Sas,
        }
    }

    /// Register a device that authenticates with `certificate`
    pub async fn register_x509_device(
        &self,
        device_id: &str,
        certificate: &str,
        private_key: &str,
    ) -> ProvisionedDevice {
        self.register(
            device_id,
            RegisteredAuth::X509 {
                certificate: certificate.to_string(),
            },
        )
        .await;

        ProvisionedDevice {
            device_id: device_id.to_string(),
            connection_string: format!(
                "HostName={};DeviceId={};x509=true",
                self.inner.host_name, device_id
            ),
            auth: DeviceAuth::X509 {
                certificate: certificate.to_string(),
                private_key: private_key.to_string(),
            },
        }
    }

    async fn register(&self, device_id: &str, auth: RegisteredAuth) {
        debug!("Registering device {}", device_id);
        self.inner.state.lock().await.devices.insert(
            device_id.to_string(),
            DeviceRecord {
                auth,
                session: None,
            },
        );
    }

    /// Make every upload from now on report failure
    pub async fn set_fail_uploads(&self, fail: bool) {
        self.inner.state.lock().await.fail_uploads = fail;
    }

    /// Device to cloud messages received from `device_id`, oldest first
    pub async fn received_messages(&self, device_id: &str) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .await
            .messages
            .iter()
            .filter(|(from, _)| from == device_id)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Content of a blob uploaded by `device_id`
    pub async fn blob(&self, device_id: &str, blob_name: &str) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .await
            .blobs
            .get(&format!("{}/{}", device_id, blob_name))
            .cloned()
    }

    /// Whether `device_id` has a connected session able to receive method calls
    pub async fn is_online(&self, device_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .devices
            .get(device_id)
            .and_then(|record| record.session.as_ref())
            .map_or(false, |s| s.link == Link::Connected && s.methods_active)
    }

    fn credential_for(&self, device: &ProvisionedDevice) -> crate::Result<Credential> {
        let cs: DeviceConnectionString = device.connection_string.parse()?;
        if cs.host_name != self.inner.host_name {
            return Err(HarnessError::Setup(format!("unknown hub {}", cs.host_name)));
        }
        if cs.device_id != device.device_id {
            return Err(HarnessError::Setup(format!(
                "connection string is for {} not {}",
                cs.device_id, device.device_id
            )));
        }

        match &device.auth {
            DeviceAuth::Sas => {
                let expiry = Utc::now() + chrono::Duration::hours(1);
                let token = match &cs.shared_access_signature {
                    Some(sas) => SasTokenSource::new(sas.as_str()).get(&expiry)?,
                    None => DeviceKeyTokenSource::from_connection_string(&cs)?.get(&expiry)?,
                };
                Ok(Credential::Token(token))
            }
            DeviceAuth::X509 {
                certificate,
                private_key,
            } => {
                if !cs.x509 {
                    return Err(HarnessError::Setup(
                        "certificate device needs an x509 connection string".into(),
                    ));
                }
                if private_key.is_empty() {
                    return Err(HarnessError::Setup("x509 private key is empty".into()));
                }
                Ok(Credential::Certificate(certificate.clone()))
            }
        }
    }

    fn authenticate(&self, device_id: &str, auth: &RegisteredAuth, credential: &Credential) -> bool {
        match (auth, credential) {
            (RegisteredAuth::Sas { key }, Credential::Token(token)) => {
                let uri = device_resource_uri(&self.inner.host_name, device_id);
                match verify_sas(token, &uri, key, &Utc::now()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Rejecting token of {}: {}", device_id, e);
                        false
                    }
                }
            }
            (RegisteredAuth::X509 { certificate }, Credential::Certificate(presented)) => {
                certificate == presented
            }
            _ => false,
        }
    }

    async fn open_session(
        &self,
        device: &ProvisionedDevice,
        transport: TransportKind,
    ) -> crate::Result<LoopbackDevice> {
        let credential = self.credential_for(device)?;
        let (events, receiver) = mpsc::channel(self.inner.settings.event_capacity);

        let mut state = self.inner.state.lock().await;
        state.next_session_id += 1;
        let session_id = state.next_session_id;

        let accepted = match state.devices.get_mut(&device.device_id) {
            Some(record) => {
                let accepted = self.authenticate(&device.device_id, &record.auth, &credential);
                let session = Session {
                    id: session_id,
                    transport,
                    link: Link::Connecting,
                    methods_requested: false,
                    methods_active: false,
                    events: events.clone(),
                    pending: HashMap::new(),
                };
                if let Some(old) = record.session.replace(session) {
                    debug!("Replacing session {} of {}", old.id, device.device_id);
                }
                accepted
            }
            None => {
                warn!("Device {} is not registered", device.device_id);
                false
            }
        };
        drop(state);

        let hub = self.clone();
        let device_id = device.device_id.clone();
        tokio::spawn(async move {
            time::sleep(hub.inner.settings.connect_latency).await;
            hub.finish_connect(&device_id, session_id, events, accepted).await;
        });

        Ok(LoopbackDevice::new(
            self.clone(),
            device.device_id.clone(),
            session_id,
            receiver,
        ))
    }

    async fn finish_connect(
        &self,
        device_id: &str,
        session_id: u64,
        events: mpsc::Sender<DeviceEvent>,
        accepted: bool,
    ) {
        let mut state = self.inner.state.lock().await;
        match state.session_mut(device_id, session_id) {
            Ok(session) if session.link == Link::Connecting => {
                session.link = if accepted {
                    Link::Connected
                } else {
                    Link::Rejected
                };
            }
            // closed or replaced before it came up
            Ok(_) => return,
            Err(_) if accepted => return,
            // unregistered devices never get a session
            Err(_) => (),
        }
        drop(state);

        if accepted {
            info!("Device {} connected (session {})", device_id, session_id);
            emit_status(events, ConnectionStatus::Authenticated, ConnectionStatusReason::Ok).await;
        } else {
            emit_status(
                events,
                ConnectionStatus::Unauthenticated,
                ConnectionStatusReason::BadCredential,
            )
            .await;
        }
    }

    async fn subscribe_methods(&self, device_id: &str, session_id: u64) -> crate::Result<()> {
        let mut state = self.inner.state.lock().await;
        let session = state.session_mut(device_id, session_id)?;
        if !session.transport.supports_methods() {
            return Err(HarnessError::Transport(format!(
                "device methods are not supported over {:?}",
                session.transport
            )));
        }
        if session.link != Link::Connected {
            return Err(not_connected(device_id));
        }
        session.methods_requested = true;
        drop(state);

        self.propagate_subscription(device_id, session_id);
        Ok(())
    }

    fn propagate_subscription(&self, device_id: &str, session_id: u64) {
        let hub = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            time::sleep(hub.inner.settings.subscribe_propagation).await;
            let mut state = hub.inner.state.lock().await;
            if let Ok(session) = state.session_mut(&device_id, session_id) {
                if session.link == Link::Connected && session.methods_requested {
                    trace!("Method subscription of {} is active", device_id);
                    session.methods_active = true;
                }
            }
        });
    }

    async fn ingest(&self, device_id: &str, session_id: u64, message: Message) -> crate::Result<()> {
        let mut state = self.inner.state.lock().await;
        let session = state.session_mut(device_id, session_id)?;
        if session.link != Link::Connected {
            return Err(not_connected(device_id));
        }
        trace!("Received message from {}: {:?}", device_id, message);
        #[cfg(feature = "fault-injection")]
        let fault = FaultSpec::from_message(&message);
        state.messages.push((device_id.to_string(), message));
        drop(state);

        #[cfg(feature = "fault-injection")]
        {
            if let Some(fault) = fault {
                self.schedule_fault(device_id, session_id, fault);
            }
        }
        Ok(())
    }

    #[cfg(feature = "fault-injection")]
    fn schedule_fault(&self, device_id: &str, session_id: u64, fault: FaultSpec) {
        let op = fault.operation_type.as_str();
        if !(op.starts_with("Kill") || op.starts_with("ShutDown")) {
            warn!("Ignoring unsupported fault operation {}", op);
            return;
        }
        let delay = match fault.delay_secs.parse::<u64>() {
            Ok(delay) => Duration::from_secs(delay),
            Err(_) => {
                warn!("Ignoring fault with invalid delay {:?}", fault.delay_secs);
                return;
            }
        };

        info!("Scheduling {} for {} in {:?}", op, device_id, delay);
        let hub = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            time::sleep(delay).await;
            if !hub.drop_link(&device_id, session_id, &fault.close_reason).await {
                return;
            }
            time::sleep(hub.inner.settings.reconnect_backoff).await;
            hub.restore_link(&device_id, session_id).await;
        });
    }

    /// Cut the connection and fail every pending invocation
    #[cfg(feature = "fault-injection")]
    async fn drop_link(&self, device_id: &str, session_id: u64, reason: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        let Ok(session) = state.session_mut(device_id, session_id) else {
            return false;
        };
        if session.link != Link::Connected {
            return false;
        }
        session.link = Link::Dropped;
        session.methods_active = false;
        session.pending.clear();
        let events = session.events.clone();
        drop(state);

        info!("Dropped connection of {} ({})", device_id, reason);
        emit_status(
            events,
            ConnectionStatus::Disconnected,
            ConnectionStatusReason::CommunicationError,
        )
        .await;
        true
    }

    #[cfg(feature = "fault-injection")]
    async fn restore_link(&self, device_id: &str, session_id: u64) {
        let mut state = self.inner.state.lock().await;
        let Ok(session) = state.session_mut(device_id, session_id) else {
            return;
        };
        if session.link != Link::Dropped {
            return;
        }
        session.link = Link::Connected;
        let resubscribe = session.methods_requested;
        let events = session.events.clone();
        drop(state);

        info!("Device {} reconnected", device_id);
        emit_status(events, ConnectionStatus::Authenticated, ConnectionStatusReason::Ok).await;
        if resubscribe {
            self.propagate_subscription(device_id, session_id);
        }
    }

    async fn complete_invocation(
        &self,
        device_id: &str,
        session_id: u64,
        response: DirectMethodResponse,
    ) -> crate::Result<()> {
        let mut state = self.inner.state.lock().await;
        let session = state.session_mut(device_id, session_id)?;
        let request_id = response.request_id().to_owned();
        let delivered = match session.pending.remove(&request_id) {
            Some(waiter) => waiter.send(response).is_ok(),
            None => false,
        };
        if !delivered {
            // nobody waits for it any more, or never did
            warn!("Late or unknown response from {} (rid = {})", device_id, request_id);
            return Err(HarnessError::Transport(format!(
                "no pending invocation with rid = {}",
                request_id
            )));
        }
        Ok(())
    }

    #[cfg(feature = "file-upload")]
    async fn start_upload(
        &self,
        device_id: &str,
        session_id: u64,
        blob_name: &str,
        content: Vec<u8>,
    ) -> crate::Result<()> {
        let mut state = self.inner.state.lock().await;
        let fail = state.fail_uploads;
        let session = state.session_mut(device_id, session_id)?;
        if session.link != Link::Connected {
            return Err(not_connected(device_id));
        }
        let events = session.events.clone();
        drop(state);

        let hub = self.clone();
        let key = format!("{}/{}", device_id, blob_name);
        tokio::spawn(async move {
            time::sleep(hub.inner.settings.upload_latency).await;
            let result = if fail {
                UploadResult::Error
            } else {
                hub.inner.state.lock().await.blobs.insert(key, content);
                UploadResult::Ok
            };
            emit(events, DeviceEvent::UploadComplete(result)).await;
        });
        Ok(())
    }

    async fn close_session(&self, device_id: &str, session_id: u64) {
        let mut state = self.inner.state.lock().await;
        if let Some(record) = state.devices.get_mut(device_id) {
            if record.session.as_ref().map(|s| s.id) == Some(session_id) {
                record.session = None;
                debug!("Closed session {} of {}", session_id, device_id);
            }
        }
    }

    async fn invoke(&self, device_id: &str, invocation: &MethodInvocation) -> crate::Result<MethodResponse> {
        if !invocation.payload.is_empty()
            && serde_json::from_slice::<serde_json::Value>(&invocation.payload).is_err()
        {
            return Err(HarnessError::Transport(
                "method payload must be valid JSON".into(),
            ));
        }

        let (waiter, answer) = oneshot::channel();
        let (events, request_id) = {
            let mut state = self.inner.state.lock().await;
            state.next_request_id += 1;
            let request_id = state.next_request_id.to_string();
            let session = state
                .devices
                .get_mut(device_id)
                .and_then(|record| record.session.as_mut())
                .filter(|s| s.link == Link::Connected && s.methods_active)
                .ok_or_else(|| {
                    HarnessError::Transport(format!("device {} is not online", device_id))
                })?;
            session.pending.insert(request_id.clone(), waiter);
            (session.events.clone(), request_id)
        };

        trace!("Delivering {} to {} (rid = {})", invocation.method_name, device_id, request_id);
        let delivered = events
            .send(DeviceEvent::DirectMethod(DirectMethodInvocation {
                method_name: invocation.method_name.clone(),
                payload: invocation.payload.clone(),
                request_id: request_id.clone(),
            }))
            .await;
        if delivered.is_err() {
            self.forget_invocation(device_id, &request_id).await;
            return Err(not_connected(device_id));
        }

        match time::timeout(invocation.timeout, answer).await {
            Ok(Ok(response)) => Ok(response.into()),
            Ok(Err(_)) => Err(HarnessError::Transport(format!(
                "connection to {} was lost before it answered",
                device_id
            ))),
            Err(_) => {
                self.forget_invocation(device_id, &request_id).await;
                Err(HarnessError::Timeout {
                    operation: "device method response",
                    after: invocation.timeout,
                })
            }
        }
    }

    async fn forget_invocation(&self, device_id: &str, request_id: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(session) = state
            .devices
            .get_mut(device_id)
            .and_then(|record| record.session.as_mut())
        {
            session.pending.remove(request_id);
        }
    }
}

#[async_trait]
impl HubBackend for LoopbackHub {
    type Device = LoopbackDevice;
    type Service = LoopbackServiceClient;

    async fn connect(
        &self,
        device: &ProvisionedDevice,
        transport: TransportKind,
    ) -> crate::Result<LoopbackDevice> {
        self.open_session(device, transport).await
    }

    async fn create_service_client(&self, connection_string: &str) -> crate::Result<LoopbackServiceClient> {
        let cs: ServiceConnectionString = connection_string.parse()?;
        if cs.host_name != self.inner.host_name {
            return Err(HarnessError::Setup(format!("unknown hub {}", cs.host_name)));
        }
        if cs.shared_access_key_name != LOOPBACK_POLICY_NAME || cs.shared_access_key != self.inner.policy_key {
            return Err(HarnessError::Setup(format!(
                "policy {} is not authorized",
                cs.shared_access_key_name
            )));
        }
        Ok(LoopbackServiceClient::new(self.clone()))
    }
}
