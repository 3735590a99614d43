use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::Receiver;
use tokio::sync::Mutex;

use super::LoopbackHub;
use crate::error::HarnessError;
use crate::message::{DirectMethodResponse, Message};
use crate::transport::{DeviceEvent, DeviceTransport};

/// Device connection to a [`LoopbackHub`]
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    hub: LoopbackHub,
    device_id: String,
    session_id: u64,
    receiver: Arc<Mutex<Option<Receiver<DeviceEvent>>>>,
}

impl LoopbackDevice {
    pub(super) fn new(
        hub: LoopbackHub,
        device_id: String,
        session_id: u64,
        receiver: Receiver<DeviceEvent>,
    ) -> Self {
        Self {
            hub,
            device_id,
            session_id,
            receiver: Arc::new(Mutex::new(Some(receiver))),
        }
    }

    ///
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[async_trait]
impl DeviceTransport for LoopbackDevice {
    async fn get_receiver(&self) -> crate::Result<Receiver<DeviceEvent>> {
        self.receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| HarnessError::Setup("event receiver was already taken".into()))
    }

    async fn subscribe_methods(&self) -> crate::Result<()> {
        self.hub.subscribe_methods(&self.device_id, self.session_id).await
    }

    async fn send_message(&self, message: Message) -> crate::Result<()> {
        self.hub.ingest(&self.device_id, self.session_id, message).await
    }

    async fn respond_to_direct_method(&self, response: DirectMethodResponse) -> crate::Result<()> {
        self.hub
            .complete_invocation(&self.device_id, self.session_id, response)
            .await
    }

    #[cfg(feature = "file-upload")]
    async fn upload_to_blob(&self, blob_name: &str, content: Vec<u8>) -> crate::Result<()> {
        self.hub
            .start_upload(&self.device_id, self.session_id, blob_name, content)
            .await
    }

    async fn destroy(&self) {
        self.hub.close_session(&self.device_id, self.session_id).await;
    }
}
