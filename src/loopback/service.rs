use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::LoopbackHub;
use crate::error::HarnessError;
use crate::message::{MethodInvocation, MethodResponse};
use crate::transport::ServiceClient;

/// Service client of a [`LoopbackHub`]
#[derive(Debug)]
pub struct LoopbackServiceClient {
    hub: LoopbackHub,
    destroyed: AtomicBool,
}

impl LoopbackServiceClient {
    pub(super) fn new(hub: LoopbackHub) -> Self {
        Self {
            hub,
            destroyed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ServiceClient for LoopbackServiceClient {
    async fn invoke_method(
        &self,
        device_id: &str,
        invocation: &MethodInvocation,
    ) -> crate::Result<MethodResponse> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(HarnessError::Transport("service client was destroyed".into()));
        }
        self.hub.invoke(device_id, invocation).await
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            debug!("Destroyed service client of {}", self.hub.host_name());
        }
    }
}
