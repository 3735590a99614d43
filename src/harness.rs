//! Per-test orchestration
//!
//! [`DeviceMethodTest`] walks one test case through
//! `Idle -> Connecting -> Authenticated -> MethodSubscribed -> InvocationInFlight -> Completed`.
//! Any failed step moves it to `Failed`, which is terminal. [`DeviceMethodTest::cleanup`]
//! releases whatever was acquired and may be called in any phase.

use std::sync::Arc;

use tokio::time;

use crate::client::DeviceClient;
use crate::connection::ConnectionMonitor;
use crate::correlator::{expect_echo, InvocationCorrelator};
use crate::error::HarnessError;
#[cfg(feature = "fault-injection")]
use crate::fault::{FaultInjectionSequencer, FaultScenarioReport, FaultSpec};
use crate::message::{MethodInvocation, MethodResponse};
use crate::responder::MethodHandler;
use crate::settings::{ProvisionedDevice, IOTHUB_CONNECT_TIMEOUT, METHOD_SUBSCRIBE_SETTLE};
use crate::transport::{HubBackend, TransportKind};

/// Where a test case is in its flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    ///
    Idle,
    ///
    Connecting,
    ///
    Authenticated,
    ///
    MethodSubscribed,
    ///
    InvocationInFlight,
    ///
    Completed,
    ///
    Failed,
}

impl TestPhase {
    fn can_become(self, next: TestPhase) -> bool {
        use TestPhase::*;
        match (self, next) {
            (Failed, _) => false,
            (_, Failed) => true,
            (Idle, Connecting)
            | (Connecting, Authenticated)
            | (Authenticated, MethodSubscribed)
            | (MethodSubscribed, InvocationInFlight)
            | (InvocationInFlight, Completed)
            | (Completed, InvocationInFlight) => true,
            _ => false,
        }
    }
}

/// One device method test case against a hub backend
pub struct DeviceMethodTest<B: HubBackend> {
    backend: B,
    service_connection_string: String,
    monitor: ConnectionMonitor,
    phase: TestPhase,
    device: Option<DeviceClient<B::Device>>,
    correlator: Option<InvocationCorrelator<B::Service>>,
}

impl<B: HubBackend> std::fmt::Debug for DeviceMethodTest<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMethodTest")
            .field("phase", &self.phase)
            .field("device", &self.device)
            .field("has_service_client", &self.correlator.is_some())
            .finish()
    }
}

impl<B: HubBackend> DeviceMethodTest<B> {
    /// Fresh test case. Nothing is connected until [`connect`](Self::connect).
    pub fn new(backend: B, service_connection_string: impl Into<String>) -> Self {
        Self {
            backend,
            service_connection_string: service_connection_string.into(),
            monitor: ConnectionMonitor::new(),
            phase: TestPhase::Idle,
            device: None,
            correlator: None,
        }
    }

    ///
    pub fn phase(&self) -> TestPhase {
        self.phase
    }

    /// Connection and upload record shared with the device client
    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// The connected device client
    pub fn device(&self) -> crate::Result<&DeviceClient<B::Device>> {
        self.device
            .as_ref()
            .ok_or_else(|| HarnessError::Setup("device is not connected".into()))
    }

    fn ensure(&self, next: TestPhase) -> crate::Result<()> {
        if !self.phase.can_become(next) {
            return Err(HarnessError::Setup(format!(
                "cannot move from {:?} to {:?}",
                self.phase, next
            )));
        }
        Ok(())
    }

    fn advance(&mut self, next: TestPhase) -> crate::Result<()> {
        self.ensure(next)?;
        debug!("Test phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        Ok(())
    }

    fn track<T>(&mut self, result: crate::Result<T>) -> crate::Result<T> {
        if let Err(e) = &result {
            warn!("Test failed in phase {:?}: {}", self.phase, e);
            self.phase = TestPhase::Failed;
        }
        result
    }

    /// Connect the device and wait until it is authenticated
    pub async fn connect(
        &mut self,
        device: &ProvisionedDevice,
        transport: TransportKind,
    ) -> crate::Result<()> {
        self.advance(TestPhase::Connecting)?;
        let result = self.connect_inner(device, transport).await;
        self.track(result)?;
        self.advance(TestPhase::Authenticated)
    }

    async fn connect_inner(
        &mut self,
        device: &ProvisionedDevice,
        transport: TransportKind,
    ) -> crate::Result<()> {
        info!("Connecting {} over {:?}", device.device_id, transport);
        // a status left over from an earlier connection must not satisfy the wait
        self.monitor.reset();
        let handle = self
            .backend
            .connect(device, transport)
            .await
            .map_err(|e| HarnessError::Setup(format!("could not create device client: {}", e)))?;
        let client = DeviceClient::start(device.device_id.clone(), handle, self.monitor.clone()).await?;
        let client = self.device.insert(client);

        client.wait_until_authenticated(IOTHUB_CONNECT_TIMEOUT).await
    }

    /// Install `handler`, subscribe to methods and let the subscription settle
    pub async fn subscribe(&mut self, handler: Arc<dyn MethodHandler>) -> crate::Result<()> {
        self.ensure(TestPhase::MethodSubscribed)?;
        let result = match self.device() {
            Ok(device) => device.set_method_handler(handler).await,
            Err(e) => Err(e),
        };
        self.track(result)?;

        // give the hub time to route invocations to the new subscription
        time::sleep(METHOD_SUBSCRIBE_SETTLE).await;
        self.advance(TestPhase::MethodSubscribed)
    }

    async fn correlator(&mut self) -> crate::Result<&mut InvocationCorrelator<B::Service>> {
        if self.correlator.is_none() {
            let client = self
                .backend
                .create_service_client(&self.service_connection_string)
                .await
                .map_err(|e| {
                    HarnessError::Setup(format!("could not create service client: {}", e))
                })?;
            self.correlator = Some(InvocationCorrelator::new(client));
        }
        self.correlator
            .as_mut()
            .ok_or_else(|| HarnessError::Setup("service client missing".into()))
    }

    /// Invoke a method on the connected device and return its answer
    pub async fn invoke(&mut self, invocation: &MethodInvocation) -> crate::Result<MethodResponse> {
        self.advance(TestPhase::InvocationInFlight)?;
        let result = self.invoke_inner(invocation).await;
        let response = self.track(result)?;
        self.advance(TestPhase::Completed)?;
        Ok(response)
    }

    /// Invoke and require a 200 echo of the invocation payload. A mismatch fails the test.
    pub async fn invoke_expecting_echo(
        &mut self,
        invocation: &MethodInvocation,
    ) -> crate::Result<MethodResponse> {
        self.advance(TestPhase::InvocationInFlight)?;
        let result = match self.invoke_inner(invocation).await {
            Ok(response) => expect_echo(&response, &invocation.payload).map(|()| response),
            Err(e) => Err(e),
        };
        let response = self.track(result)?;
        self.advance(TestPhase::Completed)?;
        Ok(response)
    }

    async fn invoke_inner(&mut self, invocation: &MethodInvocation) -> crate::Result<MethodResponse> {
        let device_id = self.device()?.device_id().to_owned();
        self.correlator().await?.invoke(&device_id, invocation).await
    }

    /// Baseline invoke, fault message, settle, repeat invoke
    #[cfg(feature = "fault-injection")]
    pub async fn run_fault_scenario(
        &mut self,
        invocation: &MethodInvocation,
        fault: &FaultSpec,
    ) -> crate::Result<FaultScenarioReport> {
        self.advance(TestPhase::InvocationInFlight)?;
        let result = self.fault_inner(invocation, fault).await;
        let report = self.track(result)?;
        self.advance(TestPhase::Completed)?;
        Ok(report)
    }

    #[cfg(feature = "fault-injection")]
    async fn fault_inner(
        &mut self,
        invocation: &MethodInvocation,
        fault: &FaultSpec,
    ) -> crate::Result<FaultScenarioReport> {
        self.correlator().await?;
        let (Some(device), Some(correlator)) = (self.device.as_ref(), self.correlator.as_mut()) else {
            return Err(HarnessError::Setup("device is not connected".into()));
        };
        FaultInjectionSequencer::new()
            .run(correlator, device, invocation, fault)
            .await
    }

    /// Release the service and device clients. Already released handles are skipped.
    pub async fn cleanup(&mut self) {
        if let Some(correlator) = self.correlator.take() {
            correlator.destroy().await;
        }
        if let Some(mut device) = self.device.take() {
            device.destroy().await;
        }
        trace!("Cleaned up test in phase {:?}", self.phase);
    }
}
