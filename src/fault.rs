//! Service-side fault injection
//!
//! A hub that supports fault control watches device to cloud messages for the
//! `AzIoTHub_FaultOperation*` properties and disrupts the device's connection as
//! instructed. Nothing here interprets those properties; they are only attached and
//! sent.

use std::time::Duration;

use tokio::time;

use crate::client::DeviceClient;
use crate::correlator::{expect_echo, InvocationCorrelator};
use crate::message::{Message, MethodInvocation, MethodResponse};
use crate::settings::FAULT_SETTLE;
use crate::transport::{DeviceTransport, ServiceClient};

/// Property naming the kind of fault, such as `KillTcp`
pub const FAULT_OPERATION_TYPE: &str = "AzIoTHub_FaultOperationType";
/// Property carrying the close reason the hub reports
pub const FAULT_OPERATION_CLOSE_REASON: &str = "AzIoTHub_FaultOperationCloseReason";
/// Property carrying the delay, in seconds, before the fault is applied
pub const FAULT_OPERATION_DELAY_IN_SECS: &str = "AzIoTHub_FaultOperationDelayInSecs";

const FAULT_MESSAGE_BODY: &[u8] = b"Happy little message";

/// Instruction for the hub to disrupt the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultSpec {
    ///
    pub operation_type: String,
    ///
    pub close_reason: String,
    ///
    pub delay_secs: String,
}

impl FaultSpec {
    ///
    pub fn new(
        operation_type: impl Into<String>,
        close_reason: impl Into<String>,
        delay_secs: impl Into<String>,
    ) -> Self {
        Self {
            operation_type: operation_type.into(),
            close_reason: close_reason.into(),
            delay_secs: delay_secs.into(),
        }
    }

    /// Forced TCP disconnect one second after the hub receives the message
    pub fn kill_tcp() -> Self {
        Self::new("KillTcp", "boom", "1")
    }

    /// Device to cloud message carrying this fault as properties
    pub fn to_message(&self) -> Message {
        Message::builder()
            .body(FAULT_MESSAGE_BODY)
            .property(FAULT_OPERATION_TYPE, self.operation_type.as_str())
            .property(FAULT_OPERATION_CLOSE_REASON, self.close_reason.as_str())
            .property(FAULT_OPERATION_DELAY_IN_SECS, self.delay_secs.as_str())
            .build()
    }

    /// Read a fault back from a message, if it carries one
    pub fn from_message(message: &Message) -> Option<Self> {
        Some(Self {
            operation_type: message.property(FAULT_OPERATION_TYPE)?.to_owned(),
            close_reason: message
                .property(FAULT_OPERATION_CLOSE_REASON)
                .unwrap_or_default()
                .to_owned(),
            delay_secs: message
                .property(FAULT_OPERATION_DELAY_IN_SECS)
                .unwrap_or("0")
                .to_owned(),
        })
    }
}

/// Both answers of a fault scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultScenarioReport {
    /// Answer before the fault
    pub baseline: MethodResponse,
    /// Answer after the fault and the settle interval
    pub recovered: MethodResponse,
}

/// Runs baseline invoke, fault message, settle, repeat invoke
#[derive(Debug, Clone)]
pub struct FaultInjectionSequencer {
    settle: Duration,
}

impl Default for FaultInjectionSequencer {
    fn default() -> Self {
        Self {
            settle: FAULT_SETTLE,
        }
    }
}

impl FaultInjectionSequencer {
    ///
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the scenario. The first failing step ends it with that step's error.
    ///
    /// Both invocations must come back as a 200 echo of `invocation.payload`. When the
    /// baseline fails, no fault message is sent.
    pub async fn run<S, T>(
        &self,
        correlator: &mut InvocationCorrelator<S>,
        device: &DeviceClient<T>,
        invocation: &MethodInvocation,
        fault: &FaultSpec,
    ) -> crate::Result<FaultScenarioReport>
    where
        S: ServiceClient,
        T: DeviceTransport,
    {
        let device_id = device.device_id();

        let baseline = correlator.invoke(device_id, invocation).await?;
        expect_echo(&baseline, &invocation.payload)?;

        info!(
            "Send fault control message {} ({}) with delay {}s",
            fault.operation_type, fault.close_reason, fault.delay_secs
        );
        device.send_message(fault.to_message()).await?;

        time::sleep(self.settle).await;

        let recovered = correlator.invoke(device_id, invocation).await?;
        expect_echo(&recovered, &invocation.payload)?;
        info!("Device {} recovered from {}", device_id, fault.operation_type);

        Ok(FaultScenarioReport {
            baseline,
            recovered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_is_encoded_as_properties() {
        let message = FaultSpec::kill_tcp().to_message();

        assert_eq!(message.body, b"Happy little message");
        assert_eq!(message.property(FAULT_OPERATION_TYPE), Some("KillTcp"));
        assert_eq!(message.property(FAULT_OPERATION_CLOSE_REASON), Some("boom"));
        assert_eq!(message.property(FAULT_OPERATION_DELAY_IN_SECS), Some("1"));
        assert_eq!(FaultSpec::from_message(&message), Some(FaultSpec::kill_tcp()));
    }

    #[test]
    fn plain_messages_carry_no_fault() {
        assert_eq!(FaultSpec::from_message(&Message::new("hi")), None);
    }
}
