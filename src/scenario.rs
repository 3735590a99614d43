//! Named end-to-end scenarios
//!
//! Each scenario builds a fresh [`DeviceMethodTest`], runs its steps and always cleans
//! up, whatever the outcome. The first failing step's error is returned.

use std::sync::Arc;

#[cfg(feature = "file-upload")]
use tokio::time;

#[cfg(feature = "file-upload")]
use crate::connection::UploadOutcome;
#[cfg(feature = "file-upload")]
use crate::correlator::expect_status;
#[cfg(feature = "file-upload")]
use crate::error::HarnessError;
#[cfg(feature = "fault-injection")]
use crate::fault::{FaultScenarioReport, FaultSpec};
use crate::harness::DeviceMethodTest;
use crate::message::{MethodInvocation, MethodResponse};
use crate::responder::EchoResponder;
#[cfg(feature = "file-upload")]
use crate::responder::{UploadResponder, METHOD_RESPONSE_SUCCESS, UPLOAD_ACK_BODY};
use crate::settings::ProvisionedDevice;
#[cfg(feature = "file-upload")]
use crate::settings::{UPLOAD_COMPLETE_TIMEOUT, UPLOAD_YIELD};
use crate::transport::{HubBackend, TransportKind};

/// Name every scenario invokes
pub const METHOD_NAME: &str = "MethodName";
/// Payload of the upload-triggering invocation
#[cfg(feature = "file-upload")]
pub const UPLOAD_METHOD_PAYLOAD: &str = "\"Hello World.\"";

/// Payloads the echo scenario is run with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadCase {
    /// A plain JSON string
    HappyString,
    /// A JSON object
    DoubleQuotedJson,
    /// `{}`
    EmptyJsonObject,
    /// `null`
    Null,
    /// A JSON string with an escaped double quote inside
    EmbeddedDoubleQuote,
    /// A JSON string with a single quote inside
    EmbeddedSingleQuote,
    /// No payload at all
    Empty,
}

impl PayloadCase {
    /// Every case, in the order they are usually run
    pub const ALL: [PayloadCase; 7] = [
        PayloadCase::HappyString,
        PayloadCase::DoubleQuotedJson,
        PayloadCase::EmptyJsonObject,
        PayloadCase::Null,
        PayloadCase::EmbeddedDoubleQuote,
        PayloadCase::EmbeddedSingleQuote,
        PayloadCase::Empty,
    ];

    ///
    pub fn payload(self) -> &'static [u8] {
        match self {
            PayloadCase::HappyString => b"\"I'm a happy little string\"",
            PayloadCase::DoubleQuotedJson => b"{\"foo\":41,\"bar\":42,\"baz\":\"boo\"}",
            PayloadCase::EmptyJsonObject => b"{}",
            PayloadCase::Null => b"null",
            PayloadCase::EmbeddedDoubleQuote => {
                b"\"this string has a double quote \\\" in the middle\""
            }
            PayloadCase::EmbeddedSingleQuote => b"\"this string has a single quote ' in the middle\"",
            PayloadCase::Empty => b"",
        }
    }
}

/// Invoke [`METHOD_NAME`] with `payload` and expect it echoed back with 200
pub async fn method_call_with_string<B: HubBackend>(
    backend: B,
    service_connection_string: &str,
    device: &ProvisionedDevice,
    transport: TransportKind,
    payload: &[u8],
) -> crate::Result<MethodResponse> {
    let mut test = DeviceMethodTest::new(backend, service_connection_string);

    let result: crate::Result<MethodResponse> = async {
        test.connect(device, transport).await?;
        test.subscribe(Arc::new(EchoResponder::new(METHOD_NAME, payload)))
            .await?;

        test.invoke_expecting_echo(&MethodInvocation::new(METHOD_NAME, payload))
            .await
    }
    .await;

    test.cleanup().await;
    result
}

/// Answer of the upload-triggering invocation and how the upload ended
#[cfg(feature = "file-upload")]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadScenarioReport {
    /// Always `{ "Response": "Nothing" }` with 200 when the scenario passes
    pub response: MethodResponse,
    /// `None` when no outcome arrived in time
    pub upload: Option<UploadOutcome>,
}

/// Invoke a method whose handler starts a blob upload
///
/// Passes once the device acknowledges with the fixed body. The upload outcome is
/// reported, not checked: a failed or missing upload does not fail the scenario.
#[cfg(feature = "file-upload")]
pub async fn method_calls_upload<B: HubBackend>(
    backend: B,
    service_connection_string: &str,
    device: &ProvisionedDevice,
    transport: TransportKind,
) -> crate::Result<UploadScenarioReport> {
    let mut test = DeviceMethodTest::new(backend, service_connection_string);

    let result: crate::Result<UploadScenarioReport> = async {
        test.connect(device, transport).await?;
        let handler = UploadResponder::new(test.device()?.transport().clone());
        test.subscribe(Arc::new(handler)).await?;

        let response = test
            .invoke(&MethodInvocation::new(METHOD_NAME, UPLOAD_METHOD_PAYLOAD))
            .await?;
        expect_status(&response, METHOD_RESPONSE_SUCCESS)?;
        if response.payload_bytes() != UPLOAD_ACK_BODY.as_bytes() {
            return Err(HarnessError::ValidationMismatch(format!(
                "upload acknowledgement is incorrect - got {}",
                String::from_utf8_lossy(response.payload_bytes())
            )));
        }

        time::sleep(UPLOAD_YIELD).await;
        let upload = match test.monitor().wait_for_upload(UPLOAD_COMPLETE_TIMEOUT).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Upload outcome unknown: {}", e);
                None
            }
        };

        Ok(UploadScenarioReport { response, upload })
    }
    .await;

    test.cleanup().await;
    result
}

/// The fault the fault scenario is usually run with
#[cfg(feature = "fault-injection")]
pub fn kill_tcp_fault() -> FaultSpec {
    FaultSpec::kill_tcp()
}

/// Echo `payload`, have the hub inject `fault`, then echo it again
#[cfg(feature = "fault-injection")]
pub async fn method_call_svc_fault_ctrl<B: HubBackend>(
    backend: B,
    service_connection_string: &str,
    device: &ProvisionedDevice,
    transport: TransportKind,
    payload: &[u8],
    fault: &FaultSpec,
) -> crate::Result<FaultScenarioReport> {
    let mut test = DeviceMethodTest::new(backend, service_connection_string);

    let result: crate::Result<FaultScenarioReport> = async {
        test.connect(device, transport).await?;
        test.subscribe(Arc::new(EchoResponder::new(METHOD_NAME, payload)))
            .await?;
        test.run_fault_scenario(&MethodInvocation::new(METHOD_NAME, payload), fault)
            .await
    }
    .await;

    test.cleanup().await;
    result
}
