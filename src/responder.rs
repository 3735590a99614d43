//! Device side method handlers
//!
//! A handler turns one incoming method call into a status and an optional body. The
//! device client calls it once per invocation and sends whatever it returns.

use async_trait::async_trait;

use crate::message::MethodResponse;
#[cfg(feature = "file-upload")]
use crate::transport::DeviceTransport;

/// Status returned when a method call matched expectations
pub const METHOD_RESPONSE_SUCCESS: i32 = 200;
/// Status returned when a method call did not match expectations
pub const METHOD_RESPONSE_ERROR: i32 = 401;

/// Blob name the upload handler writes to
#[cfg(feature = "file-upload")]
pub const UPLOAD_BLOB_NAME: &str = "hello_world.txt";
/// Content the upload handler writes
#[cfg(feature = "file-upload")]
pub const UPLOAD_CONTENT: &[u8] = b"Hello World from IoTHubClient_UploadToBlob";
/// Body the upload handler answers with once the upload has been started
#[cfg(feature = "file-upload")]
pub const UPLOAD_ACK_BODY: &str = "{ \"Response\": \"Nothing\" }";

/// Answers device method invocations
#[async_trait]
pub trait MethodHandler: Send + Sync {
    ///
    async fn on_method_invoked(&self, method_name: &str, payload: &[u8]) -> MethodResponse;
}

/// Echoes the payload back when the call matches the expected name and payload
#[derive(Debug, Clone)]
pub struct EchoResponder {
    expected_name: String,
    expected_payload: Vec<u8>,
}

impl EchoResponder {
    ///
    pub fn new(expected_name: impl Into<String>, expected_payload: impl Into<Vec<u8>>) -> Self {
        Self {
            expected_name: expected_name.into(),
            expected_payload: expected_payload.into(),
        }
    }

    /// Check name, then length, then content. The first failing check answers 401.
    pub fn respond(&self, method_name: &str, payload: &[u8]) -> MethodResponse {
        if method_name != self.expected_name {
            error!(
                "Method name incorrect - expected {} but got {}",
                self.expected_name, method_name
            );
            return MethodResponse::status_only(METHOD_RESPONSE_ERROR);
        }
        if payload.len() != self.expected_payload.len() {
            error!(
                "payload size incorrect - expected {} but got {}",
                self.expected_payload.len(),
                payload.len()
            );
            return MethodResponse::status_only(METHOD_RESPONSE_ERROR);
        }
        if payload != self.expected_payload.as_slice() {
            error!("Payload strings do not match");
            return MethodResponse::status_only(METHOD_RESPONSE_ERROR);
        }

        // an empty echo is sent without a body
        let echo = if payload.is_empty() {
            None
        } else {
            Some(payload.to_vec())
        };
        MethodResponse::new(METHOD_RESPONSE_SUCCESS, echo)
    }
}

#[async_trait]
impl MethodHandler for EchoResponder {
    async fn on_method_invoked(&self, method_name: &str, payload: &[u8]) -> MethodResponse {
        self.respond(method_name, payload)
    }
}

/// Starts a blob upload on every invocation, whatever its name or payload
///
/// The response only says whether the upload could be started. How it ended is
/// reported separately as an upload completion.
#[cfg(feature = "file-upload")]
#[derive(Debug, Clone)]
pub struct UploadResponder<T> {
    transport: T,
}

#[cfg(feature = "file-upload")]
impl<T: DeviceTransport> UploadResponder<T> {
    ///
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[cfg(feature = "file-upload")]
#[async_trait]
impl<T: DeviceTransport> MethodHandler for UploadResponder<T> {
    async fn on_method_invoked(&self, method_name: &str, _payload: &[u8]) -> MethodResponse {
        match self
            .transport
            .upload_to_blob(UPLOAD_BLOB_NAME, UPLOAD_CONTENT.to_vec())
            .await
        {
            Ok(()) => {
                info!("Upload started for method {}", method_name);
                MethodResponse::new(
                    METHOD_RESPONSE_SUCCESS,
                    Some(UPLOAD_ACK_BODY.as_bytes().to_vec()),
                )
            }
            Err(e) => {
                error!("Upload failed to start: {}", e);
                MethodResponse::status_only(METHOD_RESPONSE_ERROR)
            }
        }
    }
}
