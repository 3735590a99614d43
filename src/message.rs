use std::collections::HashMap;
use std::time::Duration;

/// Default bound on a single device method invocation
pub const METHOD_INVOKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Cloud sending a direct method invocation, as delivered to the device
#[derive(Debug, Clone)]
pub struct DirectMethodInvocation {
    ///
    pub method_name: String,
    ///
    pub payload: Vec<u8>,
    /// Correlates the device's response with the service call
    pub request_id: String,
}

/// Device's answer to a [`DirectMethodInvocation`], matched to it by request id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMethodResponse {
    pub(crate) status: i32,
    pub(crate) request_id: String,
    pub(crate) payload: Option<Vec<u8>>,
}

impl DirectMethodResponse {
    ///
    pub fn new(request_id: String, status: i32, payload: Option<Vec<u8>>) -> Self {
        Self {
            status,
            request_id,
            payload,
        }
    }

    ///
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

/// A method call issued by the service side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInvocation {
    /// Name of the method to invoke on the device
    pub method_name: String,
    /// Request body
    pub payload: Vec<u8>,
    /// How long to wait for the device to respond
    pub timeout: Duration,
}

impl MethodInvocation {
    /// Invocation with the default 60 second timeout
    pub fn new(method_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            method_name: method_name.into(),
            payload: payload.into(),
            timeout: METHOD_INVOKE_TIMEOUT,
        }
    }

    /// Replace the response timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Status and body a device answered a method call with
///
/// A `None` payload means the device sent no body at all. Responders never produce
/// `Some` with an empty buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodResponse {
    ///
    pub status: i32,
    ///
    pub payload: Option<Vec<u8>>,
}

impl MethodResponse {
    ///
    pub fn new(status: i32, payload: Option<Vec<u8>>) -> Self {
        Self { status, payload }
    }

    /// Response without a body
    pub fn status_only(status: i32) -> Self {
        Self {
            status,
            payload: None,
        }
    }

    /// Body bytes, empty when absent
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

impl From<DirectMethodResponse> for MethodResponse {
    fn from(response: DirectMethodResponse) -> Self {
        Self {
            status: response.status,
            payload: response.payload,
        }
    }
}

/// Device to cloud message with application properties
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message bytes
    pub body: Vec<u8>,
    properties: HashMap<String, String>,
}

impl Message {
    /// Message without properties
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: HashMap::new(),
        }
    }

    ///
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Application property by key
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// All application properties
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

/// Builds a [`Message`] property by property
#[derive(Debug, Default)]
pub struct MessageBuilder {
    body: Vec<u8>,
    properties: HashMap<String, String>,
}

impl MessageBuilder {
    ///
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Attach an application property, replacing an earlier value for `key`
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    ///
    pub fn build(self) -> Message {
        Message {
            body: self.body,
            properties: self.properties,
        }
    }
}
