//! End-to-end harness for Azure IoT Hub device methods
//!
//! Drives a device client and a service client against the same hub and checks that
//! every method invocation is answered once, with the right status and payload, within
//! its timeout.
//!
//! ## Feature flags
//!
//! By default all features are enabled.
//!
//! - `file-upload`: Method handler that starts a blob upload, and the upload scenario
//! - `fault-injection`: Fault control messages and the disconnect-and-recover scenario
//!
//! # Examples
//!
//! Echo one payload through the in-process hub
//! ```no_run
//! use azure_iot_method_e2e::loopback::LoopbackHub;
//! use azure_iot_method_e2e::scenario::{method_call_with_string, PayloadCase};
//! use azure_iot_method_e2e::TransportKind;
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = LoopbackHub::new("loopback.azure-devices.net");
//!     let device = hub.register_sas_device("my-device").await;
//!
//!     let response = method_call_with_string(
//!         hub.clone(),
//!         &hub.service_connection_string(),
//!         &device,
//!         TransportKind::Mqtt,
//!         PayloadCase::DoubleQuotedJson.payload(),
//!     )
//!     .await
//!     .unwrap();
//!
//!     assert_eq!(response.status, 200);
//! }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

#[macro_use]
extern crate log;

/// Harness package version
pub const HARNESS_VERSION: &str = std::env!("CARGO_PKG_VERSION");

/// Device side of a test
pub mod client;
/// Connection and upload state shared between the transport and the test
pub mod connection;
/// Service side invocation and answer checks
pub mod correlator;
/// Errors
pub mod error;
#[cfg(feature = "fault-injection")]
pub mod fault;
pub mod harness;
pub mod loopback;
/// Message types exchanged with the hub
pub mod message;
pub mod responder;
pub mod scenario;
pub mod settings;
/// Connection strings and shared access signatures
pub mod token;
/// Collaborator traits and the events a device transport delivers
pub mod transport;

pub use client::DeviceClient;
pub use connection::ConnectionMonitor;
#[cfg(feature = "file-upload")]
pub use connection::UploadOutcome;
pub use correlator::{expect_echo, expect_status, InvocationCorrelator};
pub use error::HarnessError;
#[cfg(feature = "fault-injection")]
pub use fault::{FaultInjectionSequencer, FaultScenarioReport, FaultSpec};
pub use harness::{DeviceMethodTest, TestPhase};
pub use message::{Message, MethodInvocation, MethodResponse};
pub use responder::{EchoResponder, MethodHandler};
pub use settings::{DeviceAuth, HarnessConfig, ProvisionedDevice};
pub use transport::{
    ConnectionStatus, ConnectionStatusReason, DeviceEvent, DeviceTransport, HubBackend,
    ServiceClient, TransportKind,
};

/// Result of a harness step
pub type Result<T> = std::result::Result<T, HarnessError>;
