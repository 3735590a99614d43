//! Harness configuration and provisioned device identities
//!
//! Timing bounds are fixed constants. Only where to connect and as whom is read from
//! configuration.

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::transport::TransportKind;

/// How long a device may take to report [`Authenticated`](crate::ConnectionStatus::Authenticated)
pub const IOTHUB_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait after subscribing to methods before anything is invoked
pub const METHOD_SUBSCRIBE_SETTLE: Duration = Duration::from_secs(1);
/// Wait after sending a fault control message before invoking again
pub const FAULT_SETTLE: Duration = Duration::from_secs(3);
/// Yield after an upload-triggering invocation before waiting on the upload
pub const UPLOAD_YIELD: Duration = Duration::from_secs(1);
/// How long to wait for an upload to report completion
pub const UPLOAD_COMPLETE_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of the environment variables read by [`HarnessConfig::load`]
pub const ENV_PREFIX: &str = "IOTHUB_E2E";

/// Where and as whom the harness runs
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HarnessConfig {
    /// Host name of the hub
    #[serde(default = "default_hub_hostname")]
    pub hub_hostname: String,
    /// Device transport to exercise
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// Id of the device authenticating with a shared access key
    #[serde(default = "default_sas_device_id")]
    pub sas_device_id: String,
    /// Id of the device authenticating with a certificate
    #[serde(default = "default_x509_device_id")]
    pub x509_device_id: String,
}

fn default_hub_hostname() -> String {
    "loopback.azure-devices.net".to_string()
}

fn default_transport() -> TransportKind {
    TransportKind::Mqtt
}

fn default_sas_device_id() -> String {
    "e2e-device-method-sas".to_string()
}

fn default_x509_device_id() -> String {
    "e2e-device-method-x509".to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            hub_hostname: default_hub_hostname(),
            transport: default_transport(),
            sas_device_id: default_sas_device_id(),
            x509_device_id: default_x509_device_id(),
        }
    }
}

impl HarnessConfig {
    /// Read an optional config file, then `IOTHUB_E2E_*` environment variables
    pub fn load(path: Option<&str>) -> crate::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        let cfg = builder
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?;
        Self::from_config(cfg)
    }

    /// Deserialize from an already assembled configuration
    pub fn from_config(cfg: Config) -> crate::Result<Self> {
        Ok(cfg.try_deserialize()?)
    }
}

/// How a provisioned device proves its identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAuth {
    /// Shared access key carried in the connection string
    Sas,
    /// Client certificate
    X509 {
        /// PEM certificate
        certificate: String,
        /// PEM private key
        private_key: String,
    },
}

/// A device identity registered with the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedDevice {
    ///
    pub device_id: String,
    ///
    pub connection_string: String,
    ///
    pub auth: DeviceAuth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_config() {
        let cfg = Config::builder().build().unwrap();
        assert_eq!(HarnessConfig::from_config(cfg).unwrap(), HarnessConfig::default());
    }

    #[test]
    fn overrides_are_deserialized() {
        let cfg = Config::builder()
            .set_override("hub_hostname", "myhub.azure-devices.net")
            .unwrap()
            .set_override("transport", "amqp_web_sockets")
            .unwrap()
            .build()
            .unwrap();
        let harness = HarnessConfig::from_config(cfg).unwrap();

        assert_eq!(harness.hub_hostname, "myhub.azure-devices.net");
        assert_eq!(harness.transport, TransportKind::AmqpWebSockets);
        assert_eq!(harness.sas_device_id, "e2e-device-method-sas");
    }

    #[test]
    fn unknown_transport_is_a_setup_error() {
        let cfg = Config::builder()
            .set_override("transport", "carrier_pigeon")
            .unwrap()
            .build()
            .unwrap();

        assert!(matches!(
            HarnessConfig::from_config(cfg),
            Err(crate::HarnessError::Setup(_))
        ));
    }
}
