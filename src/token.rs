use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

const DEVICEID_KEY: &str = "DeviceId";
const HOSTNAME_KEY: &str = "HostName";
const SHAREDACCESSKEY_KEY: &str = "SharedAccessKey";
const SHAREDACCESSKEYNAME_KEY: &str = "SharedAccessKeyName";
const SHAREDACCESSSIGNATURE_KEY: &str = "SharedAccessSignature";
const X509_KEY: &str = "x509";

const SAS_PREFIX: &str = "SharedAccessSignature ";

const FRAGMENT: &percent_encoding::AsciiSet = &percent_encoding::CONTROLS.add(b'/');

/// Errors raised while parsing connection strings or producing and checking tokens
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// A required `Key=Value` segment is absent
    #[error("connection string is missing {0}")]
    MissingField(&'static str),
    /// A segment had no `=`
    #[error("malformed connection string segment `{0}`")]
    MalformedSegment(String),
    /// The shared access key is not valid base64
    #[error("shared access key is not valid base64")]
    InvalidKey,
    /// The token is not a `SharedAccessSignature` with `sr`, `sig` and `se`
    #[error("malformed shared access signature")]
    MalformedToken,
    /// The token was issued for another resource
    #[error("token was issued for `{0}`")]
    WrongResource(String),
    /// The token expiry has passed
    #[error("token expired")]
    Expired,
    /// The signature does not match the key
    #[error("signature mismatch")]
    SignatureMismatch,
}

fn segments(connection_string: &str) -> Result<Vec<(&str, &str)>, TokenError> {
    connection_string
        .split(';')
        .filter(|segment| !segment.trim().is_empty())
        .map(|segment| {
            // keys are base64 and may end in `=`, only split on the first one
            segment
                .split_once('=')
                .map(|(key, value)| (key.trim(), value.trim()))
                .ok_or_else(|| TokenError::MalformedSegment(segment.to_string()))
        })
        .collect()
}

/// Parsed device connection string
///
/// `HostName=<hub>;DeviceId=<id>;SharedAccessKey=<key>` for SAS devices or
/// `HostName=<hub>;DeviceId=<id>;x509=true` for certificate devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConnectionString {
    /// IoT hub host name
    pub host_name: String,
    /// Registered device id
    pub device_id: String,
    /// Device key, when the device authenticates with SAS
    pub shared_access_key: Option<String>,
    /// Pre-generated token, used verbatim instead of a key
    pub shared_access_signature: Option<String>,
    /// Whether the device authenticates with a certificate
    pub x509: bool,
}

impl FromStr for DeviceConnectionString {
    type Err = TokenError;

    fn from_str(connection_string: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut device_id = None;
        let mut shared_access_key = None;
        let mut shared_access_signature = None;
        let mut x509 = false;

        for (key, value) in segments(connection_string)? {
            match key {
                HOSTNAME_KEY => host_name = Some(value.to_string()),
                DEVICEID_KEY => device_id = Some(value.to_string()),
                SHAREDACCESSKEY_KEY => shared_access_key = Some(value.to_string()),
                SHAREDACCESSSIGNATURE_KEY => shared_access_signature = Some(value.to_string()),
                X509_KEY => x509 = value.eq_ignore_ascii_case("true"),
                _ => (), // Ignore extraneous component in the connection string
            }
        }

        let host_name = host_name.ok_or(TokenError::MissingField(HOSTNAME_KEY))?;
        let device_id = device_id.ok_or(TokenError::MissingField(DEVICEID_KEY))?;
        if !x509 && shared_access_key.is_none() && shared_access_signature.is_none() {
            return Err(TokenError::MissingField(SHAREDACCESSKEY_KEY));
        }

        Ok(Self {
            host_name,
            device_id,
            shared_access_key,
            shared_access_signature,
            x509,
        })
    }
}

/// Parsed service (shared access policy) connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConnectionString {
    /// IoT hub host name
    pub host_name: String,
    /// Shared access policy name, such as `iothubowner`
    pub shared_access_key_name: String,
    /// Shared access policy key
    pub shared_access_key: String,
}

impl FromStr for ServiceConnectionString {
    type Err = TokenError;

    fn from_str(connection_string: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut key_name = None;
        let mut key = None;

        for (k, v) in segments(connection_string)? {
            match k {
                HOSTNAME_KEY => host_name = Some(v.to_string()),
                SHAREDACCESSKEYNAME_KEY => key_name = Some(v.to_string()),
                SHAREDACCESSKEY_KEY => key = Some(v.to_string()),
                _ => (),
            }
        }

        Ok(Self {
            host_name: host_name.ok_or(TokenError::MissingField(HOSTNAME_KEY))?,
            shared_access_key_name: key_name.ok_or(TokenError::MissingField(SHAREDACCESSKEYNAME_KEY))?,
            shared_access_key: key.ok_or(TokenError::MissingField(SHAREDACCESSKEY_KEY))?,
        })
    }
}

/// Produces the password a device presents when connecting
pub trait TokenSource {
    /// Token valid until `expiry`
    fn get(&self, expiry: &DateTime<Utc>) -> Result<String, TokenError>;
}

/// Fixed, pre-generated shared access signature
#[derive(Debug, Clone)]
pub struct SasTokenSource {
    sas: String,
}

impl SasTokenSource {
    ///
    pub fn new(sas: impl Into<String>) -> Self {
        Self { sas: sas.into() }
    }
}

impl TokenSource for SasTokenSource {
    fn get(&self, _: &DateTime<Utc>) -> Result<String, TokenError> {
        Ok(self.sas.clone())
    }
}

/// Signs tokens with the device's shared access key
#[derive(Debug, Clone)]
pub struct DeviceKeyTokenSource {
    resource_uri: String,
    key: String,
}

impl DeviceKeyTokenSource {
    ///
    pub fn new(hub: &str, device_id: &str, key: &str) -> Result<Self, TokenError> {
        STANDARD.decode(key).map_err(|_| TokenError::InvalidKey)?;
        Ok(Self {
            resource_uri: device_resource_uri(hub, device_id),
            key: key.to_string(),
        })
    }

    ///
    pub fn from_connection_string(connection_string: &DeviceConnectionString) -> Result<Self, TokenError> {
        let key = connection_string
            .shared_access_key
            .as_deref()
            .ok_or(TokenError::MissingField(SHAREDACCESSKEY_KEY))?;
        Self::new(&connection_string.host_name, &connection_string.device_id, key)
    }
}

impl TokenSource for DeviceKeyTokenSource {
    fn get(&self, expiry: &DateTime<Utc>) -> Result<String, TokenError> {
        let sas = generate_sas(&self.resource_uri, &self.key, expiry.timestamp())?;
        trace!("Using device key token: {}", sas);
        Ok(sas)
    }
}

/// Resource a device token is scoped to
pub fn device_resource_uri(hub: &str, device_id: &str) -> String {
    format!("{}/devices/{}", hub, device_id)
}

fn encode_resource_uri(resource_uri: &str) -> String {
    percent_encoding::utf8_percent_encode(resource_uri, FRAGMENT).to_string()
}

fn mac_for(key: &str) -> Result<Hmac<Sha256>, TokenError> {
    let key = STANDARD.decode(key).map_err(|_| TokenError::InvalidKey)?;
    Hmac::<Sha256>::new_from_slice(&key).map_err(|_| TokenError::InvalidKey)
}

pub(crate) fn generate_token(key: &str, message: &str) -> Result<String, TokenError> {
    let mut mac = mac_for(key)?;
    mac.update(message.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());

    let pairs = &vec![("sig", signature)];
    serde_urlencoded::to_string(pairs).map_err(|_| TokenError::MalformedToken)
}

/// Shared access signature for `resource_uri` expiring at `expiry_timestamp` (unix seconds)
pub fn generate_sas(resource_uri: &str, key: &str, expiry_timestamp: i64) -> Result<String, TokenError> {
    let resource_uri = encode_resource_uri(resource_uri);
    let to_sign = format!("{}\n{}", resource_uri, expiry_timestamp);
    let token = generate_token(key, &to_sign)?;

    Ok(format!(
        "{}sr={}&{}&se={}",
        SAS_PREFIX, resource_uri, token, expiry_timestamp
    ))
}

/// Check a shared access signature against the key it should have been signed with
pub fn verify_sas(token: &str, resource_uri: &str, key: &str, now: &DateTime<Utc>) -> Result<(), TokenError> {
    let fields = token
        .strip_prefix(SAS_PREFIX)
        .ok_or(TokenError::MalformedToken)?;
    let pairs = serde_urlencoded::from_str::<Vec<(String, String)>>(fields)
        .map_err(|_| TokenError::MalformedToken)?;

    let field = |name: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .ok_or(TokenError::MalformedToken)
    };

    let signed_resource = field("sr")?;
    if signed_resource != resource_uri {
        return Err(TokenError::WrongResource(signed_resource.to_string()));
    }

    let expiry: i64 = field("se")?.parse().map_err(|_| TokenError::MalformedToken)?;
    if expiry <= now.timestamp() {
        return Err(TokenError::Expired);
    }

    let signature = STANDARD
        .decode(field("sig")?)
        .map_err(|_| TokenError::MalformedToken)?;
    let mut mac = mac_for(key)?;
    mac.update(format!("{}\n{}", encode_resource_uri(resource_uri), expiry).as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| TokenError::SignatureMismatch)
}
