//! Agent stream messages
//!
//! Each WebSocket text frame carries exactly one JSON encoded message. The agent sends
//! [`StreamRequest`]s, the control plane answers with [`StreamResponse`]s. Binary payloads
//! are base64 encoded on the wire.

use serde::{Deserialize, Serialize};

/// Bearer credential header (`Authorization: Bearer <token>`)
pub const HEADER_AUTHORIZATION: &str = "authorization";
/// Opaque machine identity header
pub const HEADER_AGENT_ID: &str = "agentid";
/// Agent hostname header
pub const HEADER_HOSTNAME: &str = "hostname";

/// Path of the agent stream endpoint on the agent port
pub const STREAM_PATH: &str = "/agent/stream";
/// Path serving the control-plane root certificate
pub const CA_CERT_PATH: &str = "/ca.crt";

/// Message sent by the agent on (re)connect and whenever it wants a fresh host certificate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_host_key: Option<String>,
}

/// Login name and the principals authorized to log in as it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Message pushed by the control plane
///
/// Every field is optional and applied independently by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResponse {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub ssh_config: Option<Vec<u8>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub user_certificate_authority_public_key: Option<Vec<u8>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub host_certificate_public_key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principals: Vec<Principal>,
}

impl StreamResponse {
    /// Response carrying only the ssh daemon configuration
    #[must_use]
    pub fn ssh_config(config: impl Into<Vec<u8>>) -> Self {
        Self {
            ssh_config: Some(config.into()),
            ..Self::default()
        }
    }

    /// Response carrying only a principal set
    #[must_use]
    pub fn principals(principals: Vec<Principal>) -> Self {
        Self {
            principals,
            ..Self::default()
        }
    }

    /// Response carrying only a host certificate
    #[must_use]
    pub fn host_certificate(cert: impl Into<Vec<u8>>) -> Self {
        Self {
            host_certificate_public_key: Some(cert.into()),
            ..Self::default()
        }
    }

    /// Teardown signal
    #[must_use]
    pub fn restore() -> Self {
        Self {
            restore: Some(true),
            ..Self::default()
        }
    }

    /// Whether the restore flag is set
    #[must_use]
    pub fn is_restore(&self) -> bool {
        self.restore.unwrap_or(false)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_camel_case() {
        let req = StreamRequest {
            version: Some("0.1.0".to_string()),
            public_host_key: Some("ssh-ed25519 AAAA".to_string()),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["publicHostKey"], "ssh-ed25519 AAAA");
        assert_eq!(json["version"], "0.1.0");
    }

    #[test]
    fn test_empty_response_serializes_to_empty_object() {
        let json = serde_json::to_string(&StreamResponse::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_response_bytes_are_base64() {
        let resp = StreamResponse::ssh_config(b"PermitRootLogin no".to_vec());
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["sshConfig"], "UGVybWl0Um9vdExvZ2luIG5v");

        let back: StreamResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back.ssh_config.as_deref(), Some(&b"PermitRootLogin no"[..]));
    }

    #[test]
    fn test_missing_fields_default() {
        let resp: StreamResponse = serde_json::from_str(r#"{"restore":true}"#).unwrap();
        assert!(resp.is_restore());
        assert!(resp.principals.is_empty());
        assert!(resp.ssh_config.is_none());
    }
}
