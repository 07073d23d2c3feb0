use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),
    #[error("frame length {0} shorter than header")]
    ShortFrame(u32),
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One tunnel as announced by the client in its AUTH frame.
///
/// `id` is the tunnel's index in the client's configuration; the server echoes
/// it back in TCP_OPEN/UDP_OPEN so the client can find the local target.
/// `remote == 0` asks the server to pick a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelDefinition {
    pub id: u32,
    pub protocol: Protocol,
    pub local: u16,
    pub remote: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthPayload {
    pub secret: String,
    pub tunnels: Vec<TunnelDefinition>,
}

impl AuthPayload {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Metadata carried by TCP_OPEN and UDP_OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct OpenPayload {
    pub tunnel_id: u32,
    pub remote_port: u16,
    pub protocol: Protocol,
}

impl OpenPayload {
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_payload_matches_wire_shape() {
        let raw = br#"{"secret":"s3","tunnels":[{"protocol":"tcp","local":8080,"remote":0,"id":0},{"protocol":"udp","local":3000,"remote":9000,"id":1}]}"#;
        let got = AuthPayload::decode(raw).unwrap();
        assert_eq!(got.secret, "s3");
        assert_eq!(
            got.tunnels,
            vec![
                TunnelDefinition { id: 0, protocol: Protocol::Tcp, local: 8080, remote: 0 },
                TunnelDefinition { id: 1, protocol: Protocol::Udp, local: 3000, remote: 9000 },
            ]
        );
    }

    #[test]
    fn auth_payload_rejects_unknown_and_missing_fields() {
        let extra = br#"{"secret":"x","tunnels":[],"admin":true}"#;
        assert!(matches!(AuthPayload::decode(extra), Err(ProtocolError::Json(_))));

        let missing = br#"{"tunnels":[]}"#;
        assert!(matches!(AuthPayload::decode(missing), Err(ProtocolError::Json(_))));

        let bad_proto = br#"{"secret":"x","tunnels":[{"protocol":"sctp","local":1,"remote":0,"id":0}]}"#;
        assert!(AuthPayload::decode(bad_proto).is_err());

        assert!(AuthPayload::decode(b"not json").is_err());
    }

    #[test]
    fn out_of_range_remote_rejects_whole_auth() {
        // remote is a u16 on the wire model; 70000 cannot be represented.
        let raw = br#"{"secret":"s","tunnels":[{"protocol":"tcp","local":80,"remote":0,"id":0},{"protocol":"tcp","local":81,"remote":70000,"id":1}]}"#;
        assert!(matches!(AuthPayload::decode(raw), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn open_payload_uses_camel_case() {
        let p = OpenPayload { tunnel_id: 2, remote_port: 40123, protocol: Protocol::Udp };
        let b = p.encode().unwrap();
        let v: serde_json::Value = serde_json::from_slice(&b).unwrap();
        assert_eq!(v["tunnelId"], 2);
        assert_eq!(v["remotePort"], 40123);
        assert_eq!(v["protocol"], "udp");
        assert_eq!(OpenPayload::decode(&b).unwrap(), p);
    }
}
