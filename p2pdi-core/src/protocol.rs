//! P2P-DI wire protocol: methods, status codes, headers and message types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Protocol version literal. Receivers reject any other value.
pub const PROTOCOL_VERSION: &str = "P2Pv1";

/// Component separator: meta | payload | status.
pub const SR_COMPONENT: &str = "<cs>";
/// Field separator: method/version, header entries, address fields, peer lists.
pub const SR_FIELDS: &str = "<fs>";
/// Separates method/version from the header block.
pub const SR_HEADERS: &str = "<hs>";
/// Delimiter between a header key and its value.
pub const HEADER_DELIMITER: &str = ": ";

/// Header names used by the protocol.
pub mod headers {
    /// Session token issued by the registration service.
    pub const COOKIE: &str = "Cookie";
    pub const CONTENT_LENGTH: &str = "ContentLength";
    pub const CONTENT_TYPE: &str = "ContentType";
    /// Hex SHA-256 of a fetched document.
    pub const DIGEST: &str = "Digest";
}

/// Request methods. Unknown method names survive decoding as `Other` so the
/// receiving service can answer MethodNotAllowed instead of BadMessage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Leave,
    PeerQuery,
    KeepAlive,
    IndexQuery,
    FetchDocument,
    Response,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Register => "Register",
            Method::Leave => "Leave",
            Method::PeerQuery => "PQuery",
            Method::KeepAlive => "KeepAlive",
            Method::IndexQuery => "RFCQuery",
            Method::FetchDocument => "GetRFC",
            Method::Response => "Response",
            Method::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "Register" => Method::Register,
            "Leave" => Method::Leave,
            "PQuery" => Method::PeerQuery,
            "KeepAlive" => Method::KeepAlive,
            "RFCQuery" => Method::IndexQuery,
            "GetRFC" => Method::FetchDocument,
            "Response" => Method::Response,
            other => Method::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    BadMessage,
    Forbidden,
    MethodNotAllowed,
    InternalError,
    /// Default before any handler runs; also any code this side does not know.
    Unknown,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Success => 200,
            Status::BadMessage => 400,
            Status::Forbidden => 403,
            Status::MethodNotAllowed => 405,
            Status::InternalError => 500,
            Status::Unknown => 999,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            200 => Status::Success,
            400 => Status::BadMessage,
            403 => Status::Forbidden,
            405 => Status::MethodNotAllowed,
            500 => Status::InternalError,
            _ => Status::Unknown,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Unknown
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A protocol message. Encoding lives in the `wire` module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub method: Method,
    pub version: String,
    pub headers: BTreeMap<String, String>,
    pub payload: String,
}

impl Message {
    /// New message with the current protocol version and no headers.
    pub fn new(method: Method, payload: impl Into<String>) -> Self {
        Self {
            method,
            version: PROTOCOL_VERSION.to_string(),
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A server response: a `Response`-method message plus a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: String,
    pub headers: BTreeMap<String, String>,
    pub payload: String,
    pub status: Status,
}

impl Response {
    pub fn new(status: Status, payload: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            headers: BTreeMap::new(),
            payload: payload.into(),
            status,
        }
    }

    pub fn success(payload: impl Into<String>) -> Self {
        Self::new(Status::Success, payload)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(Status::Unknown, "")
    }
}

/// Identity of a peer: host and listening port. Renders as `host:port`,
/// which is also its serialized form (index keys, peer lists).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId {
    pub host: String,
    pub port: u16,
}

impl PeerId {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Address payload used by Register/Leave/PQuery/KeepAlive: `host<fs>port`.
    pub fn to_payload(&self) -> String {
        format!("{}{}{}", self.host, SR_FIELDS, self.port)
    }

    pub fn from_payload(payload: &str) -> Result<Self, PeerIdError> {
        let (host, port) = payload
            .split_once(SR_FIELDS)
            .ok_or_else(|| PeerIdError::Malformed(payload.to_string()))?;
        Self::from_parts(host, port)
    }

    fn from_parts(host: &str, port: &str) -> Result<Self, PeerIdError> {
        if host.is_empty() || host.contains(SR_FIELDS) {
            return Err(PeerIdError::Malformed(host.to_string()));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| PeerIdError::BadPort(port.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PeerIdError::Malformed(s.to_string()))?;
        Self::from_parts(host, port)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PeerIdError {
    #[error("malformed peer address: {0:?}")]
    Malformed(String),
    #[error("invalid port: {0:?}")]
    BadPort(String),
}

/// PeerQuery result payload: `<fs>`-joined `host:port` entries.
pub fn encode_peer_list<'a>(peers: impl IntoIterator<Item = &'a PeerId>) -> String {
    peers
        .into_iter()
        .map(PeerId::to_string)
        .collect::<Vec<_>>()
        .join(SR_FIELDS)
}

/// Parse a PeerQuery result. An empty payload is an empty list.
pub fn decode_peer_list(payload: &str) -> Result<Vec<PeerId>, PeerIdError> {
    payload
        .split(SR_FIELDS)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_roundtrip() {
        for m in [
            Method::Register,
            Method::Leave,
            Method::PeerQuery,
            Method::KeepAlive,
            Method::IndexQuery,
            Method::FetchDocument,
            Method::Response,
        ] {
            assert_eq!(Method::from_name(m.as_str()), m);
        }
        assert_eq!(
            Method::from_name("Unknown"),
            Method::Other("Unknown".to_string())
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(Status::Forbidden.code(), 403);
        assert_eq!(Status::from_code(405), Status::MethodNotAllowed);
        assert_eq!(Status::from_code(418), Status::Unknown);
        assert_eq!(Response::default().status, Status::Unknown);
    }

    #[test]
    fn peer_id_payload_and_display() {
        let id = PeerId::new("127.0.0.1", 65431);
        assert_eq!(id.to_string(), "127.0.0.1:65431");
        assert_eq!(id.to_payload(), "127.0.0.1<fs>65431");
        assert_eq!(PeerId::from_payload(&id.to_payload()).unwrap(), id);
        assert_eq!("127.0.0.1:65431".parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn peer_id_rejects_garbage() {
        assert!(PeerId::from_payload("127.0.0.1").is_err());
        assert!(PeerId::from_payload("127.0.0.1<fs>port").is_err());
        assert!(PeerId::from_payload("<fs>80").is_err());
        assert!("no-port".parse::<PeerId>().is_err());
    }

    #[test]
    fn peer_list_empty_and_many() {
        assert!(decode_peer_list("").unwrap().is_empty());
        let peers = vec![PeerId::new("10.0.0.1", 1), PeerId::new("10.0.0.2", 2)];
        let payload = encode_peer_list(&peers);
        assert_eq!(payload, "10.0.0.1:1<fs>10.0.0.2:2");
        assert_eq!(decode_peer_list(&payload).unwrap(), peers);
    }

    #[test]
    fn peer_id_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(PeerId::new("h", 7), 1u8);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"h:7":1}"#);
        let back: BTreeMap<PeerId, u8> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
