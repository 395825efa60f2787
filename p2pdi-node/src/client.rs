//! Outbound calls: one TCP connection per request, bounded by a timeout.
//! Used by the peer agent to talk to the registration service and to other peers.

use std::time::Duration;

use p2pdi_core::index::{self, IndexError};
use p2pdi_core::protocol::{self, PeerIdError};
use p2pdi_core::{
    decode_response, encode_message, headers, integrity, DocumentIndex, FormatError, Message,
    Method, PeerId, Response, Status,
};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::transport::{self, TransportError};

/// Default connect/read timeout for a single call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed before a response arrived")]
    Closed,
    #[error("malformed response: {0}")]
    Format(#[from] FormatError),
    #[error("request failed with status {status}: {payload}")]
    Status { status: Status, payload: String },
    #[error("bad payload: {0}")]
    Payload(#[from] IndexError),
    #[error("bad peer list: {0}")]
    PeerList(#[from] PeerIdError),
    #[error("registration response carried no session token")]
    MissingToken,
    #[error("document digest mismatch for {0}")]
    Digest(String),
}

impl ClientError {
    /// Connection-level failure (as opposed to a well-formed refusal).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_) | ClientError::Transport(_) | ClientError::Timeout(_) | ClientError::Closed
        )
    }
}

/// Send one request to `addr` and wait for its response.
pub async fn request(
    addr: &PeerId,
    msg: &Message,
    limit: Duration,
) -> Result<Response, ClientError> {
    let exchange = async {
        let mut stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
        transport::send_frame(&mut stream, encode_message(msg).as_bytes()).await?;
        let frame = transport::recv_frame(&mut stream)
            .await?
            .ok_or(ClientError::Closed)?;
        Ok::<_, ClientError>(decode_response(&frame)?)
    };
    timeout(limit, exchange)
        .await
        .map_err(|_| ClientError::Timeout(limit))?
}

/// Like `request`, but any non-success status is an error.
async fn request_ok(
    addr: &PeerId,
    msg: &Message,
    limit: Duration,
) -> Result<Response, ClientError> {
    let response = request(addr, msg, limit).await?;
    if !response.status.is_success() {
        return Err(ClientError::Status {
            status: response.status,
            payload: response.payload,
        });
    }
    Ok(response)
}

/// Calls a peer makes against the registration service on its own behalf.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    registry: PeerId,
    peer: PeerId,
    timeout: Duration,
}

impl RegistryClient {
    pub fn new(registry: PeerId, peer: PeerId, timeout: Duration) -> Self {
        Self {
            registry,
            peer,
            timeout,
        }
    }

    pub fn registry(&self) -> &PeerId {
        &self.registry
    }

    /// Register; returns the session token.
    pub async fn register(&self) -> Result<String, ClientError> {
        let msg = Message::new(Method::Register, self.peer.to_payload());
        let response = request_ok(&self.registry, &msg, self.timeout).await?;
        response
            .header(headers::COOKIE)
            .map(str::to_string)
            .ok_or(ClientError::MissingToken)
    }

    pub async fn leave(&self, token: &str) -> Result<(), ClientError> {
        self.authenticated(Method::Leave, token).await.map(|_| ())
    }

    pub async fn keep_alive(&self, token: &str) -> Result<(), ClientError> {
        self.authenticated(Method::KeepAlive, token).await.map(|_| ())
    }

    /// Active peers other than ourselves.
    pub async fn peer_query(&self, token: &str) -> Result<Vec<PeerId>, ClientError> {
        let response = self.authenticated(Method::PeerQuery, token).await?;
        Ok(protocol::decode_peer_list(&response.payload)?)
    }

    async fn authenticated(&self, method: Method, token: &str) -> Result<Response, ClientError> {
        let msg = Message::new(method, self.peer.to_payload()).with_header(headers::COOKIE, token);
        request_ok(&self.registry, &msg, self.timeout).await
    }
}

/// Ask `peer` for its document index.
pub async fn index_query(peer: &PeerId, limit: Duration) -> Result<DocumentIndex, ClientError> {
    let msg = Message::new(Method::IndexQuery, "");
    let response = request_ok(peer, &msg, limit).await?;
    Ok(DocumentIndex::from_payload(&response.payload)?)
}

/// Fetch one document from `peer`. The digest header, when present, must match.
pub async fn fetch_document(
    peer: &PeerId,
    id: &str,
    limit: Duration,
) -> Result<String, ClientError> {
    let msg = Message::new(Method::FetchDocument, id);
    let response = request_ok(peer, &msg, limit).await?;
    let content = index::decode_document(id, &response.payload)?;
    if let Some(expected) = response.header(headers::DIGEST) {
        if !integrity::verify_document(&content, expected) {
            return Err(ClientError::Digest(id.to_string()));
        }
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_peer_is_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let peer = PeerId::new("127.0.0.1", port);
        let err = index_query(&peer, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transport(), "{err}");
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept but never answer.
        let _hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let peer = PeerId::new("127.0.0.1", port);
        let err = index_query(&peer, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
        assert!(err.is_transport());
    }

    #[test]
    fn status_errors_are_not_transport() {
        let err = ClientError::Status {
            status: Status::Forbidden,
            payload: "Forbidden".into(),
        };
        assert!(!err.is_transport());
    }
}
