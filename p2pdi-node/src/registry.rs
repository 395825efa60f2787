//! Registration service: peer discovery and liveness, never content.
//!
//! Wraps a [`SessionTable`] in one lock shared by the four handlers and the
//! housekeeping tick. All handlers answer with exactly one [`Response`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use p2pdi_core::protocol::{self, PeerIdError};
use p2pdi_core::session::DEFAULT_TTL;
use p2pdi_core::{
    decode_message, headers, Message, Method, PeerId, Response, Session, SessionError,
    SessionTable, Status,
};
use tracing::{debug, info, info_span, warn, Span};

use crate::server::{self, ServerError, ServerHandle, Service, DEFAULT_TICK_INTERVAL};

/// Well-known registration service address.
pub const DEFAULT_REGISTRY_HOST: &str = "127.0.0.1";
pub const DEFAULT_REGISTRY_PORT: u16 = 65423;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Lease granted on Register and KeepAlive.
    pub lease_ttl: Duration,
    /// Housekeeping cadence; also the amount charged against each lease per tick.
    pub tick_interval: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_TTL,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

/// Why a handler refused a request.
#[derive(Debug, thiserror::Error)]
enum HandlerError {
    #[error("bad address payload: {0}")]
    Payload(#[from] PeerIdError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl HandlerError {
    fn into_response(self) -> Response {
        match self {
            HandlerError::Session(SessionError::MissingToken)
            | HandlerError::Session(SessionError::InvalidToken(_)) => {
                Response::new(Status::Forbidden, "Forbidden: Invalid cookie")
            }
            HandlerError::Session(SessionError::UnknownPeer(_)) | HandlerError::Payload(_) => {
                Response::new(Status::BadMessage, "Error")
            }
        }
    }
}

pub struct RegistrationService {
    sessions: Mutex<SessionTable>,
    tick_interval: Duration,
    span: Span,
}

impl RegistrationService {
    pub fn new(options: &RegistryOptions) -> Self {
        Self {
            sessions: Mutex::new(SessionTable::new(options.lease_ttl)),
            tick_interval: options.tick_interval,
            span: info_span!("registry"),
        }
    }

    /// Bind `addr` and start serving. Port 0 picks a free port.
    pub async fn start(
        addr: &str,
        options: RegistryOptions,
    ) -> Result<(Arc<Self>, ServerHandle), ServerError> {
        let listener = server::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let mut service = Self::new(&options);
        service.span = info_span!("registry", addr = %local_addr);
        let service = Arc::new(service);
        let handle = server::serve(
            listener,
            service.clone(),
            options.tick_interval,
            service.span.clone(),
        )
        .await?;
        Ok((service, handle))
    }

    /// Snapshot of one session, for diagnostics.
    pub fn session(&self, peer: &PeerId) -> Option<Session> {
        self.lock().get(peer).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count()
    }

    fn lock(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle_register(&self, msg: &Message) -> Result<Response, HandlerError> {
        let peer = PeerId::from_payload(&msg.payload)?;
        let token = self.lock().register(peer.clone());
        info!(%peer, "registered peer");
        Ok(Response::success("Success").with_header(headers::COOKIE, token))
    }

    fn handle_leave(&self, msg: &Message) -> Result<Response, HandlerError> {
        let peer = PeerId::from_payload(&msg.payload)?;
        self.lock().leave(&peer, msg.header(headers::COOKIE))?;
        info!(%peer, "peer left");
        Ok(Response::success("Success"))
    }

    fn handle_peer_query(&self, msg: &Message) -> Result<Response, HandlerError> {
        let peer = PeerId::from_payload(&msg.payload)?;
        let active = self
            .lock()
            .active_peers(&peer, msg.header(headers::COOKIE))?;
        info!(%peer, "{} active peers found", active.len());
        Ok(Response::success(protocol::encode_peer_list(&active)))
    }

    fn handle_keep_alive(&self, msg: &Message) -> Result<Response, HandlerError> {
        let peer = PeerId::from_payload(&msg.payload)?;
        self.lock().keep_alive(&peer, msg.header(headers::COOKIE))?;
        debug!(%peer, "extended TTL");
        Ok(Response::success("Success: TTL Extended"))
    }
}

impl Service for RegistrationService {
    fn on_tick(&self) {
        let _entered = self.span.enter();
        let mut sessions = self.lock();
        for peer in sessions.tick(self.tick_interval) {
            info!(%peer, "lease expired, peer inactive");
        }
        debug!("{} peers active", sessions.active_count());
    }

    fn handle(&self, frame: &[u8]) -> Response {
        let _entered = self.span.enter();
        let started = Instant::now();
        let msg = match decode_message(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("unparseable message: {e}");
                return Response::new(Status::BadMessage, "Bad Message");
            }
        };
        let outcome = match msg.method {
            Method::Register => self.handle_register(&msg),
            Method::Leave => self.handle_leave(&msg),
            Method::PeerQuery => self.handle_peer_query(&msg),
            Method::KeepAlive => self.handle_keep_alive(&msg),
            ref other => {
                warn!(method = %other, "method not allowed");
                Ok(Response::new(Status::MethodNotAllowed, "Method not allowed"))
            }
        };
        let response = outcome.unwrap_or_else(|e| {
            match &e {
                HandlerError::Session(SessionError::UnknownPeer(_)) | HandlerError::Payload(_) => {
                    warn!(method = %msg.method, "bad request: {e}")
                }
                HandlerError::Session(_) => warn!(method = %msg.method, "forbidden: {e}"),
            }
            e.into_response()
        });
        debug!(
            method = %msg.method,
            status = %response.status,
            "took {:.3} ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
        response
    }
}
