//! Peer agent: serves its own documents and index, and reconciles towards a
//! goal set by pulling from other active peers.
//!
//! The server half ([`PeerService`]) only answers requests. Every outbound
//! call, including registry keep-alives, is made by [`PeerAgent::reconcile`]
//! or the other agent methods on the caller's task.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use p2pdi_core::index::{self, DocumentStore};
use p2pdi_core::session::DEFAULT_TTL;
use p2pdi_core::{
    decode_message, headers, integrity, DocumentId, DocumentIndex, Message, Method, PeerId,
    Response, Status,
};
use tracing::{debug, info, info_span, warn, Span};

use crate::client::{self, ClientError, RegistryClient, DEFAULT_REQUEST_TIMEOUT};
use crate::documents::DocumentSource;
use crate::registry::{DEFAULT_REGISTRY_HOST, DEFAULT_REGISTRY_PORT};
use crate::retry::retry;
use crate::server::{self, ServerError, ServerHandle, Service, DEFAULT_TICK_INTERVAL};

#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Host advertised to the registry and other peers.
    pub host: String,
    /// Listening port; 0 picks a free one.
    pub port: u16,
    pub registry: PeerId,
    /// Documents this peer wants to hold.
    pub goal: BTreeSet<DocumentId>,
    pub tick_interval: Duration,
    /// Bound on every outbound call.
    pub request_timeout: Duration,
    /// Total PeerQuery calls before giving up on an empty peer list.
    pub query_attempts: u32,
    pub query_delay: Duration,
    /// Lease the registry grants; used to decide when a keep-alive is due.
    pub lease_ttl: Duration,
    /// Consecutive rounds without a fetch before reconciliation gives up.
    pub max_idle_rounds: u32,
    pub round_delay: Duration,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            registry: PeerId::new(DEFAULT_REGISTRY_HOST, DEFAULT_REGISTRY_PORT),
            goal: BTreeSet::new(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            query_attempts: 3,
            query_delay: Duration::from_secs(2),
            lease_ttl: DEFAULT_TTL,
            max_idle_rounds: 10,
            round_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("no active peers found after {attempts} attempts")]
    NotFound { attempts: u32 },
    #[error("registration service failed: {0}")]
    Critical(#[source] ClientError),
    #[error("no progress, {} documents still missing", .missing.len())]
    Stalled { missing: BTreeSet<DocumentId> },
    #[error("peer holds no session token")]
    NotRegistered,
    #[error("server error: {0}")]
    Server(#[from] ServerError),
}

/// One successful fetch.
#[derive(Debug, Clone)]
pub struct FetchRecord {
    pub doc: DocumentId,
    pub holder: PeerId,
    pub elapsed: Duration,
}

/// Outcome of a completed reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub rounds: u32,
    pub fetched: Vec<FetchRecord>,
    pub total: Duration,
}

struct LocalState {
    index: DocumentIndex,
    store: DocumentStore,
}

/// Local view of the registry lease.
struct Lease {
    remaining: Duration,
    keep_alive_due: bool,
}

/// The request-serving half of a peer.
pub struct PeerService {
    id: PeerId,
    local: Mutex<LocalState>,
    token: Mutex<Option<String>>,
    lease: Mutex<Lease>,
    lease_ttl: Duration,
    tick_interval: Duration,
    registry: RegistryClient,
    source: Arc<dyn DocumentSource>,
    span: Span,
}

impl PeerService {
    fn local(&self) -> MutexGuard<'_, LocalState> {
        self.local.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lease(&self) -> MutexGuard<'_, Lease> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn token(&self) -> Option<String> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    fn renew_lease(&self) {
        let mut lease = self.lease();
        lease.remaining = self.lease_ttl;
        lease.keep_alive_due = false;
    }

    /// Fill the store with every promised document not yet held.
    fn load_documents(&self) {
        let mut local = self.local();
        let LocalState { index, store } = &mut *local;
        let own = index.entry_mut(&self.id);
        let pending: Vec<DocumentId> = own
            .iter()
            .filter(|d| !store.contains(d))
            .cloned()
            .collect();
        for id in pending {
            match self.source.load(&id) {
                Ok(Some(content)) => {
                    store.insert(id, content);
                }
                Ok(None) => {
                    warn!(doc = %id, "document not found in source, dropping");
                    own.remove(&id);
                }
                Err(e) => {
                    warn!(doc = %id, "failed to load document, dropping: {e}");
                    own.remove(&id);
                }
            }
        }
        info!("{} documents loaded", store.len());
    }

    fn handle_index_query(&self) -> Response {
        match self.local().index.to_payload() {
            Ok(payload) => Response::success(payload),
            Err(e) => {
                warn!("failed to encode index: {e}");
                Response::new(Status::InternalError, "Internal Error")
            }
        }
    }

    fn handle_fetch(&self, msg: &Message) -> Response {
        let id = msg.payload.as_str();
        let local = self.local();
        let Some(content) = local.store.get(id) else {
            warn!(doc = %id, "requested document not held");
            return Response::new(Status::InternalError, "RFC not found");
        };
        match index::encode_document(id, content) {
            Ok(payload) => Response::success(payload)
                .with_header(headers::DIGEST, integrity::digest_document(content))
                .with_header(headers::CONTENT_LENGTH, content.len().to_string())
                .with_header(headers::CONTENT_TYPE, "application/json"),
            Err(e) => {
                warn!(doc = %id, "failed to encode document: {e}");
                Response::new(Status::InternalError, "Internal Error")
            }
        }
    }
}

#[async_trait]
impl Service for PeerService {
    async fn on_start(&self, _local_addr: SocketAddr) -> Result<(), ServerError> {
        let span = self.span.clone();
        span.in_scope(|| self.load_documents());
        if self.token().is_some() {
            span.in_scope(|| debug!("already registered, skipping Register"));
            return Ok(());
        }
        let token = self
            .registry
            .register()
            .await
            .map_err(|e| {
                ServerError::Startup(format!("register with {}: {e}", self.registry.registry()))
            })?;
        self.set_token(Some(token));
        self.renew_lease();
        span.in_scope(|| info!(registry = %self.registry.registry(), "registered"));
        Ok(())
    }

    fn on_tick(&self) {
        let _entered = self.span.enter();
        if self.token().is_none() {
            return;
        }
        let mut lease = self.lease();
        lease.remaining = lease.remaining.saturating_sub(self.tick_interval);
        if !lease.keep_alive_due && lease.remaining < self.lease_ttl / 2 {
            lease.keep_alive_due = true;
            debug!("lease at {:?}, keep-alive due", lease.remaining);
        }
    }

    fn handle(&self, frame: &[u8]) -> Response {
        let _entered = self.span.enter();
        let msg = match decode_message(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("unparseable message: {e}");
                return Response::new(Status::BadMessage, "Bad Message");
            }
        };
        let response = match msg.method {
            Method::IndexQuery => self.handle_index_query(),
            Method::FetchDocument => self.handle_fetch(&msg),
            ref other => {
                warn!(method = %other, "method not allowed");
                Response::new(Status::MethodNotAllowed, "Method not allowed")
            }
        };
        debug!(method = %msg.method, status = %response.status, "handled request");
        response
    }
}

/// Why a PeerQuery attempt did not yield peers.
enum QueryFailure {
    Empty,
    Failed(ClientError),
}

/// A running peer.
pub struct PeerAgent {
    service: Arc<PeerService>,
    handle: Option<ServerHandle>,
    local_addr: SocketAddr,
    goal: BTreeSet<DocumentId>,
    options: PeerOptions,
}

impl PeerAgent {
    /// Bind, seed the index with `initial_ids`, load them from `source`,
    /// register, and start serving.
    pub async fn start(
        options: PeerOptions,
        initial_ids: impl IntoIterator<Item = DocumentId>,
        source: Arc<dyn DocumentSource>,
    ) -> Result<Self, PeerError> {
        let listener = server::bind((options.host.as_str(), options.port)).await?;
        let local_addr = listener.local_addr().map_err(ServerError::from)?;
        let id = PeerId::new(options.host.clone(), local_addr.port());
        let span = info_span!("peer", id = %id);
        let service = Arc::new(PeerService {
            local: Mutex::new(LocalState {
                index: DocumentIndex::new(&id, initial_ids),
                store: DocumentStore::new(),
            }),
            token: Mutex::new(None),
            lease: Mutex::new(Lease {
                remaining: Duration::ZERO,
                keep_alive_due: false,
            }),
            lease_ttl: options.lease_ttl,
            tick_interval: options.tick_interval,
            registry: RegistryClient::new(
                options.registry.clone(),
                id.clone(),
                options.request_timeout,
            ),
            source,
            span: span.clone(),
            id,
        });
        let handle = server::serve(listener, service.clone(), options.tick_interval, span).await?;
        Ok(Self {
            service,
            handle: Some(handle),
            local_addr,
            goal: options.goal.clone(),
            options,
        })
    }

    pub fn id(&self) -> &PeerId {
        &self.service.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn goal(&self) -> &BTreeSet<DocumentId> {
        &self.goal
    }

    pub fn token(&self) -> Option<String> {
        self.service.token()
    }

    pub fn is_serving(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_stopped())
    }

    /// Ids of every document held locally.
    pub fn held(&self) -> BTreeSet<DocumentId> {
        self.service.local().store.ids()
    }

    pub fn document(&self, id: &str) -> Option<String> {
        self.service.local().store.get(id).map(str::to_string)
    }

    /// Snapshot of the index.
    pub fn index(&self) -> DocumentIndex {
        self.service.local().index.clone()
    }

    /// Goal documents not yet held.
    pub fn missing(&self) -> BTreeSet<DocumentId> {
        let local = self.service.local();
        self.goal
            .iter()
            .filter(|d| !local.store.contains(d))
            .cloned()
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    pub fn keep_alive_due(&self) -> bool {
        self.service.lease().keep_alive_due
    }

    /// Extend the registry lease.
    pub async fn keep_alive(&self) -> Result<(), PeerError> {
        let token = self.service.token().ok_or(PeerError::NotRegistered)?;
        self.service
            .registry
            .keep_alive(&token)
            .await
            .map_err(PeerError::Critical)?;
        self.service.renew_lease();
        self.span().in_scope(|| debug!("lease extended"));
        Ok(())
    }

    /// Pull documents from other peers until every goal document is held.
    pub async fn reconcile(&self) -> Result<ReconcileReport, PeerError> {
        let span = self.span();
        let started = Instant::now();
        let mut report = ReconcileReport::default();
        let mut idle_rounds = 0;
        loop {
            let missing = self.missing();
            if missing.is_empty() {
                report.total = started.elapsed();
                span.in_scope(|| {
                    info!(
                        rounds = report.rounds,
                        fetched = report.fetched.len(),
                        "all {} documents held in {:?}",
                        self.goal.len(),
                        report.total
                    )
                });
                return Ok(report);
            }
            report.rounds += 1;
            span.in_scope(|| debug!(round = report.rounds, "{} documents missing", missing.len()));

            if self.keep_alive_due() {
                self.keep_alive().await?;
            }
            let peers = self.active_peers().await?;
            self.locate(&peers).await;
            if self.fetch_pass(&mut report).await > 0 {
                idle_rounds = 0;
                continue;
            }

            idle_rounds += 1;
            if idle_rounds >= self.options.max_idle_rounds {
                let missing = self.missing();
                span.in_scope(|| warn!("giving up after {idle_rounds} idle rounds"));
                return Err(PeerError::Stalled { missing });
            }
            tokio::time::sleep(self.options.round_delay).await;
        }
    }

    /// Stop serving, then leave the registry. If the registry cannot be
    /// reached the server is brought back on the same port.
    pub async fn leave(&mut self) -> Result<(), PeerError> {
        self.stop().await;
        let Some(token) = self.service.token() else {
            return Err(PeerError::NotRegistered);
        };
        match self.service.registry.leave(&token).await {
            Ok(()) => {
                self.service.set_token(None);
                self.span().in_scope(|| info!("left the registry"));
                Ok(())
            }
            Err(e) => {
                self.span().in_scope(|| warn!("leave failed: {e}"));
                if e.is_transport() {
                    self.restart().await?;
                }
                Err(PeerError::Critical(e))
            }
        }
    }

    /// Stop serving without leaving the registry.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
            handle.join().await;
        }
    }

    async fn restart(&mut self) -> Result<(), PeerError> {
        let listener = server::bind(self.local_addr).await?;
        let handle = server::serve(
            listener,
            self.service.clone(),
            self.options.tick_interval,
            self.span(),
        )
        .await?;
        self.span().in_scope(|| info!("server restarted"));
        self.handle = Some(handle);
        Ok(())
    }

    fn span(&self) -> Span {
        self.service.span.clone()
    }

    /// PeerQuery with bounded retries while the list comes back empty.
    async fn active_peers(&self) -> Result<Vec<PeerId>, PeerError> {
        let token = self.service.token().ok_or(PeerError::NotRegistered)?;
        let token = token.as_str();
        let registry = &self.service.registry;
        let attempts = self.options.query_attempts.max(1);
        let outcome = retry(
            attempts,
            self.options.query_delay,
            |e: &QueryFailure| matches!(e, QueryFailure::Empty),
            move |attempt| async move {
                match registry.peer_query(token).await {
                    Ok(peers) if peers.is_empty() => {
                        debug!(attempt, "no active peers yet");
                        Err(QueryFailure::Empty)
                    }
                    Ok(peers) => Ok(peers),
                    Err(e) => Err(QueryFailure::Failed(e)),
                }
            },
        )
        .await;
        match outcome {
            Ok(peers) => {
                self.span().in_scope(|| debug!("{} active peers", peers.len()));
                Ok(peers)
            }
            Err(QueryFailure::Empty) => {
                self.span()
                    .in_scope(|| warn!("no active peers after {attempts} attempts"));
                Err(PeerError::NotFound { attempts })
            }
            Err(QueryFailure::Failed(e)) => {
                self.span().in_scope(|| warn!("peer query failed: {e}"));
                Err(PeerError::Critical(e))
            }
        }
    }

    /// Learn who holds the documents nobody in our index has yet.
    /// Returns the number of new (peer, document) pairs.
    async fn locate(&self, peers: &[PeerId]) -> usize {
        let span = self.span();
        let mut located = 0;
        for peer in peers {
            let remaining = index::remaining(&self.goal, &self.service.local().index);
            if remaining.is_empty() {
                span.in_scope(|| debug!("every goal document located"));
                break;
            }
            let theirs = match client::index_query(peer, self.options.request_timeout).await {
                Ok(theirs) => theirs,
                Err(e) => {
                    span.in_scope(|| warn!(%peer, "index query failed: {e}"));
                    continue;
                }
            };
            let interesting = theirs.flatten().intersection(&remaining).count();
            if interesting == 0 {
                span.in_scope(|| debug!(%peer, "nothing of interest"));
                continue;
            }
            let added = self.service.local().index.merge(&theirs, self.id());
            span.in_scope(|| debug!(%peer, interesting, added, "merged index"));
            located += added;
        }
        located
    }

    /// Fetch every document listed for other peers that is not held yet.
    /// Returns how many were fetched.
    async fn fetch_pass(&self, report: &mut ReconcileReport) -> usize {
        let span = self.span();
        let plan: Vec<(PeerId, Vec<DocumentId>)> = {
            let local = self.service.local();
            local
                .index
                .iter()
                .filter(|(holder, _)| *holder != self.id())
                .map(|(holder, docs)| {
                    let wanted = docs
                        .iter()
                        .filter(|d| !local.store.contains(d))
                        .cloned()
                        .collect();
                    (holder.clone(), wanted)
                })
                .collect()
        };

        let mut fetched = 0;
        for (holder, docs) in plan {
            for doc in docs {
                if self.service.local().store.contains(&doc) {
                    continue;
                }
                let started = Instant::now();
                match client::fetch_document(&holder, &doc, self.options.request_timeout).await {
                    Ok(content) => {
                        let elapsed = started.elapsed();
                        {
                            let mut local = self.service.local();
                            local.store.insert(doc.clone(), content);
                            local.index.entry_mut(&self.service.id).insert(doc.clone());
                        }
                        span.in_scope(|| info!(%holder, doc = %doc, "fetched in {elapsed:?}"));
                        report.fetched.push(FetchRecord {
                            doc,
                            holder: holder.clone(),
                            elapsed,
                        });
                        fetched += 1;
                    }
                    Err(e) if e.is_transport() => {
                        span.in_scope(|| warn!(%holder, "holder unreachable, forgetting it: {e}"));
                        self.service.local().index.forget(&holder);
                        break;
                    }
                    Err(e) => {
                        span.in_scope(|| warn!(%holder, doc = %doc, "fetch refused: {e}"));
                        self.service.local().index.entry_mut(&holder).remove(&doc);
                    }
                }
            }
        }
        fetched
    }
}
