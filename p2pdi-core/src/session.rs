//! Session bookkeeping for the registration service: leases, tokens, liveness.
//! Pure state; the host wraps it in a lock and drives `tick`.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::protocol::PeerId;

/// Default lease granted on Register/KeepAlive.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Inactive,
}

/// One registered peer. Sessions are never removed; inactive ones stay for
/// diagnostics and re-registration.
#[derive(Debug, Clone)]
pub struct Session {
    pub peer: PeerId,
    token: String,
    pub lease_remaining: Duration,
    pub state: SessionState,
    /// Number of Register calls seen for this peer.
    pub registrations: u32,
}

impl Session {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no session token supplied")]
    MissingToken,
    #[error("session token does not match for {0}")]
    InvalidToken(PeerId),
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
}

pub struct SessionTable {
    sessions: HashMap<PeerId, Session>,
    ttl: Duration,
}

impl SessionTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create or refresh the session for `peer` and mint a fresh token.
    /// A refreshed session never keeps its previous token.
    pub fn register(&mut self, peer: PeerId) -> String {
        let previous = self.sessions.get(&peer).map(|s| s.token.clone());
        let token = mint_token(previous.as_deref());
        let ttl = self.ttl;
        let session = self
            .sessions
            .entry(peer.clone())
            .or_insert_with(|| Session {
                peer,
                token: String::new(),
                lease_remaining: ttl,
                state: SessionState::Active,
                registrations: 0,
            });
        session.token = token.clone();
        session.lease_remaining = ttl;
        session.state = SessionState::Active;
        session.registrations = session.registrations.saturating_add(1);
        token
    }

    /// Check `token` against the stored token for `peer`.
    pub fn authorize(
        &mut self,
        peer: &PeerId,
        token: Option<&str>,
    ) -> Result<&mut Session, SessionError> {
        let token = token.ok_or(SessionError::MissingToken)?;
        let session = self
            .sessions
            .get_mut(peer)
            .ok_or_else(|| SessionError::UnknownPeer(peer.clone()))?;
        if session.token != token {
            return Err(SessionError::InvalidToken(peer.clone()));
        }
        Ok(session)
    }

    /// Leave: lease forced to zero and the session marked inactive.
    pub fn leave(&mut self, peer: &PeerId, token: Option<&str>) -> Result<(), SessionError> {
        let session = self.authorize(peer, token)?;
        session.lease_remaining = Duration::ZERO;
        session.state = SessionState::Inactive;
        Ok(())
    }

    /// KeepAlive: lease reset to the full TTL, session active again.
    pub fn keep_alive(&mut self, peer: &PeerId, token: Option<&str>) -> Result<(), SessionError> {
        let ttl = self.ttl;
        let session = self.authorize(peer, token)?;
        session.lease_remaining = ttl;
        session.state = SessionState::Active;
        Ok(())
    }

    /// Active peers other than the requester, sorted.
    pub fn active_peers(
        &mut self,
        requester: &PeerId,
        token: Option<&str>,
    ) -> Result<Vec<PeerId>, SessionError> {
        self.authorize(requester, token)?;
        let mut peers: Vec<PeerId> = self
            .sessions
            .values()
            .filter(|s| s.is_active() && s.peer != *requester)
            .map(|s| s.peer.clone())
            .collect();
        peers.sort();
        Ok(peers)
    }

    /// Housekeeping: charge `elapsed` against every active lease. Returns the
    /// peers that became inactive on this tick.
    pub fn tick(&mut self, elapsed: Duration) -> Vec<PeerId> {
        let mut expired = Vec::new();
        for session in self.sessions.values_mut().filter(|s| s.is_active()) {
            session.lease_remaining = session.lease_remaining.saturating_sub(elapsed);
            if session.lease_remaining.is_zero() {
                session.state = SessionState::Inactive;
                expired.push(session.peer.clone());
            }
        }
        expired.sort();
        expired
    }

    pub fn get(&self, peer: &PeerId) -> Option<&Session> {
        self.sessions.get(peer)
    }

    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// 4-digit token, never equal to `previous`.
fn mint_token(previous: Option<&str>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let token = rng.gen_range(1000..=9999u16).to_string();
        if previous != Some(token.as_str()) {
            return token;
        }
    }
}
