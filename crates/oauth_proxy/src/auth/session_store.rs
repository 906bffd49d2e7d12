//! In-memory session store.
//!
//! Sessions are keyed by the SHA-256 digest of their bearer token; the raw
//! token is only ever handed to the client in the session cookie.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::crypto::{generate_token, token_digest};
use super::identity::Identity;

/// Random bytes per session token (256 bits).
const TOKEN_BYTES: usize = 32;

/// An authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub identity: Arc<Identity>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Seconds left until expiry, for the cookie `Max-Age`.
    pub fn remaining_secs(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    identity: Arc<Identity>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Concurrent token -> identity map with per-session expiry.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<[u8; 32], SessionEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `identity` valid for `ttl`.
    pub fn create(&self, identity: Identity, ttl: Duration) -> Session {
        let identity = Arc::new(identity);
        let issued_at = Utc::now();
        let expires_at = issued_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        loop {
            let token = generate_token(TOKEN_BYTES);
            match self.sessions.entry(token_digest(&token)) {
                // 256-bit tokens do not collide in practice, but a live session is never overwritten.
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(SessionEntry {
                        identity: identity.clone(),
                        issued_at,
                        expires_at,
                    });
                    debug!(user = identity.username(), provider = %identity.provider(), "session created");
                    return Session {
                        token,
                        identity,
                        issued_at,
                        expires_at,
                    };
                }
            }
        }
    }

    /// Resolve a token to its session. Expired sessions are evicted and reported as absent.
    pub fn lookup(&self, token: &str) -> Option<Session> {
        let key = token_digest(token);
        let now = Utc::now();

        let session = {
            let entry = self.sessions.get(&key)?;
            Session {
                token: token.to_string(),
                identity: entry.identity.clone(),
                issued_at: entry.issued_at,
                expires_at: entry.expires_at,
            }
        };

        if session.is_expired_at(now) {
            self.sessions.remove_if(&key, |_, entry| now >= entry.expires_at);
            return None;
        }
        Some(session)
    }

    /// Remove a session. Unknown tokens are ignored.
    pub fn revoke(&self, token: &str) {
        self.sessions.remove(&token_digest(token));
    }

    /// Evict every expired session, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| now < entry.expires_at);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
