//! Client authorization: the service contract and the freshness-bounded
//! principal cache.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use courier_errors::{Error, ErrorKind, Result};
use courier_tasks::{FnTask, Task};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

/// An authenticated identity as returned by the authorization service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPrincipal {
    pub secure_identity: String,
    pub given_name: String,
    pub family_name: String,
    pub email: String,
    pub type_id: String,
}

/// The external authorization integration point. The concrete service
/// (HTTP, LDAP, ...) stays outside this crate; only the cache contract it
/// plugs into is defined here.
#[async_trait]
pub trait AuthorizationService: Send + Sync {
    /// The token type this service understands (the envelope's
    /// `authenticationToken.type`).
    fn token_type(&self) -> &str;

    /// Authorize the opaque token payload, returning the principal.
    async fn authorize(&self, token_data: &[u8]) -> Result<SecurityPrincipal>;
}

type Fingerprint = [u8; 32];

struct CacheEntry {
    principal: SecurityPrincipal,
    refreshed_at: Instant,
}

/// Principal cache keyed by an internal token fingerprint.
///
/// Entries expire after the configured freshness interval and can be
/// evicted explicitly. Concurrent authorization requests for the same token
/// are allowed; the last completed one wins, which is harmless since the
/// service is the source of truth.
pub struct AuthorizationCache {
    service: Arc<dyn AuthorizationService>,
    freshness: Mutex<Duration>,
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
}

const DEFAULT_FRESHNESS_INTERVAL: Duration = Duration::from_secs(15 * 60);

impl AuthorizationCache {
    pub fn new(service: Arc<dyn AuthorizationService>) -> Self {
        AuthorizationCache {
            service,
            freshness: Mutex::new(DEFAULT_FRESHNESS_INTERVAL),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn token_type(&self) -> &str {
        self.service.token_type()
    }

    pub fn configure_freshness_interval(&self, interval: Duration) {
        *self.freshness.lock().unwrap() = interval;
    }

    fn fingerprint(token_data: &[u8]) -> Fingerprint {
        Sha256::digest(token_data).into()
    }

    /// The cached principal for this token, when present and fresh.
    /// Stale entries are evicted on the way out.
    pub fn try_get_authorized_principal(&self, token_data: &[u8]) -> Option<SecurityPrincipal> {
        let fingerprint = Self::fingerprint(token_data);
        let freshness = *self.freshness.lock().unwrap();

        {
            let entries = self.entries.read().unwrap();
            match entries.get(&fingerprint) {
                Some(entry) if entry.refreshed_at.elapsed() < freshness => {
                    return Some(entry.principal.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Stale: take the write lock and re-check before evicting.
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get(&fingerprint) {
            if entry.refreshed_at.elapsed() < freshness {
                return Some(entry.principal.clone());
            }
            entries.remove(&fingerprint);
            trace!(fingerprint = %hex::encode(&fingerprint[..8]), "evicted stale principal");
        }
        None
    }

    /// Authorize through the service and cache the principal.
    ///
    /// Failures never carry the raw token payload; it is registered as a
    /// sensitive value on the returned error.
    pub async fn update(&self, token_data: &[u8]) -> Result<SecurityPrincipal> {
        let principal = self
            .service
            .authorize(token_data)
            .await
            .map_err(|e| e.with_sensitive(String::from_utf8_lossy(token_data)))?;

        let fingerprint = Self::fingerprint(token_data);
        debug!(
            sid = %principal.secure_identity,
            fingerprint = %hex::encode(&fingerprint[..8]),
            "authorization cache updated"
        );
        self.entries.write().unwrap().insert(
            fingerprint,
            CacheEntry {
                principal: principal.clone(),
                refreshed_at: Instant::now(),
            },
        );
        Ok(principal)
    }

    /// Cache hit, or a fresh authorization when the entry is missing/stale.
    pub async fn try_update(&self, token_data: &[u8]) -> Option<SecurityPrincipal> {
        if let Some(principal) = self.try_get_authorized_principal(token_data) {
            return Some(principal);
        }
        self.update(token_data).await.ok()
    }

    /// A task performing [`AuthorizationCache::update`] for queue-driven
    /// callers; the principal lands in the cache as a side effect.
    pub fn create_authorization_task(self: &Arc<Self>, token_data: Vec<u8>) -> Box<dyn Task> {
        let cache = Arc::clone(self);
        Box::new(FnTask::new("authorization", move |_cx| async move {
            cache.update(&token_data).await.map(|_| ())
        }))
    }

    pub fn evict(&self, token_data: &[u8]) {
        let fingerprint = Self::fingerprint(token_data);
        self.entries.write().unwrap().remove(&fingerprint);
    }
}

// ── Static service ────────────────────────────────────────────────────────────

/// Table-driven [`AuthorizationService`] used by the daemon's demo mode and
/// by tests: a fixed map from token payload to principal.
pub struct StaticAuthorizationService {
    token_type: String,
    principals: HashMap<String, SecurityPrincipal>,
}

impl StaticAuthorizationService {
    pub fn new(token_type: impl Into<String>) -> Self {
        StaticAuthorizationService {
            token_type: token_type.into(),
            principals: HashMap::new(),
        }
    }

    pub fn with_principal(mut self, token_data: impl Into<String>, principal: SecurityPrincipal) -> Self {
        self.principals.insert(token_data.into(), principal);
        self
    }
}

#[async_trait]
impl AuthorizationService for StaticAuthorizationService {
    fn token_type(&self) -> &str {
        &self.token_type
    }

    async fn authorize(&self, token_data: &[u8]) -> Result<SecurityPrincipal> {
        let key = String::from_utf8_lossy(token_data);
        self.principals.get(key.as_ref()).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::UserAuthentication,
                "the authentication token was rejected",
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> SecurityPrincipal {
        SecurityPrincipal {
            secure_identity: "alice".into(),
            given_name: "Alice".into(),
            family_name: "Smith".into(),
            email: "alice@example.com".into(),
            type_id: "user".into(),
        }
    }

    fn cache() -> Arc<AuthorizationCache> {
        let service = StaticAuthorizationService::new("T").with_principal("abc", alice());
        Arc::new(AuthorizationCache::new(Arc::new(service)))
    }

    #[tokio::test]
    async fn miss_update_hit_evict() {
        let cache = cache();
        assert!(cache.try_get_authorized_principal(b"abc").is_none());

        let principal = cache.update(b"abc").await.unwrap();
        assert_eq!(principal.secure_identity, "alice");

        let cached = cache.try_get_authorized_principal(b"abc").unwrap();
        assert_eq!(cached, principal);

        cache.evict(b"abc");
        assert!(cache.try_get_authorized_principal(b"abc").is_none());
    }

    #[tokio::test]
    async fn freshness_expiry_evicts_on_read() {
        let cache = cache();
        cache.update(b"abc").await.unwrap();
        cache.configure_freshness_interval(Duration::from_millis(0));
        assert!(cache.try_get_authorized_principal(b"abc").is_none());
    }

    #[tokio::test]
    async fn rejected_token_error_redacts_the_payload() {
        let cache = cache();
        let err = cache.update(b"wrong-token").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserAuthentication);

        let envelope = courier_errors::ServerErrorJson::from_error(&err).to_json_string();
        assert!(!envelope.contains("wrong-token"));
    }

    #[tokio::test]
    async fn authorization_task_populates_the_cache() {
        let cache = cache();
        let mut task = cache.create_authorization_task(b"abc".to_vec());
        let cx = courier_tasks::TaskContext::standalone(courier_tasks::ControlToken::new());
        task.run(&cx).await.unwrap();
        assert!(cache.try_get_authorized_principal(b"abc").is_some());
    }
}
