//! Process-wide connection pool and credential cache.
//!
//! Both caches own one mutex each. Critical sections are a map lookup or
//! insert; clients are built and credentials fetched outside the lock.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use ttpair_model::{AgentTimeouts, ObjectKey};

use crate::cluster::ClusterError;

/// Basic-auth pair used to call unit agents.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where per-object credentials come from when they are not cached.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self, key: &ObjectKey) -> Result<Credentials, ClusterError>;
}

/// Hands out the same credentials for every object.
#[derive(Debug, Clone)]
pub struct EnvCredentialSource {
    credentials: Credentials,
}

impl EnvCredentialSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn credentials(&self, _key: &ObjectKey) -> Result<Credentials, ClusterError> {
        Ok(self.credentials.clone())
    }
}

/// Credentials resolved per managed object.
#[derive(Debug, Default)]
pub struct CredentialCache {
    entries: Mutex<HashMap<ObjectKey, Credentials>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch(&self, key: &ObjectKey) -> Option<Credentials> {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: ObjectKey, credentials: Credentials) {
        self.lock().insert(key, credentials);
    }

    pub fn evict(&self, key: &ObjectKey) {
        if self.lock().remove(key).is_some() {
            debug!(pair = %key, "Evicted cached credentials");
        }
    }

    /// Cached credentials, else ask `source` and cache the answer.
    pub async fn resolve(
        &self,
        key: &ObjectKey,
        source: &dyn CredentialSource,
    ) -> Result<Credentials, ClusterError> {
        if let Some(credentials) = self.fetch(key) {
            return Ok(credentials);
        }
        let credentials = source.credentials(key).await?;
        self.insert(key.clone(), credentials.clone());
        Ok(credentials)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, Credentials>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// GETs and POSTs use different request timeouts, so they get separate clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodClass {
    Get,
    Post,
}

impl MethodClass {
    fn as_str(self) -> &'static str {
        match self {
            MethodClass::Get => "GET",
            MethodClass::Post => "POST",
        }
    }
}

/// Persistent HTTP clients keyed by a unit's stable network name.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    clients: Mutex<HashMap<String, reqwest::Client>>,
    accept_invalid_certs: bool,
}

impl ConnectionPool {
    pub fn new(accept_invalid_certs: bool) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            accept_invalid_certs,
        }
    }

    /// The pooled client for `host`, built on first use.
    pub fn fetch_or_create(
        &self,
        host: &str,
        method: MethodClass,
        timeouts: &AgentTimeouts,
    ) -> Result<reqwest::Client, reqwest::Error> {
        let key = pool_key(host, method);
        if let Some(client) = self.lock().get(&key) {
            return Ok(client.clone());
        }

        let request_timeout = match method {
            MethodClass::Get => timeouts.get,
            MethodClass::Post => timeouts.post,
        };
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.tcp + timeouts.tls)
            .timeout(request_timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()?;

        debug!(host, method = method.as_str(), "Created agent client");
        Ok(self.lock().entry(key).or_insert(client).clone())
    }

    pub fn evict_host(&self, host: &str) {
        let mut clients = self.lock();
        clients.remove(&pool_key(host, MethodClass::Get));
        clients.remove(&pool_key(host, MethodClass::Post));
    }

    /// Drop every client of the object's units.
    pub fn evict_object(&self, key: &ObjectKey) {
        let marker = format!(".{}.{}.", key.name, key.namespace);
        let mut clients = self.lock();
        let before = clients.len();
        clients.retain(|k, _| !k.contains(&marker));
        debug!(pair = %key, evicted = before - clients.len(), "Evicted pooled connections");
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, reqwest::Client>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn pool_key(host: &str, method: MethodClass) -> String {
    format!("{}|{}", host, method.as_str())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn credentials(&self, _key: &ObjectKey) -> Result<Credentials, ClusterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Credentials {
                user: "u".to_string(),
                password: "secret".to_string(),
            })
        }
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials {
            user: "ttagent".to_string(),
            password: "hunter2".to_string(),
        };
        let text = format!("{:?}", creds);
        assert!(text.contains("ttagent"));
        assert!(!text.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_resolve_caches() {
        let cache = CredentialCache::new();
        let source = CountingSource {
            calls: AtomicUsize::new(0),
        };
        let key = ObjectKey::new("ns", "db");

        cache.resolve(&key, &source).await.unwrap();
        cache.resolve(&key, &source).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        cache.evict(&key);
        assert!(cache.fetch(&key).is_none());
        cache.resolve(&key, &source).await.unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pool_reuses_and_evicts() {
        let pool = ConnectionPool::new(false);
        let timeouts = AgentTimeouts::default();
        let host = "db-0.db.ns.svc.cluster.local";

        pool.fetch_or_create(host, MethodClass::Get, &timeouts).unwrap();
        pool.fetch_or_create(host, MethodClass::Get, &timeouts).unwrap();
        pool.fetch_or_create(host, MethodClass::Post, &timeouts).unwrap();
        pool.fetch_or_create("other-0.other.ns.svc.cluster.local", MethodClass::Get, &timeouts)
            .unwrap();
        assert_eq!(pool.len(), 3);

        pool.evict_host(host);
        assert_eq!(pool.len(), 1);

        pool.evict_object(&ObjectKey::new("ns", "other"));
        assert!(pool.is_empty());
    }
}
