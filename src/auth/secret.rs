//! Cached secrets with an injected loader

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::network::Connection;
use crate::utils;

/// A credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

/// Loads a secret from wherever it is persisted
#[cfg_attr(test, mockall::automock)]
pub trait SecretLoader: Send + Sync {
    fn load(&self, connection: &Connection) -> Option<Secret>;
}

/// Loader that always hands out the same secret
#[derive(Debug, Clone)]
pub struct StaticSecretLoader {
    secret: Option<Secret>,
}

impl StaticSecretLoader {
    pub fn new(secret: Secret) -> Self {
        Self {
            secret: Some(secret),
        }
    }

    /// Loader with nothing to hand out
    pub fn empty() -> Self {
        Self { secret: None }
    }
}

impl SecretLoader for StaticSecretLoader {
    fn load(&self, _connection: &Connection) -> Option<Secret> {
        self.secret.clone()
    }
}

/// Two-tier lookup: memory first, then the loader
pub struct SecretCache {
    cached: Mutex<Option<Secret>>,
    loader: Arc<dyn SecretLoader>,
}

impl SecretCache {
    pub fn new(loader: Arc<dyn SecretLoader>) -> Self {
        Self {
            cached: Mutex::new(None),
            loader,
        }
    }

    /// Cached secret, loading it on a miss
    pub fn get(&self, connection: &Connection) -> Option<Secret> {
        let mut cached = utils::lock(&self.cached);
        if cached.is_none() {
            *cached = self.loader.load(connection);
            if cached.is_some() {
                log::trace!("[auth] loaded secret for {}", connection.bookmark());
            }
        }
        cached.clone()
    }

    pub fn is_cached(&self) -> bool {
        utils::lock(&self.cached).is_some()
    }

    /// Drop the in-memory copy
    pub fn flush(&self) {
        *utils::lock(&self.cached) = None;
    }
}

impl fmt::Debug for SecretCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretCache")
            .field("cached", &self.is_cached())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        Connection::new("https://cloud.example.com/").unwrap()
    }

    #[test]
    fn test_loads_once_then_caches() {
        let mut loader = MockSecretLoader::new();
        loader
            .expect_load()
            .times(1)
            .returning(|_| Some(Secret::new("hunter2")));
        let cache = SecretCache::new(Arc::new(loader));

        let conn = connection();
        assert_eq!(cache.get(&conn).map(|s| s.expose().to_string()), Some("hunter2".into()));
        assert_eq!(cache.get(&conn), Some(Secret::new("hunter2")));
        assert!(cache.is_cached());
    }

    #[test]
    fn test_flush_forces_reload() {
        let mut loader = MockSecretLoader::new();
        loader
            .expect_load()
            .times(2)
            .returning(|_| Some(Secret::new("token")));
        let cache = SecretCache::new(Arc::new(loader));

        let conn = connection();
        cache.get(&conn);
        cache.flush();
        assert!(!cache.is_cached());
        cache.get(&conn);
    }

    #[test]
    fn test_miss_is_retried() {
        let mut loader = MockSecretLoader::new();
        loader.expect_load().times(2).returning(|_| None);
        let cache = SecretCache::new(Arc::new(loader));

        let conn = connection();
        assert_eq!(cache.get(&conn), None);
        assert_eq!(cache.get(&conn), None);
    }

    #[test]
    fn test_secret_debug_redacted() {
        assert_eq!(format!("{:?}", Secret::new("pw")), "Secret([redacted])");
    }
}
