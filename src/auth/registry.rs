//! Registry of authentication method factories

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use super::{AuthenticationMethod, BasicAuthentication, BearerAuthentication, SecretLoader};
use crate::network::Connection;
use crate::utils::{self, Result, StratusError};

/// Builds a method instance for a connection
pub type AuthenticationMethodFactory =
    Arc<dyn Fn(&Connection) -> Arc<dyn AuthenticationMethod> + Send + Sync>;

/// Identifier to factory mapping. Injected, not global.
#[derive(Default)]
pub struct AuthenticationRegistry {
    factories: RwLock<BTreeMap<String, AuthenticationMethodFactory>>,
}

impl AuthenticationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in methods, all sharing `loader`
    pub fn with_builtin_methods(loader: Arc<dyn SecretLoader>) -> Self {
        let registry = Self::new();
        let basic_loader = Arc::clone(&loader);
        registry.register(
            BasicAuthentication::IDENTIFIER,
            Arc::new(move |_: &Connection| {
                Arc::new(BasicAuthentication::new(Arc::clone(&basic_loader))) as Arc<dyn AuthenticationMethod>
            }),
        );
        registry.register(
            BearerAuthentication::IDENTIFIER,
            Arc::new(move |_: &Connection| {
                Arc::new(BearerAuthentication::new(Arc::clone(&loader))) as Arc<dyn AuthenticationMethod>
            }),
        );
        registry
    }

    /// Register a factory, replacing any previous one with the same identifier
    pub fn register(&self, identifier: impl Into<String>, factory: AuthenticationMethodFactory) {
        let identifier = identifier.into();
        log::debug!("[auth] registered method {}", identifier);
        utils::write(&self.factories).insert(identifier, factory);
    }

    pub fn unregister(&self, identifier: &str) -> bool {
        utils::write(&self.factories).remove(identifier).is_some()
    }

    /// Factory registered under `identifier`
    pub fn method_for(&self, identifier: &str) -> Result<AuthenticationMethodFactory> {
        utils::read(&self.factories)
            .get(identifier)
            .cloned()
            .ok_or_else(|| StratusError::UnknownAuthenticationMethod(identifier.to_string()))
    }

    /// Registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<String> {
        utils::read(&self.factories).keys().cloned().collect()
    }

    /// Build an instance of `identifier` for `connection`
    pub fn instantiate(&self, identifier: &str, connection: &Connection) -> Result<Arc<dyn AuthenticationMethod>> {
        let factory = self.method_for(identifier)?;
        Ok(factory(connection))
    }
}

impl fmt::Debug for AuthenticationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticationRegistry")
            .field("identifiers", &self.identifiers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthenticationMethodType, Secret, StaticSecretLoader};

    fn registry() -> AuthenticationRegistry {
        AuthenticationRegistry::with_builtin_methods(Arc::new(StaticSecretLoader::new(Secret::new("t"))))
    }

    #[test]
    fn test_builtin_identifiers() {
        assert_eq!(
            registry().identifiers(),
            vec![
                BasicAuthentication::IDENTIFIER.to_string(),
                BearerAuthentication::IDENTIFIER.to_string()
            ]
        );
    }

    #[test]
    fn test_instantiate() {
        let conn = Connection::new("https://cloud.example.com/").unwrap();
        let method = registry()
            .instantiate(BearerAuthentication::IDENTIFIER, &conn)
            .unwrap();
        assert_eq!(method.method_type(), AuthenticationMethodType::Token);
        assert_eq!(method.identifier(), BearerAuthentication::IDENTIFIER);
    }

    #[test]
    fn test_unknown_identifier() {
        let registry = registry();
        assert!(registry.unregister(BasicAuthentication::IDENTIFIER));
        assert!(matches!(
            registry.method_for(BasicAuthentication::IDENTIFIER),
            Err(StratusError::UnknownAuthenticationMethod(_))
        ));
    }
}
