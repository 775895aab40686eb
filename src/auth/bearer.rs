//! Bearer token authentication

use std::sync::Arc;

use futures::future::BoxFuture;

use super::{AuthenticationMethod, AuthenticationMethodType, Secret, SecretCache, SecretLoader};
use crate::network::{Connection, Request, headers::names};
use crate::utils::{Result, StratusError};

/// `Authorization: Bearer <token>`
#[derive(Debug)]
pub struct BearerAuthentication {
    secrets: SecretCache,
}

impl BearerAuthentication {
    pub const IDENTIFIER: &'static str = "stratus.authentication.bearer";

    pub fn new(loader: Arc<dyn SecretLoader>) -> Self {
        Self {
            secrets: SecretCache::new(loader),
        }
    }

    fn token(&self, connection: &Connection) -> Result<Secret> {
        self.secrets.get(connection).ok_or_else(|| {
            StratusError::Authorization(format!("no token for {}", connection.base_url()))
        })
    }
}

impl AuthenticationMethod for BearerAuthentication {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    fn method_type(&self) -> AuthenticationMethodType {
        AuthenticationMethodType::Token
    }

    fn authorize(&self, mut request: Request, connection: &Connection) -> Result<Request> {
        let token = self.token(connection)?;
        request.set_header(names::AUTHORIZATION, format!("Bearer {}", token.expose()));
        Ok(request)
    }

    fn authenticate<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.token(connection).map(|_| ()) })
    }

    fn deauthenticate<'a>(&'a self, _connection: &'a Connection) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.secrets.flush();
            Ok(())
        })
    }

    fn cached_secret(&self, connection: &Connection) -> Option<Secret> {
        self.secrets.get(connection)
    }

    fn flush_cached_secret(&self) {
        self.secrets.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticSecretLoader;

    #[test]
    fn test_bearer_header() {
        let method = BearerAuthentication::new(Arc::new(StaticSecretLoader::new(Secret::new("abc.def"))));
        let conn = Connection::new("https://cloud.example.com/").unwrap();
        let request = method
            .authorize(Request::get("https://cloud.example.com/ocs").unwrap(), &conn)
            .unwrap();
        assert_eq!(request.header_value(names::AUTHORIZATION), Some("Bearer abc.def"));
        assert!(!method.uses_user_name());
    }

    #[tokio::test]
    async fn test_authenticate_without_token_fails() {
        let method = BearerAuthentication::new(Arc::new(StaticSecretLoader::empty()));
        let conn = Connection::new("https://cloud.example.com/").unwrap();
        assert!(matches!(
            method.authenticate(&conn).await,
            Err(StratusError::Authorization(_))
        ));
        assert!(method.cached_secret(&conn).is_none());
    }
}
