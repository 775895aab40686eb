//! HTTP Basic authentication

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::{AuthenticationMethod, AuthenticationMethodType, Secret, SecretCache, SecretLoader};
use crate::network::{Connection, Request, headers::names};
use crate::utils::{Result, StratusError};

/// Persisted form of a user name / passphrase pair
#[derive(Debug, Serialize, Deserialize)]
struct AuthenticationData {
    username: String,
    passphrase: String,
}

/// `Authorization: Basic base64(user:passphrase)`
#[derive(Debug)]
pub struct BasicAuthentication {
    secrets: SecretCache,
}

impl BasicAuthentication {
    pub const IDENTIFIER: &'static str = "stratus.authentication.basic";

    pub fn new(loader: Arc<dyn SecretLoader>) -> Self {
        Self {
            secrets: SecretCache::new(loader),
        }
    }

    /// Serialize credentials for storage by the host application
    pub fn authentication_data(user_name: &str, passphrase: &str) -> Result<Vec<u8>> {
        serde_json::to_vec(&AuthenticationData {
            username: user_name.to_string(),
            passphrase: passphrase.to_string(),
        })
        .map_err(|e| StratusError::Authorization(format!("cannot encode credentials: {}", e)))
    }

    /// User name stored in serialized credentials
    pub fn user_name_from_authentication_data(data: &[u8]) -> Option<String> {
        serde_json::from_slice::<AuthenticationData>(data)
            .ok()
            .map(|data| data.username)
    }

    /// Passphrase stored in serialized credentials
    pub fn secret_from_authentication_data(data: &[u8]) -> Option<Secret> {
        serde_json::from_slice::<AuthenticationData>(data)
            .ok()
            .map(|data| Secret::new(data.passphrase))
    }

    fn header_value(&self, connection: &Connection) -> Result<String> {
        let user = connection
            .user_name()
            .ok_or_else(|| StratusError::Authorization("connection has no user name".into()))?;
        let secret = self
            .secrets
            .get(connection)
            .ok_or_else(|| StratusError::Authorization(format!("no passphrase for {}", user)))?;
        let encoded = STANDARD.encode(format!("{}:{}", user, secret.expose()));
        Ok(format!("Basic {}", encoded))
    }
}

impl AuthenticationMethod for BasicAuthentication {
    fn identifier(&self) -> &str {
        Self::IDENTIFIER
    }

    fn method_type(&self) -> AuthenticationMethodType {
        AuthenticationMethodType::Passphrase
    }

    fn authorize(&self, mut request: Request, connection: &Connection) -> Result<Request> {
        let value = self.header_value(connection)?;
        request.set_header(names::AUTHORIZATION, value);
        Ok(request)
    }

    fn authenticate<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.header_value(connection)?;
            log::debug!("[auth] basic credentials available for {}", connection.base_url());
            Ok(())
        })
    }

    fn deauthenticate<'a>(&'a self, connection: &'a Connection) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.secrets.flush();
            log::debug!("[auth] dropped basic credentials for {}", connection.base_url());
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

    fn connection() -> Connection {
        Connection::new("https://cloud.example.com/")
            .unwrap()
            .with_user_name("alice")
    }

    fn method() -> BasicAuthentication {
        BasicAuthentication::new(Arc::new(StaticSecretLoader::new(Secret::new("wonderland"))))
    }

    #[test]
    fn test_authorize_sets_header_once() {
        let method = method();
        let conn = connection();
        let request = Request::get("https://cloud.example.com/remote.php/dav").unwrap();

        let once = method.authorize(request, &conn).unwrap();
        let twice = method.authorize(once.clone(), &conn).unwrap();

        assert_eq!(
            once.header_value("authorization"),
            Some("Basic YWxpY2U6d29uZGVybGFuZA==")
        );
        assert_eq!(once.headers(), twice.headers());
    }

    #[test]
    fn test_missing_user_name_fails() {
        let conn = Connection::new("https://cloud.example.com/").unwrap();
        let request = Request::get("https://cloud.example.com/").unwrap();
        assert!(matches!(
            method().authorize(request, &conn),
            Err(StratusError::Authorization(_))
        ));
    }

    #[test]
    fn test_authentication_data_round_trip() {
        let data = BasicAuthentication::authentication_data("bob", "s3cret").unwrap();
        assert_eq!(
            BasicAuthentication::user_name_from_authentication_data(&data),
            Some("bob".to_string())
        );
        assert_eq!(
            BasicAuthentication::secret_from_authentication_data(&data),
            Some(Secret::new("s3cret"))
        );
        assert_eq!(BasicAuthentication::user_name_from_authentication_data(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_deauthenticate_flushes() {
        let method = method();
        let conn = connection();
        method.authenticate(&conn).await.unwrap();
        assert!(method.secrets.is_cached());
        method.deauthenticate(&conn).await.unwrap();
        assert!(!method.secrets.is_cached());
        assert!(method.uses_user_name());
    }
}
