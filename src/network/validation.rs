//! Connection re-validation after a redirect to a new host

use std::sync::Arc;

use futures::future::BoxFuture;
use url::Url;

use super::connection::Connection;
use super::headers::names;
use super::request::Request;
use super::transport::{CertificateCheck, Transport, TransportContext};
use crate::auth::AuthenticationMethod;
use crate::security::TrustGate;
use crate::utils::{NetworkError, Result, StratusError};

/// Checks that a redirect target is a usable server before requests move there
pub trait ConnectionValidator: Send + Sync {
    fn validate(&self, target: Url) -> BoxFuture<'static, Result<()>>;
}

/// Validates by fetching `status.php` on the target host
pub struct StatusValidator {
    transport: Arc<dyn Transport>,
    trust: Arc<TrustGate>,
    connection: Option<Connection>,
    authentication: Option<Arc<dyn AuthenticationMethod>>,
}

impl StatusValidator {
    pub fn new(transport: Arc<dyn Transport>, trust: Arc<TrustGate>) -> Self {
        Self {
            transport,
            trust,
            connection: None,
            authentication: None,
        }
    }

    /// Re-run `method` against `connection` as part of validation
    pub fn with_authentication(mut self, method: Arc<dyn AuthenticationMethod>, connection: Connection) -> Self {
        self.authentication = Some(method);
        self.connection = Some(connection);
        self
    }

    /// `status.php` URL on the target's host, keeping the connection's base path
    pub fn status_url(target: &Url, connection: Option<&Connection>) -> Result<Url> {
        let mut base = target.clone();
        base.set_query(None);
        base.set_fragment(None);
        base.set_path(connection.map(|c| c.base_url().path()).unwrap_or("/"));
        Ok(base.join("status.php")?)
    }
}

impl ConnectionValidator for StatusValidator {
    fn validate(&self, target: Url) -> BoxFuture<'static, Result<()>> {
        let transport = Arc::clone(&self.transport);
        let trust = Arc::clone(&self.trust);
        let connection = self.connection.clone();
        let authentication = self.authentication.clone();

        Box::pin(async move {
            let url = Self::status_url(&target, connection.as_ref())?;
            if let (Some(method), Some(connection)) = (&authentication, &connection) {
                method.authenticate(connection).await?;
            }

            let mut request = Request::get(url.as_str())?.skipping_authorization();
            if let Some(token) = connection.as_ref().and_then(Connection::validator_token) {
                request.set_header(names::CONNECTION_VALIDATOR, token);
            }
            let host = url.host_str().unwrap_or_default().to_string();
            let check = CertificateCheck::new(trust, false);
            let response = transport
                .send(request, TransportContext::new(check.clone()))
                .await
                .map_err(|failure| failure.error)?;
            if !check.was_evaluated()
                && let Some(certificate) = response.certificate()
            {
                check.check(certificate, &host)?;
            }

            if !response.is_success() {
                return Err(StratusError::Network(NetworkError::Other(format!(
                    "validation of {} returned {:?}",
                    url,
                    response.status()
                ))));
            }
            let installed = response
                .body_as_json()
                .ok()
                .and_then(|status| status.get("installed").and_then(|v| v.as_bool()));
            if installed == Some(false) {
                return Err(StratusError::Config(format!("server at {} is not installed", host)));
            }
            log::info!("[redirect] validated connection to {}", host);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_url_keeps_base_path() {
        let target = Url::parse("https://new.example.com/owncloud/remote.php/dav/files/a?x=1").unwrap();
        let connection = Connection::new("https://old.example.com/owncloud").unwrap();
        assert_eq!(
            StatusValidator::status_url(&target, Some(&connection)).unwrap().as_str(),
            "https://new.example.com/owncloud/status.php"
        );
        assert_eq!(
            StatusValidator::status_url(&target, None).unwrap().as_str(),
            "https://new.example.com/status.php"
        );
    }
}
