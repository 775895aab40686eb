//! Server connection descriptor

use url::Url;
use uuid::Uuid;

use crate::utils::{Result, StratusError};

/// What authentication methods and validators operate on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    bookmark: Uuid,
    base_url: Url,
    user_name: Option<String>,
    validator_token: Option<String>,
}

impl Connection {
    /// Create a connection for a server base URL
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url)?;
        if base_url.host_str().is_none() {
            return Err(StratusError::Config(format!("{} has no host", base_url)));
        }
        // Relative joins must stay below the base path
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            bookmark: Uuid::new_v4(),
            base_url,
            user_name: None,
            validator_token: None,
        })
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    /// Token sent in the connection validator header during re-validation
    pub fn with_validator_token(mut self, token: impl Into<String>) -> Self {
        self.validator_token = Some(token.into());
        self
    }

    pub fn bookmark(&self) -> Uuid {
        self.bookmark
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn validator_token(&self) -> Option<&str> {
        self.validator_token.as_deref()
    }

    /// Resolve a path relative to the base URL
    pub fn url_for(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Whether `url` is on this connection's origin (scheme, host and port)
    pub fn serves(&self, url: &Url) -> bool {
        url.scheme() == self.base_url.scheme()
            && url.host_str().map(str::to_ascii_lowercase)
                == self.base_url.host_str().map(str::to_ascii_lowercase)
            && url.port_or_known_default() == self.base_url.port_or_known_default()
    }

    /// The same connection relocated to the origin of `url`.
    ///
    /// Keeps the base path, bookmark and user name.
    pub fn moved_to(&self, url: &Url) -> Result<Self> {
        let mut base_url = self.base_url.clone();
        base_url
            .set_scheme(url.scheme())
            .map_err(|_| StratusError::Config(format!("cannot move {} to {}", self.base_url, url)))?;
        base_url.set_host(url.host_str())?;
        base_url
            .set_port(url.port())
            .map_err(|_| StratusError::Config(format!("cannot move {} to {}", self.base_url, url)))?;
        Ok(Self {
            base_url,
            ..self.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_path_normalised() {
        let connection = Connection::new("https://cloud.example.com/owncloud").unwrap();
        assert_eq!(connection.base_url().as_str(), "https://cloud.example.com/owncloud/");
        assert_eq!(
            connection.url_for("/status.php").unwrap().as_str(),
            "https://cloud.example.com/owncloud/status.php"
        );
    }

    #[test]
    fn test_bookmarks_unique() {
        let a = Connection::new("https://a.example.com/").unwrap();
        let b = Connection::new("https://a.example.com/").unwrap();
        assert_ne!(a.bookmark(), b.bookmark());
    }

    #[test]
    fn test_serves_same_origin_only() {
        let connection = Connection::new("https://cloud.example.com/owncloud").unwrap();
        assert!(connection.serves(&Url::parse("https://CLOUD.example.com:443/other").unwrap()));
        assert!(!connection.serves(&Url::parse("http://cloud.example.com/owncloud/").unwrap()));
        assert!(!connection.serves(&Url::parse("https://cloud.example.com:8443/").unwrap()));
        assert!(!connection.serves(&Url::parse("https://attacker.example.org/owncloud/").unwrap()));
    }

    #[test]
    fn test_moved_to_keeps_path_and_identity() {
        let connection = Connection::new("https://cloud.example.com/owncloud")
            .unwrap()
            .with_user_name("alice");
        let moved = connection
            .moved_to(&Url::parse("https://new.example.com:8443/owncloud/status.php").unwrap())
            .unwrap();
        assert_eq!(moved.base_url().as_str(), "https://new.example.com:8443/owncloud/");
        assert_eq!(moved.bookmark(), connection.bookmark());
        assert_eq!(moved.user_name(), Some("alice"));
        assert!(moved.serves(&Url::parse("https://new.example.com:8443/x").unwrap()));
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(Connection::new("not a url").is_err());
    }
}
