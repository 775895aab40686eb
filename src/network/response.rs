//! HTTP response types

use std::path::{Path, PathBuf};

use url::Url;

use super::headers::{names, HeaderFields};
use crate::security::Certificate;
use crate::utils::{Result, StratusError};

/// Response body
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResponseBody {
    /// Nothing received
    #[default]
    Empty,
    /// Buffered in memory
    Data(Vec<u8>),
    /// Written to a file (download requests)
    File(PathBuf),
}

/// HTTP response
#[derive(Debug, Clone, Default)]
pub struct Response {
    status: Option<u16>,
    headers: HeaderFields,
    body: ResponseBody,
    certificate: Option<Certificate>,
    error: Option<StratusError>,
}

impl Response {
    /// Create a new response
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Some(status),
            body: ResponseBody::Data(body.into()),
            ..Self::default()
        }
    }

    /// Create a new response with headers
    pub fn with_headers(status: u16, body: impl Into<Vec<u8>>, headers: HeaderFields) -> Self {
        Self {
            headers,
            ..Self::new(status, body)
        }
    }

    /// A response that never reached the server
    pub fn failed(error: StratusError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// Redirect response pointing at `location`
    pub fn redirect(status: u16, location: &str) -> Self {
        let mut response = Self::new(status, Vec::new());
        response.add_header(names::LOCATION, location);
        response
    }

    /// Get the status code
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    fn status_in(&self, range: std::ops::Range<u16>) -> bool {
        self.status.is_some_and(|s| range.contains(&s))
    }

    /// Check if the response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status_in(200..300)
    }

    /// Check if the response is a followable redirect (301, 302, 303, 307, 308)
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, Some(301 | 302 | 303 | 307 | 308))
    }

    /// Check if the response is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_in(400..500)
    }

    /// Check if the response is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_in(500..600)
    }

    /// Location header resolved against `base`
    pub fn redirect_location(&self, base: &Url) -> Option<Url> {
        let location = self.headers.get(names::LOCATION)?;
        Url::parse(location).or_else(|_| base.join(location)).ok()
    }

    /// Get the response body
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Buffered body bytes, if the body is in memory
    pub fn body_data(&self) -> Option<&[u8]> {
        match &self.body {
            ResponseBody::Data(data) => Some(data),
            _ => None,
        }
    }

    /// File the body was written to, for downloads
    pub fn body_file(&self) -> Option<&Path> {
        match &self.body {
            ResponseBody::File(path) => Some(path),
            _ => None,
        }
    }

    /// Body decoded as UTF-8 (lossy)
    pub fn body_as_string(&self) -> Option<String> {
        self.body_data()
            .map(|data| String::from_utf8_lossy(data).into_owned())
    }

    /// Body parsed as JSON
    pub fn body_as_json(&self) -> Result<serde_json::Value> {
        let data = self.body_data().unwrap_or_default();
        serde_json::from_slice(data)
            .map_err(|e| StratusError::Io(format!("invalid JSON body: {}", e)))
    }

    /// Get the content type from headers
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(names::CONTENT_TYPE)
    }

    /// Get content length from headers
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(names::CONTENT_LENGTH)
            .and_then(|s| s.parse().ok())
    }

    /// Get response headers
    pub fn headers(&self) -> &HeaderFields {
        &self.headers
    }

    /// Get a specific header
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Add a header
    pub fn add_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.set(key, value);
    }

    pub fn set_body(&mut self, body: ResponseBody) {
        self.body = body;
    }

    /// Peer certificate the response was served with
    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    pub fn set_certificate(&mut self, certificate: Option<Certificate>) {
        self.certificate = certificate;
    }

    /// Terminal error, `None` on success
    pub fn error(&self) -> Option<&StratusError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: Option<StratusError>) {
        self.error = error;
    }

    /// Attach a terminal error, builder style
    pub fn with_error(mut self, error: StratusError) -> Self {
        self.error = Some(error);
        self
    }
}
