//! Ordered, case-insensitive header field map

use std::fmt;

/// Well-known header names
pub mod names {
    pub const LOCATION: &str = "Location";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const REQUEST_ID: &str = "X-Request-ID";
    pub const ORIGINAL_REQUEST_ID: &str = "Original-Request-ID";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const DEPTH: &str = "Depth";
    pub const DESTINATION: &str = "Destination";
    pub const OVERWRITE: &str = "Overwrite";
    pub const IF_MATCH: &str = "If-Match";
    pub const IF_NONE_MATCH: &str = "If-None-Match";
    pub const USER_AGENT: &str = "User-Agent";
    pub const RANGE: &str = "Range";
    pub const IF_RANGE: &str = "If-Range";
    pub const ETAG: &str = "ETag";
    /// Provider-custom modification time
    pub const MODIFICATION_TIME: &str = "X-OC-MTime";
    /// Provider-custom checksum
    pub const CHECKSUM: &str = "OC-Checksum";
    /// Token used when re-validating a connection
    pub const CONNECTION_VALIDATOR: &str = "X-Connection-Validator";
}

/// Header fields in insertion order.
///
/// Lookups ignore ASCII case. Setting an existing field replaces its value in
/// place (keeping its original position) and adopts the new spelling.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    fields: Vec<(String, String)>,
}

impl HeaderFields {
    /// Create an empty header map
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
    }

    /// Get a header value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|idx| self.fields[idx].1.as_str())
    }

    /// Set a header value, replacing any existing value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.fields[idx] = (name, value),
            None => self.fields.push((name, value)),
        }
    }

    /// Remove a header, returning its value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|idx| self.fields.remove(idx).1)
    }

    /// Check whether a header is present
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Merge another set of fields into this one (last write wins)
    pub fn extend<I, K, V>(&mut self, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in fields {
            self.set(name, value);
        }
    }

    /// Iterate over fields in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if there are no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Format headers one per line, hiding credentials
    pub fn formatted(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case(names::AUTHORIZATION) {
                    format!("{}: [redacted]", k)
                } else {
                    format!("{}: {}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Debug for HeaderFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.fields.iter().map(|(k, v)| {
                let shown = if k.eq_ignore_ascii_case(names::AUTHORIZATION) {
                    "[redacted]"
                } else {
                    v.as_str()
                };
                (k.as_str(), shown)
            }))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Self::new();
        fields.extend(iter);
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = HeaderFields::new();
        headers.set("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn test_last_write_wins_keeps_position() {
        let mut headers = HeaderFields::new();
        headers.set("Depth", "0");
        headers.set("Authorization", "Basic a");
        headers.set("depth", "1");

        assert_eq!(headers.len(), 2);
        let order: Vec<_> = headers.iter().collect();
        assert_eq!(order, vec![("depth", "1"), ("Authorization", "Basic a")]);
    }

    #[test]
    fn test_remove() {
        let mut headers: HeaderFields = [("Overwrite", "T")].into_iter().collect();
        assert_eq!(headers.remove("overwrite"), Some("T".to_string()));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_formatted_redacts_authorization() {
        let headers: HeaderFields = [("Authorization", "Bearer secret"), ("Depth", "1")]
            .into_iter()
            .collect();
        let text = headers.formatted();
        assert!(!text.contains("secret"));
        assert!(text.contains("Depth: 1"));
        assert!(!format!("{:?}", headers).contains("secret"));
    }
}
