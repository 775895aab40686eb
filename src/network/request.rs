//! HTTP request types

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::headers::{names, HeaderFields};
use super::progress::ProgressReporter;
use super::redirect::RedirectPolicy;
use super::resume::ResumeInfo;
use crate::events::EventTarget;
use crate::security::{DecisionHandler, RequestDecisionHandler};
use crate::utils::{Result, StratusError};

/// Priority assigned to requests that don't set one
pub const DEFAULT_PRIORITY: f32 = 0.5;

/// Unique request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// HTTP and WebDAV methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Patch,
    Mkcol,
    Options,
    Move,
    Copy,
    Propfind,
    Proppatch,
    Report,
    Lock,
    Unlock,
}

impl Method {
    /// Every supported method
    pub const ALL: [Method; 15] = [
        Self::Get,
        Self::Post,
        Self::Put,
        Self::Delete,
        Self::Head,
        Self::Patch,
        Self::Mkcol,
        Self::Options,
        Self::Move,
        Self::Copy,
        Self::Propfind,
        Self::Proppatch,
        Self::Report,
        Self::Lock,
        Self::Unlock,
    ];

    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Patch => "PATCH",
            Self::Mkcol => "MKCOL",
            Self::Options => "OPTIONS",
            Self::Move => "MOVE",
            Self::Copy => "COPY",
            Self::Propfind => "PROPFIND",
            Self::Proppatch => "PROPPATCH",
            Self::Report => "REPORT",
            Self::Lock => "LOCK",
            Self::Unlock => "UNLOCK",
        }
    }

    /// Whether parameters travel form-encoded in the body rather than the query
    pub fn sends_parameters_in_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = StratusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| StratusError::Admission(format!("unsupported method {}", s)))
    }
}

/// Request body source. Data and file are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// In-memory bytes
    Data(Vec<u8>),
    /// Contents of a local file
    File(PathBuf),
}

/// HTTP request plus its scheduling state
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    lineage: RequestId,
    method: Method,
    url: Url,
    history: Vec<Url>,
    headers: HeaderFields,
    parameters: Vec<(String, String)>,
    body: Option<Body>,
    priority: Option<f32>,
    group_id: Option<String>,
    earliest_begin: Option<SystemTime>,
    required_signals: BTreeSet<String>,
    required_cellular_switch: Option<String>,
    download_request: bool,
    downloaded_file: Option<PathBuf>,
    avoid_cellular: bool,
    auto_resume: bool,
    auto_resume_info: Option<ResumeInfo>,
    non_critical: bool,
    cancelled: bool,
    skip_authorization: bool,
    force_certificate_decision_delegation: bool,
    certificate_decision_handler: Option<RequestDecisionHandler>,
    progress: Option<ProgressReporter>,
    redirect_policy: RedirectPolicy,
    max_redirect_depth: Option<u8>,
    event_target: Option<EventTarget>,
    user_info: BTreeMap<String, String>,
}

impl Request {
    /// Create a new request
    pub fn new(method: Method, url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(StratusError::Admission(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        let id = RequestId::generate();
        Ok(Self {
            id,
            lineage: id,
            method,
            history: vec![url.clone()],
            url,
            headers: HeaderFields::new(),
            parameters: Vec::new(),
            body: None,
            priority: None,
            group_id: None,
            earliest_begin: None,
            required_signals: BTreeSet::new(),
            required_cellular_switch: None,
            download_request: false,
            downloaded_file: None,
            avoid_cellular: false,
            auto_resume: false,
            auto_resume_info: None,
            non_critical: false,
            cancelled: false,
            skip_authorization: false,
            force_certificate_decision_delegation: false,
            certificate_decision_handler: None,
            progress: None,
            redirect_policy: RedirectPolicy::Default,
            max_redirect_depth: None,
            event_target: None,
            user_info: BTreeMap::new(),
        })
    }

    /// Create a GET request
    pub fn get(url: &str) -> Result<Self> {
        Self::new(Method::Get, url)
    }

    /// Create a POST request
    pub fn post(url: &str) -> Result<Self> {
        Self::new(Method::Post, url)
    }

    /// Create a PROPFIND request
    pub fn propfind(url: &str) -> Result<Self> {
        Self::new(Method::Propfind, url)
    }

    // Builders

    /// Add a header
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(key, value);
        self
    }

    /// Set a parameter
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_parameter(key, value);
        self
    }

    /// Set the request body from memory
    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.set_body_data(body);
        self
    }

    /// Set the request body from a file
    pub fn body_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.set_body_file(path);
        self
    }

    /// Set the priority (higher runs sooner)
    pub fn with_priority(mut self, priority: f32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Place the request in a serial group
    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Don't dispatch before the given time
    pub fn not_before(mut self, when: SystemTime) -> Self {
        self.earliest_begin = Some(when);
        self
    }

    /// Require a signal to be satisfied before dispatch
    pub fn requiring_signal(mut self, signal: impl Into<String>) -> Self {
        self.required_signals.insert(signal.into());
        self
    }

    /// Require a cellular switch to be allowed before dispatch
    pub fn requiring_cellular_switch(mut self, switch: impl Into<String>) -> Self {
        self.required_cellular_switch = Some(switch.into());
        self
    }

    /// Write the response body to a file
    pub fn download(mut self) -> Self {
        self.download_request = true;
        self
    }

    /// Write the response body to the given file
    pub fn download_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_request = true;
        self.downloaded_file = Some(path.into());
        self
    }

    /// Don't run while the device is on a cellular network
    pub fn avoiding_cellular(mut self) -> Self {
        self.avoid_cellular = true;
        self
    }

    /// Resume automatically after a connectivity loss
    pub fn auto_resuming(mut self) -> Self {
        self.auto_resume = true;
        self
    }

    /// Allow cancellation on shutdown
    pub fn non_critical(mut self) -> Self {
        self.non_critical = true;
        self
    }

    /// Send without applying authentication
    pub fn skipping_authorization(mut self) -> Self {
        self.skip_authorization = true;
        self
    }

    /// Consult the certificate decision handler even for trusted certificates
    pub fn forcing_certificate_decision(mut self) -> Self {
        self.force_certificate_decision_delegation = true;
        self
    }

    /// Decide certificate trust for this request only, ahead of the gate's handler
    pub fn with_certificate_decision_handler(mut self, handler: DecisionHandler) -> Self {
        self.certificate_decision_handler = Some(RequestDecisionHandler::new(handler));
        self
    }

    /// Publish transfer progress to `reporter`
    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    /// Set the redirect policy
    pub fn with_redirect_policy(mut self, policy: RedirectPolicy) -> Self {
        self.redirect_policy = policy;
        self
    }

    /// Set the maximum redirect depth
    pub fn with_max_redirect_depth(mut self, depth: u8) -> Self {
        self.max_redirect_depth = Some(depth);
        self
    }

    /// Deliver the outcome as an event
    pub fn with_event_target(mut self, target: EventTarget) -> Self {
        self.event_target = Some(target);
        self
    }

    /// Attach free-form user info
    pub fn with_user_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_info.insert(key.into(), value.into());
        self
    }

    // Accessors

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Identifier of the first request in this redirect/resume chain
    pub fn lineage(&self) -> RequestId {
        self.lineage
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The URL actually requested. Always the last redirect history entry.
    pub fn effective_url(&self) -> &Url {
        self.history.last().unwrap_or(&self.url)
    }

    /// Visited URLs, starting with the original
    pub fn redirect_history(&self) -> &[Url] {
        &self.history
    }

    /// Number of redirects followed so far
    pub fn redirect_count(&self) -> usize {
        self.history.len().saturating_sub(1)
    }

    pub fn headers(&self) -> &HeaderFields {
        &self.headers
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    pub fn body_source(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    pub fn priority(&self) -> f32 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    /// Whether a priority was set explicitly
    pub fn has_priority(&self) -> bool {
        self.priority.is_some()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn earliest_begin(&self) -> Option<SystemTime> {
        self.earliest_begin
    }

    pub fn required_signals(&self) -> &BTreeSet<String> {
        &self.required_signals
    }

    pub fn required_cellular_switch(&self) -> Option<&str> {
        self.required_cellular_switch.as_deref()
    }

    pub fn is_download(&self) -> bool {
        self.download_request
    }

    pub fn downloaded_file(&self) -> Option<&Path> {
        self.downloaded_file.as_deref()
    }

    pub fn avoids_cellular(&self) -> bool {
        self.avoid_cellular
    }

    pub fn is_auto_resume(&self) -> bool {
        self.auto_resume
    }

    pub fn auto_resume_info(&self) -> Option<&ResumeInfo> {
        self.auto_resume_info.as_ref()
    }

    pub fn is_non_critical(&self) -> bool {
        self.non_critical
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn skips_authorization(&self) -> bool {
        self.skip_authorization
    }

    pub fn forces_certificate_decision(&self) -> bool {
        self.force_certificate_decision_delegation
    }

    pub fn certificate_decision_handler(&self) -> Option<&RequestDecisionHandler> {
        self.certificate_decision_handler.as_ref()
    }

    pub fn progress(&self) -> Option<&ProgressReporter> {
        self.progress.as_ref()
    }

    pub fn redirect_policy(&self) -> RedirectPolicy {
        self.redirect_policy
    }

    pub fn max_redirect_depth(&self) -> Option<u8> {
        self.max_redirect_depth
    }

    pub fn event_target(&self) -> Option<&EventTarget> {
        self.event_target.as_ref()
    }

    pub fn user_info(&self) -> &BTreeMap<String, String> {
        &self.user_info
    }

    // Mutation

    /// Replace the target URL and reset the redirect history
    pub fn set_url(&mut self, url: Url) {
        self.history = vec![url.clone()];
        self.url = url;
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    pub fn add_headers<I, K, V>(&mut self, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers.extend(fields);
    }

    /// Value of a parameter
    pub fn parameter_value(&self, key: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a parameter, replacing any previous value
    pub fn set_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.parameters.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.parameters.push((key, value)),
        }
    }

    /// Set a parameter from a list of values joined by `separator`
    pub fn set_parameter_values<I, F, T>(&mut self, key: impl Into<String>, values: I, separator: &str, apply: F)
    where
        I: IntoIterator<Item = T>,
        F: Fn(T) -> String,
    {
        let joined = values.into_iter().map(apply).collect::<Vec<_>>().join(separator);
        self.set_parameter(key, joined);
    }

    pub fn add_parameters<I, K, V>(&mut self, parameters: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in parameters {
            self.set_parameter(k, v);
        }
    }

    /// Use in-memory body data. Clears any body file.
    pub fn set_body_data(&mut self, data: Vec<u8>) {
        self.body = Some(Body::Data(data));
    }

    /// Stream the body from a file. Clears any body data.
    pub fn set_body_file(&mut self, path: impl Into<PathBuf>) {
        self.body = Some(Body::File(path.into()));
    }

    pub fn clear_body(&mut self) {
        self.body = None;
    }

    pub fn set_priority(&mut self, priority: f32) {
        self.priority = Some(priority);
    }

    pub fn set_auto_resume_info(&mut self, info: Option<ResumeInfo>) {
        self.auto_resume_info = info;
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Append a followed redirect target to the history
    pub(crate) fn record_redirect(&mut self, target: Url) {
        self.history.push(target);
    }

    // Scheduling support

    /// Check the request is well formed enough to schedule
    pub fn validate(&self) -> Result<()> {
        if !self.priority().is_finite() {
            return Err(StratusError::Admission(format!(
                "priority must be finite, got {}",
                self.priority()
            )));
        }
        if self.effective_url().host_str().is_none() {
            return Err(StratusError::Admission(format!(
                "URL {} has no host",
                self.effective_url()
            )));
        }
        if matches!(self.group_id.as_deref(), Some("")) {
            return Err(StratusError::Admission("empty group identifier".into()));
        }
        Ok(())
    }

    /// Stamp identification headers right before scheduling begins
    pub fn prepare_for_scheduling(&mut self, user_agent: Option<&str>) {
        self.headers.set(names::REQUEST_ID, self.id.to_string());
        if let Some(agent) = user_agent
            && !self.headers.contains(names::USER_AGENT)
        {
            self.headers.set(names::USER_AGENT, agent);
        }
    }

    /// Give the request a new identity for re-scheduling, keeping the old one
    /// in `Original-Request-ID`
    pub fn scrub_for_rescheduling(&mut self) {
        let previous = self.id;
        self.id = RequestId::generate();
        self.headers
            .set(names::ORIGINAL_REQUEST_ID, previous.to_string());
        self.headers.set(names::REQUEST_ID, self.id.to_string());
    }

    /// Effective URL with query parameters applied
    pub fn generate_url(&self) -> Url {
        let mut url = self.effective_url().clone();
        if !self.parameters.is_empty() && !self.uses_form_body() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &self.parameters {
                pairs.append_pair(k, v);
            }
        }
        url
    }

    fn uses_form_body(&self) -> bool {
        self.method.sends_parameters_in_body() && !self.parameters.is_empty()
    }

    /// Body to send. Form-encoded parameters take precedence for POST/PUT/PATCH.
    pub fn generate_body(&self) -> Option<Body> {
        if self.uses_form_body() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.parameters.iter())
                .finish();
            return Some(Body::Data(encoded.into_bytes()));
        }
        self.body.clone()
    }

    /// Content type implied by the generated body, if any
    pub fn generated_content_type(&self) -> Option<&'static str> {
        self.uses_form_body()
            .then_some("application/x-www-form-urlencoded")
    }

    /// Human-readable description for logs. Credentials are redacted.
    pub fn description(&self) -> String {
        let body = match &self.body {
            Some(Body::Data(data)) => format!("{} bytes", data.len()),
            Some(Body::File(path)) => format!("file {}", path.display()),
            None => "none".to_string(),
        };
        format!(
            "{} {} [{}]\n{}\nbody: {}",
            self.method,
            self.generate_url(),
            self.id,
            self.headers.formatted(),
            body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_scheme() {
        assert!(matches!(
            Request::get("ftp://example.com/file"),
            Err(StratusError::Admission(_))
        ));
        assert!(Request::get("not a url").is_err());
    }

    #[test]
    fn test_method_round_trip() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().ok(), Some(method));
        }
        assert_eq!("propfind".parse::<Method>().ok(), Some(Method::Propfind));
        assert!("BREW".parse::<Method>().is_err());
    }

    #[test]
    fn test_body_data_and_file_are_exclusive() {
        let mut request = Request::post("https://example.com/upload")
            .unwrap()
            .body(b"abc".to_vec());
        request.set_body_file("/tmp/upload.bin");
        assert_eq!(
            request.body_source(),
            Some(&Body::File(PathBuf::from("/tmp/upload.bin")))
        );
        request.set_body_data(vec![1]);
        assert_eq!(request.body_source(), Some(&Body::Data(vec![1])));
    }

    #[test]
    fn test_effective_url_tracks_history() {
        let mut request = Request::get("https://a.example.com/x").unwrap();
        assert_eq!(request.effective_url(), request.url());
        assert_eq!(request.redirect_history().len(), 1);

        let target = Url::parse("https://b.example.com/y").unwrap();
        request.record_redirect(target.clone());
        assert_eq!(request.effective_url(), &target);
        assert_eq!(request.redirect_history().last(), Some(&target));
        assert_eq!(request.redirect_count(), 1);
    }

    #[test]
    fn test_scrub_regenerates_identifier() {
        let mut request = Request::get("https://example.com/").unwrap();
        let original = request.id();
        request.scrub_for_rescheduling();

        assert_ne!(request.id(), original);
        assert_eq!(request.lineage(), original);
        assert_eq!(
            request.header_value(names::ORIGINAL_REQUEST_ID),
            Some(original.to_string().as_str())
        );
        assert_eq!(
            request.header_value(names::REQUEST_ID),
            Some(request.id().to_string().as_str())
        );
    }

    #[test]
    fn test_parameters_in_query_for_get() {
        let request = Request::get("https://example.com/search")
            .unwrap()
            .parameter("q", "a b")
            .parameter("limit", "10");
        assert_eq!(
            request.generate_url().as_str(),
            "https://example.com/search?q=a+b&limit=10"
        );
        assert_eq!(request.generate_body(), None);
    }

    #[test]
    fn test_parameters_in_body_for_post() {
        let request = Request::post("https://example.com/ocs/shares")
            .unwrap()
            .parameter("path", "/Photos")
            .parameter("shareType", "3");
        assert_eq!(request.generate_url().query(), None);
        assert_eq!(
            request.generate_body(),
            Some(Body::Data(b"path=%2FPhotos&shareType=3".to_vec()))
        );
        assert_eq!(
            request.generated_content_type(),
            Some("application/x-www-form-urlencoded")
        );
    }

    #[test]
    fn test_parameter_values_joined() {
        let mut request = Request::get("https://example.com/").unwrap();
        request.set_parameter_values("ids", [1, 2, 3], ",", |v| v.to_string());
        assert_eq!(request.parameter_value("ids"), Some("1,2,3"));
    }

    #[test]
    fn test_validate_rejects_nan_priority() {
        let request = Request::get("https://example.com/")
            .unwrap()
            .with_priority(f32::NAN);
        assert!(matches!(request.validate(), Err(StratusError::Admission(_))));
    }

    #[test]
    fn test_prepare_keeps_explicit_user_agent() {
        let mut request = Request::get("https://example.com/")
            .unwrap()
            .header("user-agent", "custom/1.0");
        request.prepare_for_scheduling(Some("stratus/0.1"));
        assert_eq!(request.header_value(names::USER_AGENT), Some("custom/1.0"));
        assert!(request.headers().contains(names::REQUEST_ID));
    }

    #[test]
    fn test_description_redacts_credentials() {
        let request = Request::get("https://example.com/")
            .unwrap()
            .header(names::AUTHORIZATION, "Basic c2VjcmV0");
        assert!(!request.description().contains("c2VjcmV0"));
    }

    #[test]
    fn test_handler_and_progress_survive_rescheduling() {
        let (reporter, _observer) = ProgressReporter::channel();
        let mut request = Request::get("https://example.com/")
            .unwrap()
            .with_certificate_decision_handler(std::sync::Arc::new(|_: &crate::security::Certificate, _: &str| true))
            .with_progress(reporter);
        request.scrub_for_rescheduling();
        let copy = request.clone();
        assert!(copy.certificate_decision_handler().is_some());
        assert!(copy.progress().is_some());
    }
}
