//! Transport seam
//!
//! The queue drives a [`Transport`] for the actual network I/O. Failures
//! come back as a [`TransportFailure`] so resume metadata and any partial
//! response travel with the error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use super::request::Request;
use super::response::Response;
use super::resume::ResumeInfo;
use crate::security::{Certificate, RequestDecisionHandler, TrustGate};
use crate::utils::{self, Result, StratusError};

/// A failed transport attempt
#[derive(Debug, Clone)]
pub struct TransportFailure {
    pub error: StratusError,
    /// Metadata to resume a partial transfer
    pub resume_info: Option<ResumeInfo>,
    /// Whatever response had been received before the failure
    pub response: Option<Response>,
}

impl TransportFailure {
    pub fn new(error: impl Into<StratusError>) -> Self {
        Self {
            error: error.into(),
            resume_info: None,
            response: None,
        }
    }

    pub fn with_resume_info(mut self, info: ResumeInfo) -> Self {
        self.resume_info = Some(info);
        self
    }

    pub fn with_response(mut self, response: Response) -> Self {
        self.response = Some(response);
        self
    }
}

impl From<StratusError> for TransportFailure {
    fn from(error: StratusError) -> Self {
        Self::new(error)
    }
}

pub type TransportResult = std::result::Result<Response, TransportFailure>;

/// Certificate evaluation handed to the transport for one attempt
#[derive(Debug, Clone)]
pub struct CertificateCheck {
    gate: Arc<TrustGate>,
    force: bool,
    handler: Option<RequestDecisionHandler>,
    evaluated: Arc<AtomicBool>,
    rejection: Arc<Mutex<Option<StratusError>>>,
}

impl CertificateCheck {
    pub fn new(gate: Arc<TrustGate>, force: bool) -> Self {
        Self {
            gate,
            force,
            handler: None,
            evaluated: Arc::new(AtomicBool::new(false)),
            rejection: Arc::new(Mutex::new(None)),
        }
    }

    /// Ask `handler` instead of the gate's decision handler
    pub fn with_handler(mut self, handler: Option<RequestDecisionHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Run the gate for `certificate` presented by `host`
    pub fn check(&self, certificate: &Certificate, host: &str) -> Result<()> {
        self.mark_evaluated();
        let result = self
            .gate
            .resolve_with(certificate, host, self.force, self.handler.as_ref());
        if let Err(err) = &result {
            *utils::lock(&self.rejection) = Some(err.clone());
        }
        result
    }

    /// Record that the gate already ran, e.g. during the TLS handshake
    pub fn mark_evaluated(&self) {
        self.evaluated.store(true, Ordering::SeqCst);
    }

    pub fn was_evaluated(&self) -> bool {
        self.evaluated.load(Ordering::SeqCst)
    }

    /// The trust error from this attempt's last rejected check
    pub fn rejection(&self) -> Option<StratusError> {
        utils::lock(&self.rejection).clone()
    }

    /// Whether the decision handler must be consulted even for valid certificates
    pub fn forces_decision(&self) -> bool {
        self.force
    }

    /// Whether a per-request handler makes the decisions
    pub fn has_request_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn gate(&self) -> &Arc<TrustGate> {
        &self.gate
    }
}

/// Per-attempt context
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub certificate_check: CertificateCheck,
}

impl TransportContext {
    pub fn new(certificate_check: CertificateCheck) -> Self {
        Self { certificate_check }
    }
}

/// Executes requests on the network
pub trait Transport: Send + Sync {
    /// Send a fully prepared request.
    ///
    /// Redirects are returned, never followed.
    fn send(&self, request: Request, context: TransportContext) -> BoxFuture<'static, TransportResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::ValidationStatus;
    use crate::utils::NetworkError;

    #[test]
    fn test_check_records_evaluation() {
        let check = CertificateCheck::new(Arc::new(TrustGate::new()), false);
        assert!(!check.was_evaluated());

        let cert = Certificate::from_der("h", b"c".to_vec(), ValidationStatus::Valid);
        assert!(check.check(&cert, "h").is_ok());
        assert!(check.clone().was_evaluated());
    }

    #[test]
    fn test_request_handler_decides_and_rejection_is_kept() {
        let gate = Arc::new(TrustGate::with_decision_handler(Arc::new(|_: &Certificate, _: &str| true)));
        let check = CertificateCheck::new(gate, false)
            .with_handler(Some(RequestDecisionHandler::new(Arc::new(|_: &Certificate, _: &str| false))));
        assert!(check.has_request_handler());

        let cert = Certificate::from_der("h", b"c".to_vec(), ValidationStatus::HasIssues(vec!["expired".into()]));
        assert!(check.check(&cert, "h").is_err());
        assert!(matches!(check.clone().rejection(), Some(StratusError::Trust { .. })));
    }

    #[test]
    fn test_failure_carries_resume_info() {
        let failure = TransportFailure::new(NetworkError::Timeout)
            .with_resume_info(ResumeInfo::partial(12, None));
        assert!(failure.error.is_connectivity());
        assert_eq!(failure.resume_info.and_then(|i| i.bytes_received()), Some(12));
    }
}
