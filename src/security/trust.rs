//! Certificate trust decisions
//!
//! The gate keeps an in-memory cache of user approvals keyed by host and
//! SHA-256 fingerprint. Reads are concurrent; decisions are taken one at a
//! time so two connections presenting the same certificate prompt once.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use ring::digest;

use crate::utils::{self, Result, StratusError};

/// Outcome of validating a certificate chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationStatus {
    /// Chain validated against the trust roots
    Valid,
    /// Validation found problems (descriptions from the verifier)
    HasIssues(Vec<String>),
    /// Explicitly approved by the user
    UserApproved,
}

/// A peer certificate as seen by the trust gate
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    host: String,
    der: Vec<u8>,
    fingerprint: String,
    status: ValidationStatus,
}

impl Certificate {
    /// Wrap DER bytes, computing the SHA-256 fingerprint
    pub fn from_der(host: impl Into<String>, der: impl Into<Vec<u8>>, status: ValidationStatus) -> Self {
        let der = der.into();
        let fingerprint = fingerprint(&der);
        Self {
            host: host.into(),
            der,
            fingerprint,
            status,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Lowercase hex SHA-256 of the DER encoding, colon separated
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn status(&self) -> &ValidationStatus {
        &self.status
    }

    pub fn has_issues(&self) -> bool {
        matches!(self.status, ValidationStatus::HasIssues(_))
    }

    pub fn issues(&self) -> &[String] {
        match &self.status {
            ValidationStatus::HasIssues(issues) => issues,
            _ => &[],
        }
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("host", &self.host)
            .field("fingerprint", &self.fingerprint)
            .field("status", &self.status)
            .finish()
    }
}

fn fingerprint(der: &[u8]) -> String {
    digest::digest(&digest::SHA256, der)
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Gate verdict for a presented certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    Accept,
    Reject,
    NeedsDecision,
}

/// Cached user decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDecision {
    pub host: String,
    pub fingerprint: String,
    pub status: ValidationStatus,
    pub decided_at: SystemTime,
}

/// External decision callback: `(certificate, host) -> approved`
pub type DecisionHandler = Arc<dyn Fn(&Certificate, &str) -> bool + Send + Sync>;

/// Decision handler attached to a single request.
///
/// Takes precedence over the gate's handler; its approvals are not cached.
#[derive(Clone)]
pub struct RequestDecisionHandler(DecisionHandler);

impl RequestDecisionHandler {
    pub fn new(handler: DecisionHandler) -> Self {
        Self(handler)
    }

    pub fn handler(&self) -> &DecisionHandler {
        &self.0
    }
}

impl fmt::Debug for RequestDecisionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestDecisionHandler(..)")
    }
}

type ApprovalKey = (String, String);

/// Process-wide certificate approval cache and policy
#[derive(Default)]
pub struct TrustGate {
    approvals: RwLock<HashMap<ApprovalKey, CertificateDecision>>,
    handler: RwLock<Option<DecisionHandler>>,
    deciding: Mutex<()>,
}

impl TrustGate {
    /// Gate with no decision handler: certificates with issues are rejected
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decision_handler(handler: DecisionHandler) -> Self {
        let gate = Self::new();
        gate.set_decision_handler(Some(handler));
        gate
    }

    pub fn set_decision_handler(&self, handler: Option<DecisionHandler>) {
        *utils::write(&self.handler) = handler;
    }

    fn key(host: &str, fingerprint: &str) -> ApprovalKey {
        (host.to_ascii_lowercase(), fingerprint.to_string())
    }

    /// Classify a certificate presented by `host`
    pub fn evaluate(&self, certificate: &Certificate, host: &str, force: bool) -> TrustVerdict {
        let has_handler = utils::read(&self.handler).is_some();
        self.verdict(certificate, host, force, has_handler)
    }

    fn verdict(&self, certificate: &Certificate, host: &str, force: bool, has_handler: bool) -> TrustVerdict {
        if !force {
            match certificate.status() {
                ValidationStatus::Valid | ValidationStatus::UserApproved => return TrustVerdict::Accept,
                ValidationStatus::HasIssues(_) if self.is_approved(host, certificate.fingerprint()) => {
                    return TrustVerdict::Accept;
                }
                ValidationStatus::HasIssues(_) => {}
            }
        }
        if has_handler {
            TrustVerdict::NeedsDecision
        } else {
            TrustVerdict::Reject
        }
    }

    /// Evaluate and, when needed, consult the decision handler.
    ///
    /// Returns `Trust` when the certificate is rejected.
    pub fn resolve(&self, certificate: &Certificate, host: &str, force: bool) -> Result<()> {
        self.resolve_with(certificate, host, force, None)
    }

    /// Like [`resolve`](Self::resolve), asking `handler` instead of the
    /// gate's own handler when one is given
    pub fn resolve_with(
        &self,
        certificate: &Certificate,
        host: &str,
        force: bool,
        handler: Option<&RequestDecisionHandler>,
    ) -> Result<()> {
        if let Some(handler) = handler {
            return match self.verdict(certificate, host, force, true) {
                TrustVerdict::Accept => Ok(()),
                _ => self.ask(handler.handler(), certificate, host, false),
            };
        }
        match self.evaluate(certificate, host, force) {
            TrustVerdict::Accept => return Ok(()),
            TrustVerdict::Reject => return Err(self.rejection(certificate, host)),
            TrustVerdict::NeedsDecision => {}
        }

        let _deciding = utils::lock(&self.deciding);
        // Another connection may have obtained approval while we waited
        if !force && self.evaluate(certificate, host, false) == TrustVerdict::Accept {
            return Ok(());
        }
        let Some(handler) = utils::read(&self.handler).clone() else {
            return Err(self.rejection(certificate, host));
        };
        self.ask(&handler, certificate, host, true)
    }

    fn ask(&self, handler: &DecisionHandler, certificate: &Certificate, host: &str, remember: bool) -> Result<()> {
        log::info!(
            "[trust] asking for a decision on {} ({}, issues: {:?})",
            host,
            certificate.fingerprint(),
            certificate.issues()
        );
        if handler(certificate, host) {
            if remember && certificate.has_issues() {
                self.approve(host, certificate);
            }
            Ok(())
        } else {
            Err(self.rejection(certificate, host))
        }
    }

    fn rejection(&self, certificate: &Certificate, host: &str) -> StratusError {
        log::warn!(
            "[trust] rejected certificate {} for {}",
            certificate.fingerprint(),
            host
        );
        StratusError::Trust {
            host: host.to_string(),
            fingerprint: certificate.fingerprint().to_string(),
        }
    }

    /// Record a user approval for `certificate` on `host`
    pub fn approve(&self, host: &str, certificate: &Certificate) {
        let decision = CertificateDecision {
            host: host.to_ascii_lowercase(),
            fingerprint: certificate.fingerprint().to_string(),
            status: certificate.status().clone(),
            decided_at: SystemTime::now(),
        };
        log::debug!("[trust] approved {} for {}", decision.fingerprint, host);
        utils::write(&self.approvals).insert(Self::key(host, certificate.fingerprint()), decision);
    }

    /// Forget a single approval
    pub fn revoke(&self, host: &str, fingerprint: &str) -> bool {
        utils::write(&self.approvals)
            .remove(&Self::key(host, fingerprint))
            .is_some()
    }

    /// Forget every approval
    pub fn flush(&self) {
        utils::write(&self.approvals).clear();
    }

    pub fn lookup(&self, host: &str, fingerprint: &str) -> Option<CertificateDecision> {
        utils::read(&self.approvals)
            .get(&Self::key(host, fingerprint))
            .cloned()
    }

    pub fn is_approved(&self, host: &str, fingerprint: &str) -> bool {
        utils::read(&self.approvals).contains_key(&Self::key(host, fingerprint))
    }

    pub fn approval_count(&self) -> usize {
        utils::read(&self.approvals).len()
    }
}

impl fmt::Debug for TrustGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustGate")
            .field("approvals", &self.approval_count())
            .field("has_handler", &utils::read(&self.handler).is_some())
            .finish()
    }
}
