//! Security module for Stratus
//!
//! Implements server certificate trust:
//! - Approval cache keyed by host and fingerprint
//! - Decision delegation to an external or per-request handler
//! - rustls verifier that routes handshakes through the gate

mod trust;
pub mod verifier;

pub use trust::{
    Certificate, CertificateDecision, DecisionHandler, RequestDecisionHandler, TrustGate, TrustVerdict,
    ValidationStatus,
};
pub use verifier::{CertificateResolver, GateCertVerifier, PeerCertificates};
