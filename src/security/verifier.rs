//! TLS certificate verification routed through the trust gate
//!
//! Wraps the rustls WebPKI verifier: chain problems are recorded as issues
//! rather than failing the handshake outright, then a resolver decides.
//! Shared clients resolve through the [`TrustGate`]; single-attempt clients
//! resolve through that attempt's own certificate check.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{Resumption, WebPkiServerVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};

use super::trust::{Certificate, TrustGate, ValidationStatus};
use crate::utils::{self, Result, StratusError};

/// Decides whether a certificate presented during a handshake is trusted
pub type CertificateResolver = Arc<dyn Fn(&Certificate, &str) -> Result<()> + Send + Sync>;

/// Resolver backed by the shared gate, without forcing a decision
pub fn gate_resolver(gate: Arc<TrustGate>) -> CertificateResolver {
    Arc::new(move |certificate: &Certificate, host: &str| gate.resolve(certificate, host, false))
}

#[derive(Debug, Clone)]
struct Rejection {
    fingerprint: String,
    at: Instant,
}

/// Certificates seen during handshakes, per host
#[derive(Debug, Default)]
pub struct PeerCertificates {
    seen: Mutex<HashMap<String, Certificate>>,
    rejected: Mutex<HashMap<String, Rejection>>,
}

impl PeerCertificates {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, host: &str, certificate: Certificate) {
        utils::lock(&self.seen).insert(host.to_ascii_lowercase(), certificate);
    }

    fn record_rejection(&self, host: &str, fingerprint: &str) {
        utils::lock(&self.rejected).insert(
            host.to_ascii_lowercase(),
            Rejection {
                fingerprint: fingerprint.to_string(),
                at: Instant::now(),
            },
        );
    }

    fn clear_rejection(&self, host: &str) {
        utils::lock(&self.rejected).remove(&host.to_ascii_lowercase());
    }

    /// Certificate with validation status for `der` as last seen on `host`
    pub fn certificate_for(&self, host: &str, der: &[u8]) -> Certificate {
        match utils::lock(&self.seen).get(&host.to_ascii_lowercase()) {
            Some(cert) if cert.der() == der => cert.clone(),
            _ => Certificate::from_der(host, der.to_vec(), ValidationStatus::Valid),
        }
    }

    /// Trust error for `host` from a handshake rejected at or after `since`.
    ///
    /// Entries stay until the host next passes verification, so every
    /// attempt that overlapped the rejection reports it.
    pub fn rejection_since(&self, host: &str, since: Instant) -> Option<StratusError> {
        utils::lock(&self.rejected)
            .get(&host.to_ascii_lowercase())
            .filter(|rejection| rejection.at >= since)
            .map(|rejection| StratusError::Trust {
                host: host.to_string(),
                fingerprint: rejection.fingerprint.clone(),
            })
    }
}

/// rustls verifier consulting a certificate resolver
pub struct GateCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    resolver: CertificateResolver,
    peers: Arc<PeerCertificates>,
}

impl GateCertVerifier {
    pub fn new(inner: Arc<WebPkiServerVerifier>, resolver: CertificateResolver, peers: Arc<PeerCertificates>) -> Self {
        Self { inner, resolver, peers }
    }
}

impl fmt::Debug for GateCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateCertVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for GateCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        let host = server_name.to_str().into_owned();
        let status = match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_) => ValidationStatus::Valid,
            Err(err) => {
                log::debug!("[trust] {} failed validation: {}", host, err);
                ValidationStatus::HasIssues(vec![err.to_string()])
            }
        };
        let certificate = Certificate::from_der(host.as_str(), end_entity.to_vec(), status);
        self.peers.record(&host, certificate.clone());

        match (self.resolver)(&certificate, &host) {
            Ok(()) => {
                self.peers.clear_rejection(&host);
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => {
                self.peers.record_rejection(&host, certificate.fingerprint());
                Err(TlsError::General(err.to_string()))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, TlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Root store from the platform's native certificates
pub fn native_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let loaded = rustls_native_certs::load_native_certs();
    for err in &loaded.errors {
        log::warn!("[trust] failed to load a native certificate: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    log::debug!("[trust] loaded {} native roots ({} ignored)", added, ignored);
    roots
}

/// WebPKI verifier over `roots`; fails when the store is empty
pub fn webpki_verifier(roots: RootCertStore) -> Result<Arc<WebPkiServerVerifier>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| StratusError::Config(format!("certificate verifier: {}", e)))
}

/// Client TLS configuration whose certificate checks go through `resolver`.
///
/// A `single_attempt` configuration never resumes a session, so every
/// handshake reaches the verifier.
pub fn client_config(
    inner: Arc<WebPkiServerVerifier>,
    resolver: CertificateResolver,
    peers: Arc<PeerCertificates>,
    single_attempt: bool,
) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = GateCertVerifier::new(inner, resolver, peers);

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| StratusError::Config(format!("TLS protocol versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    if single_attempt {
        config.resumption = Resumption::disabled();
    }
    Ok(config)
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Throwaway certificates: an unrelated root and a self-signed server
    //! certificate for 127.0.0.1 with its PKCS#8 key

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use rustls::RootCertStore;
    use rustls::pki_types::CertificateDer;

    const ROOT: &str = "MIIBjjCCATWgAwIBAgIUJkZ8uIUKWmTGTyuhGX9tSn9cD+cwCgYIKoZIzj0EAwIwHDEaMBgGA1UEAwwRU3RyYXR1cyBUZXN0IFJvb3QwIBcNMjYxMDE5MDQ1NjQ0WhgPMjEyNjA5MjUwNDU2NDRaMBwxGjAYBgNVBAMMEVN0cmF0dXMgVGVzdCBSb290MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAE52hGTZhqTo51NpBAD9aRTiZCnl8IE32HnDhIBS3l2UDVlJJl3kFCXL3ERDTYWhDK4d1RLtE6KPDhhslpOfk47aNTMFEwHQYDVR0OBBYEFEdLLDsX2vYP0ce7InNSHTpVsQQ4MB8GA1UdIwQYMBaAFEdLLDsX2vYP0ce7InNSHTpVsQQ4MA8GA1UdEwEB/wQFMAMBAf8wCgYIKoZIzj0EAwIDRwAwRAIgOa4r4o3bMcOiyocKTSeTWQl4pahcd0JywC3cc2wjjiUCIAhk1AA/HhPL3YIxndrxirSkUABa4EF5KUECJB2mZTTf";
    const SERVER: &str = "MIIBizCCATGgAwIBAgIUaOQKRtV6lYqKpKcTze1LlyGJ1ZswCgYIKoZIzj0EAwIwFDESMBAGA1UEAwwJMTI3LjAuMC4xMCAXDTI2MTAxOTA0NTY0NVoYDzIxMjYwOTI1MDQ1NjQ1WjAUMRIwEAYDVQQDDAkxMjcuMC4wLjEwWTATBgcqhkjOPQIBBggqhkjOPQMBBwNCAARnF/aQNDu9bD30m+YL3kE32vuNzmncxyoClmH/MTQGjfKrZZ076UOqMZ0jdbQOfVMZkZak7SPN5EF17+Z4HwyEo18wXTAJBgNVHRMEAjAAMA8GA1UdEQQIMAaHBH8AAAEwCwYDVR0PBAQDAgeAMBMGA1UdJQQMMAoGCCsGAQUFBwMBMB0GA1UdDgQWBBQg3WNDMnDgiRJSKSzvDwVWn2LQ9DAKBggqhkjOPQQDAgNIADBFAiAJoxpVUHHN0PviWaXc+f7tAL899p9IYMxN8tN22fT1aAIhANOWI4cpkIaSDIcbINqBtWXAZkJmxMuTCvKK5FqdQGx7";
    const SERVER_KEY: &str = "MIGHAgEAMBMGByqGSM49AgEGCCqGSM49AwEHBG0wawIBAQQgPJ03nm9No93bbHsN2hqK4+nzkkjPxFBv6zoAAe+aGF2hRANCAARnF/aQNDu9bD30m+YL3kE32vuNzmncxyoClmH/MTQGjfKrZZ076UOqMZ0jdbQOfVMZkZak7SPN5EF17+Z4HwyE";

    pub fn server_der() -> Vec<u8> {
        STANDARD.decode(SERVER).unwrap()
    }

    pub fn server_key_der() -> Vec<u8> {
        STANDARD.decode(SERVER_KEY).unwrap()
    }

    /// Root store that does not vouch for the server certificate
    pub fn roots() -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(CertificateDer::from(STANDARD.decode(ROOT).unwrap())).unwrap();
        roots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOST: &str = "127.0.0.1";

    fn counting_gate(answer: bool) -> (Arc<TrustGate>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let gate = TrustGate::with_decision_handler(Arc::new(move |_: &Certificate, _: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            answer
        }));
        (Arc::new(gate), calls)
    }

    fn verifier(resolver: CertificateResolver) -> (GateCertVerifier, Arc<PeerCertificates>) {
        let peers = Arc::new(PeerCertificates::new());
        let inner = webpki_verifier(fixtures::roots()).unwrap();
        (GateCertVerifier::new(inner, resolver, Arc::clone(&peers)), peers)
    }

    fn handshake(verifier: &GateCertVerifier) -> std::result::Result<ServerCertVerified, TlsError> {
        let der = CertificateDer::from(fixtures::server_der());
        let name = ServerName::try_from(HOST).unwrap();
        verifier.verify_server_cert(&der, &[], &name, &[], UnixTime::now())
    }

    #[test]
    fn test_unseen_certificate_defaults_to_valid() {
        let peers = PeerCertificates::new();
        let cert = peers.certificate_for("h.example.com", b"der");
        assert_eq!(cert.status(), &ValidationStatus::Valid);
    }

    #[test]
    fn test_seen_certificate_keeps_issues() {
        let peers = PeerCertificates::new();
        let status = ValidationStatus::HasIssues(vec!["expired".into()]);
        peers.record("H.example.com", Certificate::from_der("h.example.com", b"der".to_vec(), status.clone()));

        assert_eq!(peers.certificate_for("h.example.com", b"der").status(), &status);
        // Different certificate on the same host is not confused with the recorded one
        assert_eq!(
            peers.certificate_for("h.example.com", b"other").status(),
            &ValidationStatus::Valid
        );
    }

    #[test]
    fn test_rejection_visible_to_every_overlapping_attempt() {
        let peers = PeerCertificates::new();
        let first = Instant::now();
        let second = Instant::now();
        peers.record_rejection("h.example.com", "aa:bb");

        assert!(matches!(
            peers.rejection_since("h.example.com", first),
            Some(StratusError::Trust { .. })
        ));
        assert!(peers.rejection_since("H.example.com", second).is_some());
        // Attempts started after the rejection do not inherit it
        assert!(peers.rejection_since("h.example.com", Instant::now()).is_none());

        peers.clear_rejection("h.example.com");
        assert!(peers.rejection_since("h.example.com", first).is_none());
    }

    #[test]
    fn test_empty_root_store_is_config_error() {
        assert!(matches!(
            webpki_verifier(RootCertStore::empty()),
            Err(StratusError::Config(_))
        ));
    }

    #[test]
    fn test_approved_certificate_keeps_issues_and_is_cached() {
        let (gate, calls) = counting_gate(true);
        let (verifier, peers) = verifier(gate_resolver(Arc::clone(&gate)));

        assert!(handshake(&verifier).is_ok());
        assert!(handshake(&verifier).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let seen = peers.certificate_for(HOST, &fixtures::server_der());
        assert!(seen.has_issues());
        assert!(gate.is_approved(HOST, seen.fingerprint()));
    }

    #[test]
    fn test_declined_certificate_fails_handshake() {
        let (gate, calls) = counting_gate(false);
        let (verifier, peers) = verifier(gate_resolver(gate));
        let started = Instant::now();

        assert!(matches!(handshake(&verifier), Err(TlsError::General(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Two attempts that raced the same handshake both see the rejection
        assert!(peers.rejection_since(HOST, started).is_some());
        assert!(peers.rejection_since(HOST, started).is_some());
    }

    #[test]
    fn test_forced_resolver_asks_on_every_handshake() {
        let (gate, calls) = counting_gate(true);
        let forced = Arc::clone(&gate);
        let (verifier, _) = verifier(Arc::new(move |certificate: &Certificate, host: &str| {
            forced.resolve(certificate, host, true)
        }));

        assert!(handshake(&verifier).is_ok());
        assert!(handshake(&verifier).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_single_attempt_config_disables_resumption() {
        let (gate, _) = counting_gate(true);
        let inner = webpki_verifier(fixtures::roots()).unwrap();
        let peers = Arc::new(PeerCertificates::new());
        let shared = client_config(Arc::clone(&inner), gate_resolver(Arc::clone(&gate)), Arc::clone(&peers), false).unwrap();
        let single = client_config(inner, gate_resolver(gate), peers, true).unwrap();
        assert_eq!(format!("{:?}", single.resumption), format!("{:?}", Resumption::disabled()));
        assert_ne!(format!("{:?}", shared.resumption), format!("{:?}", single.resumption));
    }
}
