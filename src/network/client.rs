//! HTTP client implementation
//!
//! [`ReqwestTransport`] runs requests on `reqwest` with a rustls
//! configuration whose certificate verifier consults the trust gate during
//! the handshake. Ordinary requests share one pooled client. Requests that
//! force certificate delegation or carry their own decision handler get a
//! client of their own with no pooling and no session resumption, so their
//! handshake always reaches the verifier.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use rustls::client::WebPkiServerVerifier;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::headers::{HeaderFields, names};
use super::progress::TransferProgress;
use super::request::{Body, Request};
use super::response::{Response, ResponseBody};
use super::resume::ResumeInfo;
use super::transport::{CertificateCheck, Transport, TransportContext, TransportFailure, TransportResult};
use crate::config::TransportConfig;
use crate::security::{Certificate, TrustGate};
use crate::security::verifier::{self, CertificateResolver, PeerCertificates};
use crate::utils::{NetworkError, Result, StratusError};

/// Production transport on reqwest + rustls
pub struct ReqwestTransport {
    config: TransportConfig,
    webpki: Arc<WebPkiServerVerifier>,
    standard: reqwest::Client,
    peers: Arc<PeerCertificates>,
}

impl ReqwestTransport {
    /// Create a transport whose TLS checks go through `gate`
    pub fn new(config: &TransportConfig, gate: Arc<TrustGate>) -> Result<Self> {
        let roots = if config.use_native_roots {
            verifier::native_roots()
        } else {
            rustls::RootCertStore::empty()
        };
        Self::with_roots(config, gate, roots)
    }

    /// Create a transport validating chains against `roots`
    pub fn with_roots(config: &TransportConfig, gate: Arc<TrustGate>, roots: rustls::RootCertStore) -> Result<Self> {
        let peers = Arc::new(PeerCertificates::new());
        let webpki = verifier::webpki_verifier(roots)?;
        let tls = verifier::client_config(
            Arc::clone(&webpki),
            verifier::gate_resolver(gate),
            Arc::clone(&peers),
            false,
        )?;
        Ok(Self {
            standard: Self::client(config, tls, true)?,
            config: config.clone(),
            webpki,
            peers,
        })
    }

    fn client(config: &TransportConfig, tls: rustls::ClientConfig, pooled: bool) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .tls_info(true)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(config.connect_timeout());
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        if !pooled {
            builder = builder.pool_max_idle_per_host(0);
        }
        builder
            .build()
            .map_err(|e| StratusError::Config(format!("HTTP client: {}", e)))
    }

    /// Client for one attempt whose handshake reports to `check`
    fn single_attempt_client(&self, check: &CertificateCheck) -> Result<reqwest::Client> {
        let check = check.clone();
        let resolver: CertificateResolver =
            Arc::new(move |certificate: &Certificate, host: &str| check.check(certificate, host));
        let tls = verifier::client_config(Arc::clone(&self.webpki), resolver, Arc::clone(&self.peers), true)?;
        Self::client(&self.config, tls, false)
    }

    fn client_for(&self, check: &CertificateCheck) -> Result<reqwest::Client> {
        if check.forces_decision() || check.has_request_handler() {
            self.single_attempt_client(check)
        } else {
            Ok(self.standard.clone())
        }
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: Request, context: TransportContext) -> BoxFuture<'static, TransportResult> {
        let client = self.client_for(&context.certificate_check);
        let peers = Arc::clone(&self.peers);
        Box::pin(async move { perform(client?, peers, request, context).await })
    }
}

/// What a failed attempt needs to explain a TLS rejection
struct Attempt<'a> {
    host: &'a str,
    started: Instant,
    peers: &'a PeerCertificates,
    check: &'a CertificateCheck,
}

async fn perform(
    client: reqwest::Client,
    peers: Arc<PeerCertificates>,
    request: Request,
    context: TransportContext,
) -> TransportResult {
    let url = request.generate_url();
    let host = url.host_str().unwrap_or_default().to_string();
    let attempt = Attempt {
        host: &host,
        started: Instant::now(),
        peers: &peers,
        check: &context.certificate_check,
    };
    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .map_err(|e| StratusError::Admission(e.to_string()))?;

    let mut builder = client.request(method, url.clone());
    for (name, value) in request.headers().iter() {
        builder = builder.header(name, value);
    }
    if let Some(content_type) = request.generated_content_type()
        && !request.headers().contains(names::CONTENT_TYPE)
    {
        builder = builder.header(names::CONTENT_TYPE, content_type);
    }
    match request.generate_body() {
        Some(Body::Data(data)) => builder = builder.body(data),
        Some(Body::File(path)) => {
            let data = tokio::fs::read(&path).await.map_err(StratusError::from)?;
            builder = builder.body(data);
        }
        None => {}
    }

    log::debug!("[transport] {} {}", request.method(), url);
    let response = builder
        .send()
        .await
        .map_err(|e| TransportFailure::new(classify(&e, &attempt)))?;

    let status = response.status().as_u16();
    let mut headers = HeaderFields::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers.set(name.as_str(), value);
        }
    }
    // Pooled connections skip the verifier; the queue checks these itself
    let certificate = response
        .extensions()
        .get::<reqwest::tls::TlsInfo>()
        .and_then(|info| info.peer_certificate())
        .map(|der| peers.certificate_for(&host, der));

    let resuming = request.header_value(names::RANGE).is_some();
    if resuming && status == 416 {
        return Err(TransportFailure::new(NetworkError::ResumeRejected(format!(
            "{} refused the requested range",
            host
        ))));
    }

    let body = if request.is_download() && (200..300).contains(&status) {
        let append = resuming && status == 206;
        let entity_tag = headers.get(names::ETAG).map(str::to_string);
        download(response, &request, append, entity_tag, &attempt).await?
    } else {
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportFailure::new(classify(&e, &attempt)))?;
        ResponseBody::Data(bytes.to_vec())
    };

    let mut result = Response::with_headers(status, Vec::new(), headers);
    result.set_body(body);
    result.set_certificate(certificate);
    Ok(result)
}

/// Where a download request's body goes
fn destination(request: &Request) -> PathBuf {
    request.downloaded_file().map(PathBuf::from).unwrap_or_else(|| {
        std::env::temp_dir().join(format!("stratus-{}.download", request.lineage()))
    })
}

async fn download(
    mut response: reqwest::Response,
    request: &Request,
    append: bool,
    entity_tag: Option<String>,
    attempt: &Attempt<'_>,
) -> std::result::Result<ResponseBody, TransportFailure> {
    let path = destination(request);
    let mut file = if append {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
    } else {
        File::create(&path).await
    }
    .map_err(StratusError::from)?;

    let mut received = if append {
        file.metadata().await.map(|m| m.len()).unwrap_or(0)
    } else {
        0
    };
    let expected = response.content_length().map(|length| length + received);
    let report = |received: u64| {
        if let Some(progress) = request.progress() {
            progress.report(TransferProgress::new(received, expected));
        }
    };
    report(received);
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                file.write_all(&chunk).await.map_err(StratusError::from)?;
                received += chunk.len() as u64;
                report(received);
            }
            Ok(None) => break,
            Err(err) => {
                let _ = file.flush().await;
                log::info!(
                    "[transport] download of {} interrupted after {} bytes",
                    attempt.host,
                    received
                );
                return Err(TransportFailure::new(classify(&err, attempt))
                    .with_resume_info(ResumeInfo::partial(received, entity_tag)));
            }
        }
    }
    file.flush().await.map_err(StratusError::from)?;
    log::debug!("[transport] wrote {} bytes to {}", received, path.display());
    Ok(ResponseBody::File(path))
}

/// Map a reqwest failure onto the error taxonomy
fn classify(err: &reqwest::Error, attempt: &Attempt<'_>) -> StratusError {
    if let Some(rejection) = attempt.check.rejection() {
        return rejection;
    }
    if err.is_connect()
        && let Some(rejection) = attempt.peers.rejection_since(attempt.host, attempt.started)
    {
        return rejection;
    }
    let message = error_chain(err);
    let network = if err.is_timeout() {
        NetworkError::Timeout
    } else if err.is_connect() {
        if message.contains("dns error") || message.contains("failed to lookup") {
            NetworkError::DnsResolution(message)
        } else if message.contains("refused") {
            NetworkError::ConnectionRefused
        } else if message.contains("certificate") || message.contains("tls") {
            NetworkError::Tls(message)
        } else {
            NetworkError::ConnectionLost(message)
        }
    } else if err.is_body() || err.is_decode() || err.is_request() {
        NetworkError::ConnectionLost(message)
    } else {
        NetworkError::Other(message)
    };
    network.into()
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    use crate::network::progress::ProgressReporter;
    use crate::security::verifier::fixtures;

    /// HTTPS server on 127.0.0.1 presenting the self-signed fixture certificate
    fn serve_tls() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Arc::new(
            rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .unwrap()
                .with_no_client_auth()
                .with_single_cert(
                    vec![CertificateDer::from(fixtures::server_der())],
                    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(fixtures::server_key_der())),
                )
                .unwrap(),
        );
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let config = Arc::clone(&config);
                std::thread::spawn(move || {
                    let Ok(connection) = rustls::ServerConnection::new(config) else {
                        return;
                    };
                    let mut reader = BufReader::new(rustls::StreamOwned::new(connection, stream));
                    let mut line = String::new();
                    loop {
                        // Request head ends at the first empty line
                        loop {
                            line.clear();
                            match reader.read_line(&mut line) {
                                Ok(0) | Err(_) => return,
                                Ok(_) if line == "\r\n" => break,
                                Ok(_) => {}
                            }
                        }
                        let stream = reader.get_mut();
                        let written = stream
                            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                            .and_then(|_| stream.flush());
                        if written.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        format!("https://127.0.0.1:{}/file", port)
    }

    fn counting_gate(answer: bool) -> (Arc<TrustGate>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let gate = TrustGate::with_decision_handler(Arc::new(move |_: &Certificate, _: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            answer
        }));
        (Arc::new(gate), calls)
    }

    fn transport(gate: &Arc<TrustGate>) -> ReqwestTransport {
        ReqwestTransport::with_roots(&TransportConfig::default(), Arc::clone(gate), fixtures::roots()).unwrap()
    }

    async fn fetch(transport: &ReqwestTransport, request: Request, check: &CertificateCheck) -> TransportResult {
        transport.send(request, TransportContext::new(check.clone())).await
    }

    #[test]
    fn test_download_destination() {
        let explicit = Request::get("https://example.com/a").unwrap().download_to("/tmp/a.bin");
        assert_eq!(destination(&explicit), PathBuf::from("/tmp/a.bin"));

        let implicit = Request::get("https://example.com/a").unwrap().download();
        let path = destination(&implicit);
        assert!(path.to_string_lossy().contains(&implicit.lineage().to_string()));
    }

    #[test]
    fn test_transport_requires_root_anchors() {
        let config = TransportConfig {
            use_native_roots: false,
            ..TransportConfig::default()
        };
        // An empty root store cannot back a WebPKI verifier
        assert!(matches!(
            ReqwestTransport::new(&config, Arc::new(TrustGate::new())),
            Err(StratusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_forced_decision_asked_on_every_request() {
        let url = serve_tls();
        let (gate, calls) = counting_gate(true);
        let transport = transport(&gate);

        for expected in 1..=2 {
            let check = CertificateCheck::new(Arc::clone(&gate), true);
            let response = fetch(&transport, Request::get(&url).unwrap(), &check).await.unwrap();
            assert_eq!(response.status(), Some(200));
            assert!(check.was_evaluated());
            assert_eq!(calls.load(Ordering::SeqCst), expected);
        }
    }

    #[tokio::test]
    async fn test_pooled_requests_leave_the_check_to_the_caller() {
        let url = serve_tls();
        let (gate, calls) = counting_gate(true);
        let transport = transport(&gate);

        for _ in 0..2 {
            let check = CertificateCheck::new(Arc::clone(&gate), false);
            let response = fetch(&transport, Request::get(&url).unwrap(), &check).await.unwrap();
            assert!(!check.was_evaluated());
            let certificate = response.certificate().unwrap();
            assert!(certificate.has_issues());
            // Approved during the first handshake, so this never asks again
            assert!(check.check(certificate, "127.0.0.1").is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_declined_certificate_reported_to_concurrent_attempts() {
        let url = serve_tls();
        let (gate, calls) = counting_gate(false);
        let transport = transport(&gate);

        let first = CertificateCheck::new(Arc::clone(&gate), false);
        let second = CertificateCheck::new(Arc::clone(&gate), false);
        let (a, b) = futures::join!(
            fetch(&transport, Request::get(&url).unwrap(), &first),
            fetch(&transport, Request::get(&url).unwrap(), &second),
        );
        for result in [a, b] {
            let failure = result.unwrap_err();
            assert!(matches!(failure.error, StratusError::Trust { .. }), "{:?}", failure.error);
        }
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_request_handler_decides_instead_of_gate() {
        let url = serve_tls();
        let (gate, gate_calls) = counting_gate(true);
        let transport = transport(&gate);

        let request = Request::get(&url)
            .unwrap()
            .with_certificate_decision_handler(Arc::new(|_: &Certificate, _: &str| false));
        let check = CertificateCheck::new(Arc::clone(&gate), false)
            .with_handler(request.certificate_decision_handler().cloned());
        let failure = fetch(&transport, request, &check).await.unwrap_err();

        assert!(matches!(failure.error, StratusError::Trust { .. }));
        assert_eq!(gate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(gate.approval_count(), 0);
    }

    #[tokio::test]
    async fn test_download_reports_progress() {
        let url = serve_tls();
        let (gate, _) = counting_gate(true);
        let transport = transport(&gate);
        let path = std::env::temp_dir().join(format!("stratus-progress-{}.bin", uuid::Uuid::new_v4()));

        let (reporter, observer) = ProgressReporter::channel();
        let request = Request::get(&url).unwrap().download_to(&path).with_progress(reporter);
        let check = CertificateCheck::new(Arc::clone(&gate), false);
        let response = fetch(&transport, request, &check).await.unwrap();

        assert_eq!(response.body(), &ResponseBody::File(path.clone()));
        assert_eq!(*observer.borrow(), TransferProgress::new(2, Some(2)));
        assert_eq!(std::fs::read(&path).unwrap(), b"ok");
        let _ = std::fs::remove_file(&path);
    }
}
