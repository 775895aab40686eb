//! Stratus - command line client
//!
//! Fetches a single URL through the request queue:
//!
//! ```text
//! stratus <url> [--download <path>] [--config <file>] [--user <name>]
//! ```
//!
//! `STRATUS_PASSWORD` enables basic authentication, `STRATUS_TOKEN` enables
//! bearer authentication.

use std::env;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use stratus::auth::{AuthenticationRegistry, BasicAuthentication, BearerAuthentication, Secret, StaticSecretLoader};
use stratus::network::{Connection, ProgressReporter, ResponseBody};
use stratus::security::{Certificate, TrustGate};
use stratus::{NAME, NetworkStack, Request, Result, StratusConfig, StratusError, VERSION};

#[derive(Debug, Default)]
struct Options {
    url: String,
    download: Option<String>,
    config: Option<String>,
    user: Option<String>,
}

fn parse_args(args: &[String]) -> std::result::Result<Options, String> {
    let mut options = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{} needs a value", flag))
        };
        match arg.as_str() {
            "--download" => options.download = Some(value("--download")?),
            "--config" => options.config = Some(value("--config")?),
            "--user" => options.user = Some(value("--user")?),
            flag if flag.starts_with("--") => return Err(format!("unknown option {}", flag)),
            url if options.url.is_empty() => options.url = url.to_string(),
            extra => return Err(format!("unexpected argument {}", extra)),
        }
    }
    if options.url.is_empty() {
        return Err("missing URL".into());
    }
    Ok(options)
}

/// Ask on the terminal whether to trust a certificate with issues
fn prompt_certificate(certificate: &Certificate, host: &str) -> bool {
    eprintln!("Certificate for {} has issues:", host);
    for issue in certificate.issues() {
        eprintln!("  - {}", issue);
    }
    eprintln!("  SHA-256 {}", certificate.fingerprint());
    eprint!("Trust this certificate? [y/N] ");
    let _ = io::stderr().flush();

    off_runtime(|| read_answer(&mut io::stdin().lock()))
}

/// Parse a yes/no answer; anything but an explicit yes declines
fn read_answer(input: &mut impl BufRead) -> bool {
    let mut answer = String::new();
    if input.read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

/// Run blocking terminal I/O without stalling the runtime worker.
///
/// The decision handler runs inside the TLS handshake on a worker thread.
fn off_runtime<T>(work: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

async fn run(options: Options) -> Result<()> {
    let config = match &options.config {
        Some(path) => StratusConfig::from_file(path)?,
        None => StratusConfig::default(),
    }
    .with_env_overrides()?;

    let trust = Arc::new(TrustGate::with_decision_handler(Arc::new(prompt_certificate)));

    let mut connection = Connection::new(&options.url)?;
    if let Some(user) = &options.user {
        connection = connection.with_user_name(user.clone());
    }
    let authentication = match (env::var("STRATUS_PASSWORD"), env::var("STRATUS_TOKEN")) {
        (Ok(password), _) => Some((BasicAuthentication::IDENTIFIER, password)),
        (_, Ok(token)) => Some((BearerAuthentication::IDENTIFIER, token)),
        _ => None,
    };
    let authentication = match authentication {
        Some((identifier, secret)) => {
            let registry = AuthenticationRegistry::with_builtin_methods(Arc::new(StaticSecretLoader::new(Secret::new(secret))));
            Some((registry.instantiate(identifier, &connection)?, connection))
        }
        None => None,
    };

    let stack = NetworkStack::new(&config, trust, authentication)?;
    let mut request = Request::get(&options.url)?;
    if let Some(path) = &options.download {
        let (reporter, mut progress) = ProgressReporter::channel();
        request = request.download_to(path).auto_resuming().with_progress(reporter);
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let current = *progress.borrow_and_update();
                match current.expected {
                    Some(total) => eprint!("\r{} / {} bytes", current.received, total),
                    None => eprint!("\r{} bytes", current.received),
                }
            }
        });
    }

    let completion = stack.send(request).await?;
    if options.download.is_some() {
        eprintln!();
    }
    // The first history entry is the URL we asked for
    for hop in completion.request.redirect_history().iter().skip(1) {
        println!("redirected to {}", hop);
    }
    if let Some(err) = completion.error() {
        return Err(err.clone());
    }
    let response = &completion.response;
    println!("status {}", response.status().unwrap_or_default());
    match response.body() {
        ResponseBody::File(path) => println!("saved to {}", path.display()),
        ResponseBody::Data(_) => {
            if let Some(text) = response.body_as_string() {
                println!("{}", text);
            }
        }
        ResponseBody::Empty => {}
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{} v{}: {}", NAME, VERSION, message);
            eprintln!("usage: stratus <url> [--download <path>] [--config <file>] [--user <name>]");
            return ExitCode::from(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(run(options)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(StratusError::Cancelled) => ExitCode::from(130),
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_args() {
        let args: Vec<String> = ["https://cloud.example.com/f", "--download", "/tmp/f"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let options = parse_args(&args).unwrap();
        assert_eq!(options.url, "https://cloud.example.com/f");
        assert_eq!(options.download.as_deref(), Some("/tmp/f"));
        assert!(parse_args(&[]).is_err());
        assert!(parse_args(&["--config".to_string()]).is_err());
    }

    #[test]
    fn test_read_answer() {
        assert!(read_answer(&mut Cursor::new("y\n")));
        assert!(read_answer(&mut Cursor::new("yes\n")));
        assert!(!read_answer(&mut Cursor::new("n\n")));
        assert!(!read_answer(&mut Cursor::new("")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_prompt_leaves_runtime_responsive() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        // Occupies the only worker until the ticker below has run
        let prompt = tokio::spawn(async move {
            off_runtime(|| {
                rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok()
                    && read_answer(&mut Cursor::new("y\n"))
            })
        });
        tokio::task::yield_now().await;
        let ticker = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let _ = tx.send(());
        });
        assert!(prompt.await.unwrap());
        ticker.await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_prompt_on_current_thread_runtime() {
        assert!(!off_runtime(|| read_answer(&mut Cursor::new("no\n"))));
    }
}
