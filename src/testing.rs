//! Test support: a scripted SMTP server and socket helpers

use crate::config::{AccountConfig, TlsMode};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// A plaintext account for `me@qq.com` / `secret`
pub(crate) fn account(host: &str, port: u16, ca_file: Option<String>) -> AccountConfig {
    AccountConfig {
        account_type: "qq".into(),
        username: "me@qq.com".into(),
        password: "secret".into(),
        smtp_host: host.into(),
        smtp_port: port,
        tls: TlsMode::Plain,
        ca_file,
    }
}

/// A loopback port nothing listens on
pub(crate) async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Two ends of one loopback connection: (client, accepted)
pub(crate) async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

/// Self-signed certificate for `localhost`, with its PEM on disk
pub(crate) struct TestCert {
    cert: Vec<u8>,
    key: Vec<u8>,
    pem: tempfile::NamedTempFile,
}

impl TestCert {
    pub(crate) fn generate() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let pem = cert.serialize_pem().unwrap();
        let key = cert.serialize_private_key_der();

        // Each serialization signs anew, so the DER is taken from the PEM
        // to keep the served and the trusted certificate identical.
        let der = rustls_pemfile::certs(&mut pem.as_bytes())
            .next()
            .unwrap()
            .unwrap()
            .to_vec();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(pem.as_bytes()).unwrap();
        file.flush().unwrap();

        Self {
            cert: der,
            key,
            pem: file,
        }
    }

    pub(crate) fn ca_path(&self) -> String {
        self.pem.path().to_string_lossy().to_string()
    }

    fn acceptor(&self) -> TlsAcceptor {
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(
                vec![CertificateDer::from(self.cert.clone())],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key.clone())),
            )
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }
}

/// Reply codes the mock server answers with
#[derive(Debug, Clone)]
pub(crate) struct MockBehavior {
    pub auth_code: u16,
    pub mail_from_code: u16,
    pub rcpt_code: u16,
    pub end_data_code: u16,
    pub starttls: bool,
    pub implicit_tls: bool,
    /// Pause before confirming a message
    pub data_delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            auth_code: 235,
            mail_from_code: 250,
            rcpt_code: 250,
            end_data_code: 250,
            starttls: false,
            implicit_tls: false,
            data_delay: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct Stats {
    commands: Mutex<Vec<String>>,
    messages: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    connections: AtomicUsize,
}

/// Scripted SMTP server on a loopback port
pub(crate) struct MockSmtp {
    pub addr: SocketAddr,
    stats: Arc<Stats>,
}

impl MockSmtp {
    pub(crate) async fn start(behavior: MockBehavior) -> Self {
        Self::spawn(behavior, None).await
    }

    pub(crate) async fn start_tls(behavior: MockBehavior, cert: &TestCert) -> Self {
        Self::spawn(behavior, Some(cert.acceptor())).await
    }

    async fn spawn(behavior: MockBehavior, acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(Stats::default());

        let shared = Arc::clone(&stats);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let behavior = behavior.clone();
                let acceptor = acceptor.clone();
                let stats = Arc::clone(&shared);
                tokio::spawn(async move {
                    let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
                    stats.peak.fetch_max(now, Ordering::SeqCst);
                    stats.connections.fetch_add(1, Ordering::SeqCst);
                    handle(stream, &behavior, acceptor, &stats).await;
                    stats.active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        Self { addr, stats }
    }

    /// A plaintext account pointing at this server
    pub(crate) fn account(&self) -> AccountConfig {
        account("127.0.0.1", self.addr.port(), None)
    }

    /// Command lines received, credentials decoded as `CRED <value>`
    pub(crate) fn commands(&self) -> Vec<String> {
        self.stats.commands.lock().unwrap().clone()
    }

    /// DATA payloads received, without the terminator
    pub(crate) fn messages(&self) -> Vec<String> {
        self.stats.messages.lock().unwrap().clone()
    }

    /// Most connections ever open at once
    pub(crate) fn peak_connections(&self) -> usize {
        self.stats.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }
}

async fn handle(
    stream: TcpStream,
    behavior: &MockBehavior,
    acceptor: Option<TlsAcceptor>,
    stats: &Stats,
) {
    if behavior.implicit_tls {
        let Some(acceptor) = acceptor else { return };
        if let Ok(tls) = acceptor.accept(stream).await {
            serve(tls, true, behavior, stats).await;
        }
        return;
    }

    if let Some(plain) = serve(stream, true, behavior, stats).await {
        let Some(acceptor) = acceptor else { return };
        if let Ok(tls) = acceptor.accept(plain).await {
            serve(tls, false, behavior, stats).await;
        }
    }
}

/// Answer commands until QUIT or EOF. Returns the stream when STARTTLS
/// was accepted.
async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    greet: bool,
    behavior: &MockBehavior,
    stats: &Stats,
) -> Option<S> {
    let mut stream = BufReader::new(stream);
    if greet {
        write_line(&mut stream, "220 mock.local ESMTP ready").await?;
    }

    let mut credentials = 0;
    let mut message: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if stream.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let text = line.trim_end_matches(['\r', '\n']).to_string();

        if let Some(body) = message.as_mut() {
            if text != "." {
                body.push_str(&text);
                body.push_str("\r\n");
                continue;
            }
            let body = message.take().unwrap_or_default();
            stats.messages.lock().unwrap().push(body);
            tokio::time::sleep(behavior.data_delay).await;
            write_line(&mut stream, &format!("{} queued", behavior.end_data_code)).await?;
            continue;
        }

        if credentials > 0 {
            let decoded = BASE64
                .decode(text.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_default();
            stats.commands.lock().unwrap().push(format!("CRED {decoded}"));
            credentials -= 1;
            let reply = if credentials == 1 {
                "334 UGFzc3dvcmQ6".to_string()
            } else {
                format!("{} auth", behavior.auth_code)
            };
            write_line(&mut stream, &reply).await?;
            continue;
        }

        stats.commands.lock().unwrap().push(text.clone());
        let upper = text.to_ascii_uppercase();
        let reply = if upper.starts_with("EHLO") {
            let mut lines = vec!["250-mock.local", "250-AUTH LOGIN PLAIN"];
            if behavior.starttls {
                lines.push("250-STARTTLS");
            }
            lines.push("250 8BITMIME");
            lines.join("\r\n")
        } else if upper == "STARTTLS" && behavior.starttls {
            write_line(&mut stream, "220 2.0.0 Ready to start TLS").await?;
            return Some(stream.into_inner());
        } else if upper == "AUTH LOGIN" {
            credentials = 2;
            "334 VXNlcm5hbWU6".to_string()
        } else if upper.starts_with("MAIL FROM") {
            format!("{} sender", behavior.mail_from_code)
        } else if upper.starts_with("RCPT TO") {
            format!("{} recipient", behavior.rcpt_code)
        } else if upper == "DATA" {
            message = Some(String::new());
            "354 End data with <CR><LF>.<CR><LF>".to_string()
        } else if upper == "QUIT" {
            write_line(&mut stream, "221 Bye").await?;
            return None;
        } else {
            "502 Command not implemented".to_string()
        };
        write_line(&mut stream, &reply).await?;
    }
}

async fn write_line<S: AsyncWrite + Unpin>(stream: &mut S, line: &str) -> Option<()> {
    stream.write_all(format!("{line}\r\n").as_bytes()).await.ok()?;
    stream.flush().await.ok()
}
