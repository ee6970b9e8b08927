//! End-to-end tests for the SMTP listener over real TCP connections

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use mta_rs::config::Config;
use mta_rs::relay::mock::MockTransport;
use mta_rs::security::TlsConfig;
use mta_rs::smtp::{SessionServices, SmtpServer};
use mta_rs::storage::MemoryStore;
use mta_rs::utils::dns::mock::MockResolver;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    transport: Arc<MockTransport>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<mta_rs::Result<()>>,
}

impl TestServer {
    async fn start(config: Config, tls: Option<TlsConfig>) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.add_master_key("acme", "secret").await;
        let transport = Arc::new(MockTransport::new());
        let resolver = MockResolver::new()
            .with_txt("brand.example", &["v=spf1 ip4:127.0.0.0/8 -all"])
            .with_mx("one.example", &[("mx.one.example", 10)]);

        let services = Arc::new(SessionServices::from_config(
            &config,
            store.clone(),
            Arc::new(resolver),
            transport.clone(),
            tls,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = SmtpServer::new(services);
        let handle = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
        });

        Self {
            addr,
            store,
            transport,
            shutdown: Some(tx),
            handle,
        }
    }

    async fn connect(&self) -> Client<TcpStream> {
        Client::new(TcpStream::connect(self.addr).await.unwrap())
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.unwrap().unwrap();
    }
}

struct Client<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    async fn reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read_line(&mut line))
                .await
                .expect("reply timed out")
                .unwrap();
            if n == 0 {
                return reply;
            }
            reply.push_str(&line);
            if line.as_bytes().get(3) != Some(&b'-') {
                return reply;
            }
        }
    }

    async fn send(&mut self, line: &str) -> String {
        self.stream.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        self.reply().await
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.hostname = "mx.test".to_string();
    config.relay.retry_attempts = 1;
    config.relay.retry_delay_ms = 1;
    config
}

fn plain(username: &str, password: &str) -> String {
    BASE64.encode(format!("\0{}\0{}", username, password))
}

#[tokio::test]
async fn test_submission_end_to_end() {
    let server = TestServer::start(test_config(), None).await;
    let mut client = server.connect().await;

    assert!(client.reply().await.starts_with("220 mx.test ESMTP"));
    assert!(client.send("EHLO client.test").await.contains("AUTH LOGIN PLAIN"));
    assert!(client.send("MAIL FROM:<news@brand.example>").await.starts_with("530"));
    assert!(client.send(&format!("AUTH PLAIN {}", plain("acme", "secret"))).await.starts_with("235"));
    assert!(client.send("MAIL FROM:<news@brand.example> SIZE=512").await.starts_with("250"));
    assert!(client.send("RCPT TO:<first@one.example>").await.starts_with("250"));
    assert!(client.send("RCPT TO:<second@one.example>").await.starts_with("250"));
    assert!(client.send("DATA").await.starts_with("354"));
    let reply = client
        .send("Subject: Autumn newsletter\r\nContent-Type: text/plain\r\n\r\nHello there\r\n.")
        .await;
    assert!(reply.starts_with("250"), "{}", reply);
    assert!(client.send("QUIT").await.starts_with("221"));

    let attempts = server.transport.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].host, "mx.one.example");
    assert_eq!(attempts[0].from, "news@brand.example");
    assert_eq!(attempts[0].recipients, vec!["first@one.example", "second@one.example"]);
    let data = String::from_utf8_lossy(&attempts[0].data).to_string();
    assert!(data.contains("Subject: Autumn newsletter\r\n"));
    assert!(data.contains("X-Source-IP: 127.0.0.1\r\n"));

    assert_eq!(server.store.mailboxes().await.len(), 1);
    assert_eq!(server.store.delivered().await, vec!["first@one.example", "second@one.example"]);

    server.stop().await;
}

#[tokio::test]
async fn test_connection_admission() {
    let mut config = test_config();
    config.rate_limit.connections_per_ip = 2;
    let server = TestServer::start(config, None).await;

    let mut first = server.connect().await;
    assert!(first.reply().await.starts_with("220"));
    let mut second = server.connect().await;
    assert!(second.reply().await.starts_with("220"));

    let mut third = server.connect().await;
    let refused = third.reply().await;
    assert!(refused.starts_with("421"), "{}", refused);
    // Connection is closed after the refusal
    assert_eq!(third.reply().await, "");

    // Admitted sessions are unaffected
    assert!(first.send("NOOP").await.starts_with("250"));

    server.stop().await;
}

#[tokio::test]
async fn test_recipient_cap_over_tcp() {
    let mut config = test_config();
    config.smtp.max_recipients = 3;
    let server = TestServer::start(config, None).await;
    let mut client = server.connect().await;

    client.reply().await;
    client.send("EHLO client.test").await;
    client.send(&format!("AUTH PLAIN {}", plain("acme", "secret"))).await;
    client.send("MAIL FROM:<news@brand.example>").await;
    for i in 0..3 {
        assert!(client.send(&format!("RCPT TO:<r{}@one.example>", i)).await.starts_with("250"));
    }
    assert!(client.send("RCPT TO:<r3@one.example>").await.starts_with("452"));

    // The accepted three are still deliverable
    assert!(client.send("DATA").await.starts_with("354"));
    assert!(client.send("Subject: cap\r\n\r\nbody\r\n.").await.starts_with("250"));
    assert_eq!(server.transport.attempts()[0].recipients.len(), 3);

    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_accepting() {
    let server = TestServer::start(test_config(), None).await;
    let addr = server.addr;
    server.stop().await;

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_starttls_then_auth() {
    let cert = rcgen::generate_simple_self_signed(vec!["mx.test".to_string()]).unwrap();
    let mut cert_file = NamedTempFile::new().unwrap();
    let mut key_file = NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut cert_file, cert.serialize_pem().unwrap().as_bytes()).unwrap();
    std::io::Write::write_all(&mut key_file, cert.serialize_private_key_pem().as_bytes()).unwrap();
    let tls = TlsConfig::from_pem_files(cert_file.path(), key_file.path()).unwrap();

    let server = TestServer::start(test_config(), Some(tls)).await;
    let mut client = server.connect().await;
    client.reply().await;

    let ehlo = client.send("EHLO client.test").await;
    assert!(ehlo.contains("STARTTLS"));
    assert!(!ehlo.contains("AUTH"));
    assert!(client
        .send(&format!("AUTH PLAIN {}", plain("acme", "secret")))
        .await
        .starts_with("530"));
    assert!(client.send("STARTTLS").await.starts_with("220"));

    let mut roots = rustls::RootCertStore::empty();
    roots.add(&rustls::Certificate(cert.serialize_der().unwrap())).unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let server_name = rustls::ServerName::try_from("mx.test").unwrap();
    let tls_stream = connector.connect(server_name, client.into_inner()).await.unwrap();

    let mut client = Client::new(tls_stream);
    // Session state was reset by the upgrade
    assert!(client.send("MAIL FROM:<news@brand.example>").await.starts_with("503"));
    let ehlo = client.send("EHLO client.test").await;
    assert!(!ehlo.contains("STARTTLS"));
    assert!(ehlo.contains("AUTH LOGIN PLAIN"));
    assert!(client.send("STARTTLS").await.starts_with("503"));
    assert!(client
        .send(&format!("AUTH PLAIN {}", plain("acme", "secret")))
        .await
        .starts_with("235"));
    assert!(client.send("QUIT").await.starts_with("221"));

    server.stop().await;
}
