//! Integration tests for the full server lifecycle: TLS round-trips
//! against a running instance, capability advertisement, retry behavior
//! and graceful shutdown.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use rainsd::message::unix_now;
use rainsd::switchboard::AcceptAnyServerCert;
use rainsd::wire;
use rainsd::{
    Algorithm, Assertion, Capability, Config, Message, NotificationKind, Object, ObjectKind, Peer,
    PrivateKey, Query, QueryOption, Section, SendError, Server, Signature, Token,
};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct TestSetup {
    server: Server,
    addr: SocketAddr,
    root: PrivateKey,
    _dir: tempfile::TempDir,
}

/// Write TLS identity, root delegation and configuration into a tempdir
/// and start a server on a fresh localhost port.
async fn start_server() -> TestSetup {
    let dir = tempfile::tempdir().expect("tempdir");
    let port = next_port();

    let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("certificate generation");
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, signed.cert.pem()).unwrap();
    std::fs::write(&key_path, signed.key_pair.serialize_pem()).unwrap();

    let root = PrivateKey::generate(Algorithm::Ed25519).unwrap();
    let root_pub = root.public_key(1, unix_now() - 10, unix_now() + 7200);
    let root_path = dir.path().join("root.json");
    let key_hex = match &root_pub.key {
        rainsd::signature::KeyData::Ed25519(bytes) => hex::encode(bytes),
        other => panic!("unexpected key data {other:?}"),
    };
    std::fs::write(
        &root_path,
        format!(
            r#"{{
                "Zone": ".",
                "Context": ".",
                "Algorithm": "Ed25519",
                "KeyPhase": 1,
                "ValidSince": {},
                "ValidUntil": {},
                "Key": "{}"
            }}"#,
            root_pub.valid_since, root_pub.valid_until, key_hex
        ),
    )
    .unwrap();

    let config_raw = format!(
        r#"{{
            "RootZonePublicKeyPath": "{}",
            "ServerAddress": {{
                "Type": "TCP",
                "TCPAddr": {{ "IP": "127.0.0.1", "Port": {port} }}
            }},
            "TLSCertificateFile": "{}",
            "TLSPrivateKeyFile": "{}",
            "InsecureSkipVerify": true,
            "TCPTimeout": 5,
            "CheckPointPath": "{}"
        }}"#,
        root_path.display(),
        cert_path.display(),
        key_path.display(),
        dir.path().join("checkpoints").display(),
    );
    let config: Config = serde_json::from_str(&config_raw).expect("config parses");

    let mut server = Server::new(config).expect("server initializes");
    server.start().await.expect("server starts");
    let addr = server.local_addr().expect("bound address");

    TestSetup {
        server,
        addr,
        root,
        _dir: dir,
    }
}

async fn connect(addr: SocketAddr) -> tokio_rustls::client::TlsStream<TcpStream> {
    let tcp = timeout(TEST_TIMEOUT, TcpStream::connect(addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::from(addr.ip());
    timeout(TEST_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .expect("handshake timed out")
        .expect("handshake failed")
}

async fn send(
    stream: &mut tokio_rustls::client::TlsStream<TcpStream>,
    message: &Message,
) {
    wire::write_message(stream, message, wire::DEFAULT_MSG_MAX_SIZE)
        .await
        .expect("write failed");
}

async fn receive(stream: &mut tokio_rustls::client::TlsStream<TcpStream>) -> Message {
    timeout(TEST_TIMEOUT, wire::read_message(stream, wire::DEFAULT_MSG_MAX_SIZE))
        .await
        .expect("read timed out")
        .expect("read failed")
}

fn sign(section: &mut Section, key: &PrivateKey) {
    let now = unix_now();
    let mut sig = Signature::new(key.algorithm(), 1, now - 3600, now + 3600);
    let canonical = rainsd::canonical::encode_section(section);
    sig.sign(key, &canonical).expect("signing must succeed");
    section.signatures_mut().expect("signable").push(sig);
}

#[tokio::test]
async fn cached_answers_only_miss_round_trip() {
    let setup = start_server().await;
    let mut stream = connect(setup.addr).await;

    let token = Token::fresh();
    let query = Message::query(
        token,
        Query {
            name: "missing.ch".to_string(),
            context: ".".to_string(),
            expiration: unix_now() + 60,
            types: vec![ObjectKind::Ip4],
            options: vec![QueryOption::CachedAnswersOnly],
        },
    );
    send(&mut stream, &query).await;

    let reply = receive(&mut stream).await;
    match &reply.content[0] {
        Section::Notification(n) => {
            assert_eq!(n.kind, NotificationKind::NoAssertionAvail);
            assert_eq!(n.token, token, "reply must echo the query token");
        }
        other => panic!("expected notification, got {other:?}"),
    }

    setup.server.shutdown();
    let mut server = setup.server;
    timeout(TEST_TIMEOUT, server.join())
        .await
        .expect("shutdown timed out");
}

#[tokio::test]
async fn assertion_then_query_round_trip() {
    let setup = start_server().await;
    let mut stream = connect(setup.addr).await;
    let now = unix_now();

    // Push a root-signed delegation, then query it back.
    let child = PrivateKey::generate(Algorithm::Ed25519).unwrap();
    let child_pub = child.public_key(1, now - 10, now + 7200);
    let mut section = Section::Assertion(Assertion {
        subject_name: "ch".to_string(),
        subject_zone: ".".to_string(),
        context: ".".to_string(),
        content: vec![Object::Delegation(child_pub)],
        ..Default::default()
    });
    sign(&mut section, &setup.root);
    let mut push = Message {
        token: Token::fresh(),
        content: vec![section],
        ..Default::default()
    };
    push.sort();
    send(&mut stream, &push).await;

    // Poll until the section has passed the pipeline.
    let token = Token::fresh();
    let query = Message::query(
        token,
        Query {
            name: "ch".to_string(),
            context: ".".to_string(),
            expiration: now + 60,
            types: vec![ObjectKind::Delegation],
            options: vec![],
        },
    );
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    let answer = loop {
        send(&mut stream, &query).await;
        let reply = receive(&mut stream).await;
        match &reply.content[0] {
            Section::Assertion(a) => break a.clone(),
            Section::Notification(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            other => panic!("unexpected reply {other:?}"),
        }
    };
    assert_eq!(answer.subject_name, "ch");
    assert!(matches!(answer.content[0], Object::Delegation(_)));

    setup.server.shutdown();
    let mut server = setup.server;
    timeout(TEST_TIMEOUT, server.join())
        .await
        .expect("shutdown timed out");
}

#[tokio::test]
async fn oversized_frame_answered_and_stream_closed() {
    let setup = start_server().await;
    let mut stream = connect(setup.addr).await;

    use tokio::io::AsyncWriteExt as _;
    let huge = (1_000_000u32).to_be_bytes();
    stream.write_all(&huge).await.expect("prefix write");
    stream.flush().await.unwrap();

    let reply = receive(&mut stream).await;
    match &reply.content[0] {
        Section::Notification(n) => assert_eq!(n.kind, NotificationKind::MsgTooLarge),
        other => panic!("expected notification, got {other:?}"),
    }

    // The server closes the stream afterwards.
    let end = timeout(TEST_TIMEOUT, wire::read_message(&mut stream, wire::DEFAULT_MSG_MAX_SIZE))
        .await
        .expect("read timed out");
    assert!(end.is_err(), "stream should be closed after MsgTooLarge");

    setup.server.shutdown();
}

#[tokio::test]
async fn unreachable_peer_retry_timing() {
    let setup = start_server().await;

    // TEST-NET-1: never reachable. retries=2 with 10ms initial backoff
    // must sleep at least 10 + 20 ms before giving up.
    let unreachable = Peer::tcp(SocketAddr::from(([192, 0, 2, 1], 55553)));
    let started = std::time::Instant::now();
    let result = setup
        .server
        .switchboard()
        .send_to(unreachable, Message::default(), 2, 10)
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(SendError::Unreachable { .. })));
    assert!(elapsed >= Duration::from_millis(30), "expected backoff sleeps, got {elapsed:?}");

    setup.server.shutdown();
}

#[tokio::test]
async fn capability_hash_advertised_on_outgoing_connection() {
    let setup = start_server().await;

    // A raw TLS listener plays the remote peer.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = listener.local_addr().unwrap();
    let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = signed.cert.der().clone();
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(signed.key_pair.serialize_der()),
    );
    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let accept_task = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.expect("accept");
        let mut tls = acceptor.accept(tcp).await.expect("tls accept");
        wire::read_message(&mut tls, wire::DEFAULT_MSG_MAX_SIZE)
            .await
            .expect("read first message")
    });

    let expected_hash = rainsd::capability_hash(&[Capability::tls_over_tcp()]);
    setup
        .server
        .switchboard()
        .send_to(
            Peer::tcp(peer_addr),
            Message::notification(Token::fresh(), NotificationKind::Heartbeat, ""),
            0,
            0,
        )
        .await
        .expect("send to local peer");

    let first = timeout(TEST_TIMEOUT, accept_task)
        .await
        .expect("peer timed out")
        .expect("peer task failed");
    assert_eq!(
        first.capabilities,
        vec![Capability(expected_hash)],
        "first message must carry the capability hash"
    );

    setup.server.shutdown();
}
