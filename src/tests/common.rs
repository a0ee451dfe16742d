use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fnv::FnvHashMap;
use rcgen::{BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType, IsCa, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use x509_parser::prelude::{FromDer, X509CertificationRequest};

use crate::pggate::{Error, Result};
use crate::pggate::config::Settings;
use crate::pggate::pg::protocol::{
    Message, MessageBuilder, MessageReader, PostgresError, ServerParams, StartupRequest, Tag,
    SSL_REQUEST,
};
use crate::pggate::pg::{
    AccessChecker, AuthClient, BackendCodec, DatabaseCertResponse, DatabaseServer, Engine,
    FrontendCodec, Identity, SessionContext, SessionHooks, TokenSource, DEFAULT_RECV_BUFFER_SIZE,
};

pub const TEST_DATABASE: &str = "shop";
pub const TEST_USER: &str = "app";
pub const TEST_IDENTITY: &str = "alice";
pub const TEST_PROCESS_ID: i32 = 4242;
pub const TEST_SECRET_KEY: i32 = 1717;

pub async fn listener() -> TcpListener {
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("couldn't bind listen socket")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    SessionStart(Option<String>),
    SessionEnd,
    Query(String),
}

/// Audit sink recording every hook invocation in order.
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingHooks { events: Mutex::new(Vec::new()) })
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionHooks for RecordingHooks {
    async fn on_session_start(&self, _session: &SessionContext, error: Option<&Error>) -> Result<()> {
        self.events.lock().unwrap().push(HookEvent::SessionStart(error.map(|e| e.to_string())));
        Ok(())
    }

    async fn on_session_end(&self, _session: &SessionContext) -> Result<()> {
        self.events.lock().unwrap().push(HookEvent::SessionEnd);
        Ok(())
    }

    async fn on_query(&self, _session: &SessionContext, sql: &str) -> Result<()> {
        self.events.lock().unwrap().push(HookEvent::Query(sql.to_string()));
        Ok(())
    }
}

/// Access checker recording the checked tuples, optionally denying all of
/// them with a fixed reason.
pub struct RecordingChecker {
    deny_reason: Option<String>,
    seen: Mutex<Vec<(String, String, String)>>,
}

impl RecordingChecker {
    pub fn allow() -> Arc<Self> {
        Arc::new(RecordingChecker { deny_reason: None, seen: Mutex::new(Vec::new()) })
    }

    pub fn deny(reason: &str) -> Arc<Self> {
        Arc::new(RecordingChecker { deny_reason: Some(reason.to_string()), seen: Mutex::new(Vec::new()) })
    }

    pub fn seen(&self) -> Vec<(String, String, String)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AccessChecker for RecordingChecker {
    async fn check_access(
        &self,
        server: &DatabaseServer,
        database_name: &str,
        database_user: &str,
        _identity: &Identity,
    ) -> Result<()> {
        self.seen.lock().unwrap().push(
            (server.name().to_string(), database_name.to_string(), database_user.to_string()));
        match &self.deny_reason {
            Some(reason) => Err(Error::access_denied(reason)),
            None => Ok(()),
        }
    }
}

/// Deterministic stand-in for the IAM token derivation.
pub struct StaticTokenSource;

impl TokenSource for StaticTokenSource {
    fn auth_token(&self, host: &str, region: &str, user: &str) -> Result<String> {
        Ok(format!("token:{}:{}:{}", host, region, user))
    }
}

/// A self-signed CA used both as the cluster host CA (signing the
/// gateway's ephemeral client certificates) and to issue the mock
/// database server's TLS identity.
pub struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new() -> Self {
        let key = KeyPair::generate().expect("couldn't generate CA key");
        let mut params = CertificateParams::new(Vec::new()).expect("couldn't build CA params");
        params.distinguished_name.push(DnType::CommonName, "pggate test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).expect("couldn't self-sign CA");
        TestCa { cert, key }
    }

    pub fn ca_pem(&self) -> Vec<u8> {
        self.cert.pem().into_bytes()
    }

    /// Issues a TLS server identity for the mock database, valid for
    /// localhost connections.
    pub fn issue_server_identity(&self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate().expect("couldn't generate server key");
        let params = CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .expect("couldn't build server params");
        let cert = params.signed_by(&key, &self.cert, &self.key).expect("couldn't sign server cert");
        (vec![cert.der().clone()], PrivateKeyDer::Pkcs8(key.serialize_der().into()))
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        let (chain, key) = self.issue_server_identity();
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .expect("couldn't build server TLS config");
        TlsAcceptor::from(Arc::new(config))
    }
}

/// Cluster auth server double: signs CSRs with the test CA and records
/// the request it saw.
pub struct TestAuthClient {
    ca: TestCa,
    requests: Mutex<Vec<(String, Duration)>>, // (subject CN, ttl)
}

impl TestAuthClient {
    pub fn new() -> Arc<Self> {
        Arc::new(TestAuthClient { ca: TestCa::new(), requests: Mutex::new(Vec::new()) })
    }

    pub fn ca(&self) -> &TestCa {
        &self.ca
    }

    pub fn requests(&self) -> Vec<(String, Duration)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthClient for TestAuthClient {
    async fn generate_database_cert(&self, csr_pem: &str, ttl: Duration) -> Result<DatabaseCertResponse> {
        let cn = csr_common_name(csr_pem)?;
        self.requests.lock().unwrap().push((cn, ttl));

        let csr = CertificateSigningRequestParams::from_pem(csr_pem)?;
        let cert = csr.signed_by(&self.ca.cert, &self.ca.key)?;
        Ok(DatabaseCertResponse {
            cert: cert.pem().into_bytes(),
            ca_certs: vec![self.ca.ca_pem()],
        })
    }
}

fn csr_common_name(csr_pem: &str) -> Result<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(csr_pem.as_bytes())
        .map_err(|e| Error::new(format!("invalid CSR pem: {}", e)))?;
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents)
        .map_err(|e| Error::new(format!("invalid CSR: {}", e)))?;
    let cn = csr.certification_request_info.subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    Ok(cn)
}

/// How the mock database server authenticates the gateway.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum MockAuth {
    /// mTLS-style: AuthenticationOk right away.
    Trust,
    /// Request a cleartext password first (the managed-cloud flow).
    Cleartext,
}

pub struct MockServerOptions {
    pub auth: MockAuth,
    /// Respond to the startup message with this error and close.
    pub error: Option<PostgresError>,
    /// ParameterStatus values to report, in addition to echoing the
    /// client's application_name the way a real server does.
    pub parameters: Vec<(String, String)>,
}

impl Default for MockServerOptions {
    fn default() -> Self {
        MockServerOptions {
            auth: MockAuth::Trust,
            error: None,
            parameters: vec![("server_version".to_string(), "14.5".to_string())],
        }
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub startup: Arc<Mutex<Option<ServerParams>>>,
    /// Messages received from the gateway after startup, frontend view.
    pub received: Arc<Mutex<Vec<Message>>>,
    pub password: Arc<Mutex<Option<String>>>,
}

impl MockServer {
    pub fn uri(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn startup_params(&self) -> ServerParams {
        self.startup.lock().unwrap().clone().expect("no startup received")
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }
}

/// Spawns a mock database server speaking the v3 wire over TLS for a
/// single connection.
pub async fn spawn_mock_server(ca: &TestCa, options: MockServerOptions) -> MockServer {
    let listener = listener().await;
    let addr = listener.local_addr().unwrap();
    let acceptor = ca.acceptor();
    let startup = Arc::new(Mutex::new(None));
    let received = Arc::new(Mutex::new(Vec::new()));
    let password = Arc::new(Mutex::new(None));

    let server = MockServer {
        addr,
        startup: startup.clone(),
        received: received.clone(),
        password: password.clone(),
    };

    tokio::spawn(async move {
        if let Err(e) = serve_one(listener, acceptor, options, startup, received, password).await {
            tracing::debug!(%e, "mock server done");
        }
    });

    server
}

async fn serve_one(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    options: MockServerOptions,
    startup: Arc<Mutex<Option<ServerParams>>>,
    received: Arc<Mutex<Vec<Message>>>,
    password: Arc<Mutex<Option<String>>>,
) -> Result<()> {
    let (mut tcp, _) = listener.accept().await?;

    // SSLRequest, answered in the affirmative
    let mut request = [0u8; 8];
    tcp.read_exact(&mut request).await?;
    assert_eq!(&request[4..], &SSL_REQUEST.to_be_bytes()[..]);
    tcp.write_all(b"S").await?;
    let tls = acceptor.accept(tcp).await?;

    let mut codec = BackendCodec::new(tls, DEFAULT_RECV_BUFFER_SIZE);
    let params = match codec.receive_startup().await? {
        StartupRequest::Startup(params) => params,
        other => panic!("mock server expected a startup message, got {}", other),
    };
    let application_name = params.get("application_name").map(|v| v.to_string());
    *startup.lock().unwrap() = Some(params);

    if let Some(err) = options.error {
        codec.send(Message::ErrorResponse(err)).await?;
        return Ok(());
    }

    if options.auth == MockAuth::Cleartext {
        codec.send(Message::AuthenticationCleartextPassword).await?;
        match codec.receive().await? {
            Message::Opaque(frame) if frame.tag() == Tag::PASSWORD_MESSAGE => {
                let mut r = MessageReader::new(&frame);
                *password.lock().unwrap() = Some(r.read_str()?.to_string());
            },
            other => panic!("mock server expected a password message, got {}", other),
        }
    }

    codec.send(Message::AuthenticationOk).await?;
    for (name, value) in &options.parameters {
        codec.send(Message::ParameterStatus { name: name.clone(), value: value.clone() }).await?;
    }
    if let Some(value) = application_name {
        codec.send(Message::ParameterStatus { name: "application_name".to_string(), value }).await?;
    }
    codec.send(Message::BackendKeyData { process_id: TEST_PROCESS_ID, secret_key: TEST_SECRET_KEY }).await?;
    codec.send(Message::ReadyForQuery { status: b'I' }).await?;

    loop {
        let message = match codec.receive().await {
            Ok(message) => message,
            Err(_) => return Ok(()),
        };
        let is_query = matches!(&message, Message::Query { .. });
        let is_terminate = matches!(&message, Message::Terminate);
        received.lock().unwrap().push(message);
        if is_terminate {
            return Ok(());
        }
        if is_query {
            // a minimal but well-formed reply
            let mut mb = MessageBuilder::new(Tag::COMMAND_COMPLETE);
            mb.write_str("SELECT 1");
            mb.add_new(Tag::READY_FOR_QUERY);
            mb.write_byte(b'I');
            codec.send_bytes(mb.finish()).await?;
        }
    }
}

pub fn identity() -> Identity {
    Identity {
        username: TEST_IDENTITY.to_string(),
        expires: Utc::now() + chrono::Duration::hours(1),
    }
}

pub fn session(server: DatabaseServer, checker: Arc<dyn AccessChecker>) -> SessionContext {
    SessionContext::new("test-session-1", Arc::new(server), identity(), checker)
}

pub fn engine(auth_client: Arc<TestAuthClient>, hooks: Arc<RecordingHooks>) -> Engine {
    Engine {
        auth_client,
        token_source: Arc::new(StaticTokenSource),
        cloud_ca_certs: FnvHashMap::default(),
        hooks,
        settings: Settings::default(),
    }
}

/// Accepts a single connection and runs the engine over it, as the
/// reverse-tunnel transport would.
pub async fn spawn_engine(
    engine: Engine,
    session: SessionContext,
    token: CancellationToken,
) -> (SocketAddr, JoinHandle<Result<()>>) {
    let listener = listener().await;
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (conn, _) = listener.accept().await?;
        engine.handle_connection(token, session, conn).await
    });
    (addr, handle)
}

/// Connects a test client to the engine, playing the role of psql behind
/// the proxy.
pub async fn connect_client(addr: SocketAddr) -> FrontendCodec<TcpStream> {
    let tcp = TcpStream::connect(addr).await.expect("couldn't connect to engine");
    FrontendCodec::new(tcp, DEFAULT_RECV_BUFFER_SIZE)
}
