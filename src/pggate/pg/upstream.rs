use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Release};

use fnv::FnvHashMap;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

use crate::pggate::{Error, Result};
use crate::pggate::config::KeyAlgorithm;
use crate::pggate::pg::codec::FrontendCodec;
use crate::pggate::pg::cert::{issue_client_cert, AuthClient, ClientCertBundle};
use crate::pggate::pg::protocol::{
    Message, MessageBuilder, ServerParams, Tag, SSL_ALLOWED, SSL_NOT_ALLOWED, SSL_REQUEST,
};
use crate::pggate::pg::SessionContext;

/// Derives the short-lived IAM token used as the password for a
/// managed-cloud database. Injected at engine construction; the gateway
/// treats the token as opaque and never caches it.
pub trait TokenSource: Send + Sync {
    fn auth_token(&self, host: &str, region: &str, user: &str) -> Result<String>;
}

/// The connection-level view of an established upstream session: the
/// backend's cancel-request key data and reported parameters. Shares its
/// socket with the message-level FrontendCodec produced alongside it.
#[derive(Clone)]
pub struct UpstreamConn {
    process_id: i32,
    secret_key: i32,
    parameters: ServerParams,
    closed: Arc<AtomicBool>,
}

impl UpstreamConn {
    fn new(process_id: i32, secret_key: i32, parameters: ServerParams) -> Self {
        UpstreamConn {
            process_id,
            secret_key,
            parameters,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    /// Parameters reported by the server during startup (server version,
    /// encoding, ...), relayed back to the client.
    pub fn parameters(&self) -> &ServerParams {
        &self.parameters
    }

    /// Marks the upstream connection closed. The socket itself is torn
    /// down when the owning codec halves are dropped.
    pub fn close(&self) {
        self.closed.store(true, Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }
}

/// TLS client material resolved for one upstream connect. Two modes: a
/// managed-cloud server gets vendor roots and an IAM-token password, a
/// self-hosted server gets a freshly issued client certificate with the
/// issuing CAs as trust roots.
pub struct TlsMaterials {
    pub server_name: ServerName<'static>,
    pub roots: RootCertStore,
    pub client_cert: Option<ClientCertBundle>,
    pub password: Option<String>,
}

impl TlsMaterials {
    pub(crate) fn into_client_config(self) -> Result<(Arc<ClientConfig>, ServerName<'static>, Option<String>)> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.roots);
        let config = match self.client_cert {
            Some(bundle) => builder.with_client_auth_cert(bundle.cert_chain, bundle.key)?,
            None => builder.with_no_client_auth(),
        };
        Ok((Arc::new(config), self.server_name, self.password))
    }
}

/// Dials the database instance for a session.
pub(crate) struct Connector<'a> {
    pub auth_client: &'a dyn AuthClient,
    pub token_source: &'a dyn TokenSource,
    pub cloud_ca_certs: &'a FnvHashMap<String, Vec<u8>>,
    pub key_algorithm: KeyAlgorithm,
    pub recv_buffer_size: usize,
}

impl Connector<'_> {
    /// Establishes the authenticated connection to the database instance
    /// and returns the message-level codec together with the
    /// connection-level handle, both over the same socket.
    pub async fn connect(&self, session: &SessionContext) -> Result<(FrontendCodec<TlsStream<TcpStream>>, UpstreamConn)> {
        let (host, port) = session.server.host_port()?;
        let materials = self.tls_materials(session).await?;
        let (config, server_name, password) = materials.into_client_config()?;

        debug!(session = %session, host, port, "connecting to database");
        let mut tcp = TcpStream::connect((host, port)).await?;
        // Explicit SSLRequest. A server refusing TLS is a hard failure,
        // the gateway never retries in plaintext.
        request_tls(&mut tcp).await?;
        let tls = TlsConnector::from(config).connect(server_name, tcp).await?;

        let mut codec = FrontendCodec::new(tls, self.recv_buffer_size);
        codec.send_startup(&session.database_user, &session.database_name, &session.startup_parameters).await?;
        authenticate(&mut codec, session, password.as_deref()).await?;
        let conn = read_startup_response(&mut codec).await?;
        debug!(session = %session, process_id = conn.process_id(), "connected to database");
        Ok((codec, conn))
    }

    /// Resolves the TLS client material for the session's server record.
    pub(crate) async fn tls_materials(&self, session: &SessionContext) -> Result<TlsMaterials> {
        let (host, _) = session.server.host_port()?;
        let server_name = ServerName::try_from(host)
            .map_err(|_| Error::bad_parameter(format!("invalid server name {:?}", host)))?
            .to_owned();

        let mut roots = RootCertStore::empty();
        // A CA bundle pinned on the server record always wins. Otherwise a
        // managed-cloud server falls back to the region-indexed roots; a
        // missing region leaves the pool empty and the connection fails at
        // TLS verification.
        if let Some(pem) = session.server.ca_cert() {
            add_pem_to_roots(&mut roots, pem)?;
        } else if session.server.is_rds() {
            match self.cloud_ca_certs.get(session.server.region()) {
                Some(pem) => add_pem_to_roots(&mut roots, pem)?,
                None => warn!(server = %session.server, "no cloud CA certificate for region"),
            }
        }

        if session.server.is_rds() {
            // Managed cloud authenticates with an IAM token as the
            // password, no client certificate.
            let password = self.token_source.auth_token(host, session.server.region(), &session.database_user)?;
            return Ok(TlsMaterials { server_name, roots, client_cert: None, password: Some(password) });
        }

        // Self-hosted: a fresh client certificate bounded by the identity's
        // remaining validity. The instance is expected to trust the CAs
        // returned by the issuing authority.
        let bundle = issue_client_cert(self.auth_client, self.key_algorithm, session).await?;
        for ca in &bundle.ca_certs {
            add_pem_to_roots(&mut roots, ca)?;
        }
        Ok(TlsMaterials { server_name, roots, client_cert: Some(bundle), password: None })
    }
}

fn add_pem_to_roots(roots: &mut RootCertStore, pem: &[u8]) -> Result<()> {
    let mut reader = pem;
    let mut added = false;
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert?)
            .map_err(|e| Error::bad_parameter(format!("failed to append CA certificate to the pool: {}", e)))?;
        added = true;
    }
    if !added {
        return Err(Error::bad_parameter("failed to append CA certificate to the pool"));
    }
    Ok(())
}

async fn request_tls(stream: &mut TcpStream) -> Result<()> {
    let mut mb = MessageBuilder::new(Tag::UNTAGGED);
    mb.write_i32(SSL_REQUEST);
    stream.write_all(&mb.finish()).await?;
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await?;
    match answer[0] {
        SSL_ALLOWED => Ok(()),
        SSL_NOT_ALLOWED => Err(Error::new("database server refused a TLS connection")),
        b => Err(Error::protocol_error(format!("unexpected response {:?} to SSL request", b as char))),
    }
}

/// Completes the authentication request the server opens with. The
/// password is the IAM token on managed cloud; a self-hosted instance
/// doing certificate auth sends AuthenticationOk directly.
async fn authenticate(
    codec: &mut FrontendCodec<TlsStream<TcpStream>>,
    session: &SessionContext,
    password: Option<&str>,
) -> Result<()> {
    loop {
        match codec.receive().await? {
            Message::AuthenticationOk => return Ok(()),
            Message::AuthenticationCleartextPassword => {
                let password = required_password(session, password)?.to_string();
                codec.send(Message::PasswordMessage { password }).await?;
            },
            Message::AuthenticationMd5Password { salt } => {
                let password = md5_password(&session.database_user, required_password(session, password)?, &salt);
                codec.send(Message::PasswordMessage { password }).await?;
            },
            Message::AuthenticationSasl => {
                return Err(Error::new(format!(
                    "database {} requested SASL authentication, which is not supported for proxied sessions",
                    session.server)));
            },
            Message::ErrorResponse(err) => return Err(Error::postgres(err)),
            Message::NoticeResponse(notice) => debug!(%notice, "notice during authentication"),
            other => return Err(Error::protocol_error(format!("unexpected {} message during authentication", other))),
        }
    }
}

fn required_password<'a>(session: &SessionContext, password: Option<&'a str>) -> Result<&'a str> {
    password.ok_or_else(|| Error::new(format!(
        "database {} requested a password but the session authenticates with a client certificate",
        session.server)))
}

/// Salted double-md5 as defined by the Postgres password protocol.
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let first = md5::compute(format!("{}{}", password, user));
    let mut salted = format!("{:x}", first).into_bytes();
    salted.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&salted))
}

/// Consumes the server's startup responses up to ReadyForQuery, keeping
/// the parameters and key data the client will need.
async fn read_startup_response(codec: &mut FrontendCodec<TlsStream<TcpStream>>) -> Result<UpstreamConn> {
    let mut parameters = ServerParams::new();
    let mut process_id = 0;
    let mut secret_key = 0;
    loop {
        match codec.receive().await? {
            Message::ParameterStatus { name, value } => parameters.add(&name, &value),
            Message::BackendKeyData { process_id: pid, secret_key: key } => {
                process_id = pid;
                secret_key = key;
            },
            Message::ReadyForQuery { .. } => return Ok(UpstreamConn::new(process_id, secret_key, parameters)),
            Message::NoticeResponse(notice) => debug!(%notice, "notice during startup"),
            Message::ErrorResponse(err) => return Err(Error::postgres(err)),
            other => return Err(Error::protocol_error(format!("unexpected {} message during startup", other))),
        }
    }
}
