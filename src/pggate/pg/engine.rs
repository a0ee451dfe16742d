use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use fnv::FnvHashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::pggate::{Error, ErrorKind, Result};
use crate::pggate::config::Settings;
use crate::pggate::pg::cert::AuthClient;
use crate::pggate::pg::codec::{BackendCodec, FrontendCodec};
use crate::pggate::pg::protocol::{Message, MessageBuilder, PostgresError, StartupRequest, Tag};
use crate::pggate::pg::relay::{run_client_pump, run_server_pump};
use crate::pggate::pg::upstream::{Connector, TokenSource, UpstreamConn};
use crate::pggate::pg::SessionContext;

/// Transaction status reported to the client with ReadyForQuery.
const TRANSACTION_IDLE: u8 = 'I' as u8;

/// Audit callbacks invoked on session lifecycle events.
///
/// Hooks are called from the engine or pump task that triggered them and
/// must be safe to call without holding a lock.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Called once per session: with no error when the session reached the
    /// ready state, with the denial cause when it was rejected.
    async fn on_session_start(&self, session: &SessionContext, error: Option<&Error>) -> Result<()>;
    /// Called when a session that started successfully ends.
    async fn on_session_end(&self, session: &SessionContext) -> Result<()>;
    /// Called for every Query message issued on the connection.
    async fn on_query(&self, session: &SessionContext, sql: &str) -> Result<()>;
}

/// Engine implements the Postgres gateway service: it takes client
/// connections delivered by the trusted proxy and acts as a middleman
/// between the client and the target database instance, intercepting and
/// interpreting all protocol messages in both directions.
pub struct Engine {
    /// The cluster auth server signing ephemeral database certificates.
    pub auth_client: Arc<dyn AuthClient>,
    /// Derives IAM tokens used as passwords for managed-cloud databases.
    pub token_source: Arc<dyn TokenSource>,
    /// Managed-cloud root certificates, PEM, indexed by region.
    pub cloud_ca_certs: FnvHashMap<String, Vec<u8>>,
    /// The audit sink.
    pub hooks: Arc<dyn SessionHooks>,
    pub settings: Settings,
}

/// Converts the provided error to a Postgres wire protocol error message
/// so a native client such as psql can display it appropriately.
pub fn to_error_response(err: &Error) -> Message {
    match err.as_postgres() {
        Some(pg) => Message::ErrorResponse(pg.clone()),
        None => Message::ErrorResponse(PostgresError::message_only(&err.to_string())),
    }
}

impl Engine {
    /// Processes one connection coming from the proxy.
    ///
    /// Handles all necessary startup actions and authorization, then
    /// relays messages between the client and the database until either
    /// side terminates or the session token is canceled. Failures before
    /// the client saw ReadyForQuery are surfaced on its wire as an
    /// ErrorResponse; cancellation and clean termination return Ok.
    pub async fn handle_connection<S>(
        &self,
        token: CancellationToken,
        mut session: SessionContext,
        client_conn: S,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut client = BackendCodec::new(client_conn, self.settings.recv_buffer_size as usize);
        let upstream = match self.open_session(&token, &mut session, &mut client).await {
            Ok(upstream) => upstream,
            Err(e) => {
                if *e.kind() == ErrorKind::Canceled {
                    return Ok(());
                }
                // best effort: a secondary send failure must not mask the
                // original error
                if let Err(send_err) = client.send(to_error_response(&e)).await {
                    error!(session = %session, %send_err, "failed to send error to client");
                }
                return Err(e);
            },
        };
        self.run_session(token, Arc::new(session), client, upstream).await
    }

    /// Runs the session up to the point where the client is told it can
    /// issue queries: startup, access check, upstream connect, handshake.
    async fn open_session<S>(
        &self,
        token: &CancellationToken,
        session: &mut SessionContext,
        client: &mut BackendCodec<S>,
    ) -> Result<(FrontendCodec<TlsStream<TcpStream>>, UpstreamConn)>
    where
        S: AsyncRead + AsyncWrite,
    {
        // The proxy passes the startup message it received from the psql
        // client over to us, wait for it and extract the database and
        // username from it.
        cancellable(token, self.handle_startup(session, client)).await?;
        // Now that we know which database/username the user is connecting
        // to, perform an authorization check.
        cancellable(token, self.check_access(session)).await?;
        // This is where we connect to the actual Postgres database.
        let upstream = cancellable(token, self.connect(session)).await?;
        // Cancellation from here on abandons the handshake, the transport
        // is being torn down anyway.
        self.make_client_ready(client, &upstream.1).await?;
        Ok(upstream)
    }

    /// Receives the startup message and populates the session context with
    /// the connection parameters.
    pub(crate) async fn handle_startup<S>(
        &self,
        session: &mut SessionContext,
        client: &mut BackendCodec<S>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        let params = match client.receive_startup().await? {
            StartupRequest::Startup(params) => params,
            other => return Err(Error::bad_parameter(format!("expected a startup message, got {}", other))),
        };
        // Pass the client's startup parameters along (this is how it sets
        // its default date style for example), but pull out the database
        // name and user.
        for (key, value) in params.iter() {
            match key {
                "database" => session.database_name = value.to_string(),
                "user" => session.database_user = value.to_string(),
                _ => session.startup_parameters.add(key, value),
            }
        }
        if session.database_user.is_empty() {
            return Err(Error::bad_parameter("startup message does not carry a user"));
        }
        if session.database_name.is_empty() {
            return Err(Error::bad_parameter("startup message does not carry a database"));
        }
        debug!(session = %session, "handled startup");
        Ok(())
    }

    async fn check_access(&self, session: &SessionContext) -> Result<()> {
        if let Err(e) = session.checker
            .check_access(&session.server, &session.database_name, &session.database_user, &session.identity)
            .await
        {
            if let Err(audit_err) = self.hooks.on_session_start(session, Some(&e)).await {
                error!(session = %session, %audit_err, "failed to emit session start event");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn connect(&self, session: &SessionContext) -> Result<(FrontendCodec<TlsStream<TcpStream>>, UpstreamConn)> {
        let connector = Connector {
            auth_client: self.auth_client.as_ref(),
            token_source: self.token_source.as_ref(),
            cloud_ca_certs: &self.cloud_ca_certs,
            key_algorithm: self.settings.key_algorithm,
            recv_buffer_size: self.settings.recv_buffer_size as usize,
        };
        connector.connect(session).await
    }

    /// Indicates to the Postgres client that the server is ready to accept
    /// messages: the point where the psql prompt appears on the other side.
    async fn make_client_ready<S>(&self, client: &mut BackendCodec<S>, conn: &UpstreamConn) -> Result<()>
    where
        S: AsyncRead + AsyncWrite,
    {
        // AuthenticationOk: the (already completed) authentication
        // succeeded. BackendKeyData: the upstream's secret-key data the
        // client must save to issue cancel requests later. ParameterStatus:
        // parameters reported by the server, such as the server version.
        // ReadyForQuery: startup is complete, commands can be issued.
        let mut mb = MessageBuilder::new(Tag::AUTHENTICATION);
        mb.write_i32(0); // AuthenticationOk
        mb.add_new(Tag::BACKEND_KEY_DATA);
        mb.write_i32(conn.process_id());
        mb.write_i32(conn.secret_key());
        for (key, value) in conn.parameters().iter() {
            mb.add_new(Tag::PARAMETER_STATUS);
            mb.write_str(key);
            mb.write_str(value);
        }
        mb.add_new(Tag::READY_FOR_QUERY);
        mb.write_byte(TRANSACTION_IDLE);
        client.send_bytes(mb.finish()).await
    }

    /// Launches the message exchange relaying all intercepted messages
    /// between the client and the database server.
    async fn run_session<S>(
        &self,
        token: CancellationToken,
        session: Arc<SessionContext>,
        client: BackendCodec<S>,
        upstream: (FrontendCodec<TlsStream<TcpStream>>, UpstreamConn),
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (server, conn) = upstream;
        if let Err(e) = self.hooks.on_session_start(&session, None).await {
            conn.close();
            return Err(e);
        }

        let (client_reader, client_writer) = client.split();
        let (server_reader, server_writer) = server.split();
        let (client_tx, mut client_rx) = mpsc::channel(1);
        let (server_tx, mut server_rx) = mpsc::channel(1);
        let client_pump = tokio::spawn(run_client_pump(
            client_reader, server_writer, session.clone(), self.hooks.clone(), client_tx));
        let server_pump = tokio::spawn(run_server_pump(
            server_reader, client_writer, conn.clone(), session.clone(), server_tx));

        let result = tokio::select! {
            r = client_rx.recv() => {
                debug!(session = %session.id, "client done");
                r.unwrap_or(Ok(()))
            },
            r = server_rx.recv() => {
                debug!(session = %session.id, "server done");
                r.unwrap_or(Ok(()))
            },
            _ = token.cancelled() => {
                debug!(session = %session.id, "session canceled");
                Ok(())
            },
        };

        if let Err(e) = self.hooks.on_session_end(&session).await {
            error!(session = %session.id, %e, "failed to emit session end event");
        }
        // Mark the upstream closed so the surviving pump reports a clean
        // exit, then drop both pumps, which tears down the sockets.
        conn.close();
        client_pump.abort();
        server_pump.abort();
        result
    }
}

/// Runs the future to completion unless the session token fires first.
async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = token.cancelled() => Err(Error::canceled()),
        r = fut => r,
    }
}
