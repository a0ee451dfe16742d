use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::pggate::{ErrorKind, Result};
use crate::pggate::pg::codec::{BackendReader, BackendWriter, FrontendReader, FrontendWriter};
use crate::pggate::pg::engine::SessionHooks;
use crate::pggate::pg::protocol::Message;
use crate::pggate::pg::upstream::UpstreamConn;
use crate::pggate::pg::SessionContext;

/// Receives messages from the client and relays them to the server,
/// invoking the query audit hook along the way. A Terminate ends the pump
/// cleanly without being forwarded; closing the upstream is the
/// coordinator's job.
pub(crate) async fn run_client_pump<C, S>(
    mut client: BackendReader<C>,
    mut server: FrontendWriter<S>,
    session: Arc<SessionContext>,
    hooks: Arc<dyn SessionHooks>,
    done: mpsc::Sender<Result<()>>,
) where
    C: AsyncRead + Send,
    S: AsyncWrite + Send,
{
    let result = loop {
        let message = match client.receive().await {
            Ok(message) => message,
            Err(e) => {
                debug!(session = %session.id, %e, "failed to receive message from client");
                break Err(e);
            },
        };
        match &message {
            Message::Query { sql } => {
                if let Err(e) = hooks.on_query(&session, sql).await {
                    warn!(session = %session.id, %e, "failed to emit query audit event");
                }
            },
            Message::Terminate => break Ok(()),
            _ => {},
        }
        if let Err(e) = server.send(message).await {
            debug!(session = %session.id, %e, "failed to send message to server");
            break Err(e);
        }
    };
    debug!(session = %session.id, "stop receiving from client");
    let _ = done.send(result).await;
}

/// Receives messages from the server and relays them back to the client.
/// A receive failure on an upstream that was closed, or a clean
/// end-of-stream, counts as normal completion.
pub(crate) async fn run_server_pump<S, C>(
    mut server: FrontendReader<S>,
    mut client: BackendWriter<C>,
    conn: UpstreamConn,
    session: Arc<SessionContext>,
    done: mpsc::Sender<Result<()>>,
) where
    S: AsyncRead + Send,
    C: AsyncWrite + Send,
{
    let result = loop {
        let message = match server.receive().await {
            Ok(message) => message,
            Err(e) => {
                if conn.is_closed() || *e.kind() == ErrorKind::Closed {
                    debug!(session = %session.id, "server connection closed");
                    break Ok(());
                }
                debug!(session = %session.id, %e, "failed to receive message from server");
                break Err(e);
            },
        };
        if let Err(e) = client.send(message).await {
            debug!(session = %session.id, %e, "failed to send message to client");
            break Err(e);
        }
    };
    debug!(session = %session.id, "stop receiving from server");
    let _ = done.send(result).await;
}
