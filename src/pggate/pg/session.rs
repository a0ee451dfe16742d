use std::fmt;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::pggate::{Error, Result};
use crate::pggate::pg::protocol::ServerParams;

/// The record describing one target database server.
#[derive(Clone, Debug)]
pub struct DatabaseServer {
    name: String,
    uri: String,
    region: String,
    ca_cert: Option<Vec<u8>>,
    kind: ServerKind,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ServerKind {
    /// A self-hosted instance the gateway authenticates to with a client
    /// certificate signed by the cluster host CA.
    SelfHosted,
    /// A managed RDS/Aurora instance requiring TLS with a vendor-rooted CA
    /// and a short-lived IAM-derived password.
    Rds,
}

impl DatabaseServer {
    pub fn self_hosted(name: &str, uri: &str) -> Self {
        DatabaseServer {
            name: name.to_string(),
            uri: uri.to_string(),
            region: String::new(),
            ca_cert: None,
            kind: ServerKind::SelfHosted,
        }
    }

    pub fn rds(name: &str, uri: &str, region: &str) -> Self {
        DatabaseServer {
            name: name.to_string(),
            uri: uri.to_string(),
            region: region.to_string(),
            ca_cert: None,
            kind: ServerKind::Rds,
        }
    }

    /// Attaches a PEM CA bundle trusted for this specific server.
    pub fn with_ca_cert(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert = Some(pem);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host:port endpoint of the database instance.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn ca_cert(&self) -> Option<&[u8]> {
        self.ca_cert.as_deref()
    }

    pub fn is_rds(&self) -> bool {
        self.kind == ServerKind::Rds
    }

    /// Splits the URI into host and port, defaulting to the Postgres port.
    pub fn host_port(&self) -> Result<(&str, u16)> {
        match self.uri.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>()
                    .map_err(|_| Error::bad_parameter(format!("invalid port in server URI {:?}", self.uri)))?;
                Ok((host, port))
            },
            None if !self.uri.is_empty() => Ok((self.uri.as_str(), 5432)),
            _ => Err(Error::bad_parameter(format!("invalid server URI {:?}", self.uri))),
        }
    }
}

impl Display for DatabaseServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}({})", self.name, self.uri))
    }
}

/// The authenticated cluster identity of the connecting user.
#[derive(Clone, Debug)]
pub struct Identity {
    /// Cluster username, distinct from the requested database user.
    pub username: String,
    /// When the identity's credentials expire. Bounds the TTL of any
    /// certificate issued on the session's behalf.
    pub expires: DateTime<Utc>,
}

/// Role-based predicate evaluating whether an identity may reach a
/// database as a particular database user.
#[async_trait]
pub trait AccessChecker: Send + Sync {
    async fn check_access(
        &self,
        server: &DatabaseServer,
        database_name: &str,
        database_user: &str,
        identity: &Identity,
    ) -> Result<()>;
}

/// Combines parameters for a database connection session.
///
/// Mutated only while the startup message is handled, read-only and
/// shareable across the relay tasks afterwards.
pub struct SessionContext {
    /// The unique session ID.
    pub id: String,
    /// The database server handling the connection.
    pub server: Arc<DatabaseServer>,
    /// The identity of the connecting cluster user.
    pub identity: Identity,
    /// The access checker for the identity.
    pub checker: Arc<dyn AccessChecker>,
    /// The requested database user.
    pub database_user: String,
    /// The requested database name.
    pub database_name: String,
    /// Initial connection parameters such as date style, relayed to the
    /// upstream. Never contains the user or database entries.
    pub startup_parameters: ServerParams,
}

impl SessionContext {
    pub fn new(
        id: &str,
        server: Arc<DatabaseServer>,
        identity: Identity,
        checker: Arc<dyn AccessChecker>,
    ) -> Self {
        SessionContext {
            id: id.to_string(),
            server,
            identity,
            checker,
            database_user: String::new(),
            database_name: String::new(),
            startup_parameters: ServerParams::new(),
        }
    }
}

impl Display for SessionContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("db[{}] identity[{}] dbUser[{}] dbName[{}]",
            self.server.name(), self.identity.username, self.database_user, self.database_name))
    }
}
