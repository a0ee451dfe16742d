use std::fmt::{Debug, Display};
use std::{fmt, io, result};
use std::net::AddrParseError;

use crate::pggate::pg::protocol::PostgresError;

#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    err: Box<ErrorKind>, // use a Box to keep the Result type smaller
}

#[derive(Debug)]
pub enum ErrorKind {
    /// A malformed or incomplete request: bad startup message, missing
    /// connect parameters, unusable CA material, expired identity.
    BadParameter(String),
    /// The access checker rejected the (server, database, user) tuple.
    AccessDenied(String),
    /// The database reported an error on its wire (severity/code preserved).
    Postgres(PostgresError),
    /// Framing violated the PostgreSQL v3 protocol.
    Protocol(String),
    /// The session cancellation token fired.
    Canceled,
    /// The peer closed the connection at a message boundary.
    Closed,
    StringError(String),
    IOError(io::Error),
    TlsError(rustls::Error),
    CertError(rcgen::Error),
    YAMLError(serde_yaml::Error),
    UTF8Error(std::str::Utf8Error),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(s.to_string())),
        }
    }

    pub fn bad_parameter<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::BadParameter(s.to_string())),
        }
    }

    pub fn access_denied<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::AccessDenied(s.to_string())),
        }
    }

    pub fn protocol_error<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::Protocol(s.to_string())),
        }
    }

    pub fn postgres(err: PostgresError) -> Self {
        Error {
            err: Box::new(ErrorKind::Postgres(err)),
        }
    }

    pub fn canceled() -> Self {
        Error {
            err: Box::new(ErrorKind::Canceled),
        }
    }

    pub fn closed() -> Self {
        Error {
            err: Box::new(ErrorKind::Closed),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    /// Returns the database-origin error carried by this error, if any.
    pub fn as_postgres(&self) -> Option<&PostgresError> {
        match self.kind() {
            ErrorKind::Postgres(pg) => Some(pg),
            _ => None,
        }
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(String::from(err))),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::IOError(err)),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::TlsError(err)),
        }
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::CertError(err)),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::YAMLError(err)),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error {
            err: Box::new(ErrorKind::UTF8Error(err)),
        }
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::new(err)
    }
}

impl From<PostgresError> for Error {
    fn from(err: PostgresError) -> Self {
        Error::postgres(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        std::fmt::Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::BadParameter(s) => f.write_str(s),
            ErrorKind::AccessDenied(s) => f.write_str(s),
            ErrorKind::Postgres(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::Protocol(s) => f.write_str(s),
            ErrorKind::Canceled => f.write_str("session canceled"),
            ErrorKind::Closed => f.write_str("connection is closed"),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::IOError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::TlsError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::CertError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::YAMLError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::UTF8Error(e) => std::fmt::Display::fmt(&e, f),
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ErrorKind {}
