use std::fmt;
use std::fmt::{Display, Formatter, Debug};

use bytes::Bytes;

use crate::pggate::{Error, Result};
use crate::pggate::pg::protocol::{
    Tag, MessageReader, MessageBuilder, PostgresError, ServerParams,
    PROTOCOL_VERSION, SSL_REQUEST, CANCEL_REQUEST, GSSENC_REQUEST,
};
use crate::pggate::pg::protocol::message_parser::MIN_MESSAGE_LEN;

/// One complete tagged wire message: the tag byte, the length frame and
/// the payload, in a single contiguous buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(buf: Bytes) -> Self {
        assert!(buf.len() as u32 >= MIN_MESSAGE_LEN);
        Frame(buf)
    }

    pub fn tag(&self) -> Tag {
        Tag::new_unchecked(self.0[0])
    }

    /// len returns the length of the Frame including tag byte and length field
    pub fn len(&self) -> u32 {
        self.0.len() as u32
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Offset of the payload past the tag byte and length field.
    pub fn body_start(&self) -> u32 {
        5
    }

    pub fn body(&self) -> &[u8] {
        &self.0[5..]
    }

    /// into_bytes consumes the Frame and returns the underlying Bytes buffer
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}({} bytes)", self.tag(), self.len()))
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

const AUTH_OK: i32 = 0;
const AUTH_CLEARTEXT_PASSWORD: i32 = 3;
const AUTH_MD5_PASSWORD: i32 = 5;
const AUTH_SASL: i32 = 10;

/// The tagged message union. Only the kinds the gateway synthesizes or
/// inspects are decoded; everything else stays an opaque frame that is
/// forwarded byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    AuthenticationSasl,
    BackendKeyData { process_id: i32, secret_key: i32 },
    ParameterStatus { name: String, value: String },
    ReadyForQuery { status: u8 },
    ErrorResponse(PostgresError),
    NoticeResponse(PostgresError),
    Query { sql: String },
    Terminate,
    PasswordMessage { password: String },
    Opaque(Frame),
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Message::AuthenticationOk
            | Message::AuthenticationCleartextPassword
            | Message::AuthenticationMd5Password { .. }
            | Message::AuthenticationSasl => Tag::AUTHENTICATION,
            Message::BackendKeyData { .. } => Tag::BACKEND_KEY_DATA,
            Message::ParameterStatus { .. } => Tag::PARAMETER_STATUS,
            Message::ReadyForQuery { .. } => Tag::READY_FOR_QUERY,
            Message::ErrorResponse(_) => Tag::ERROR_RESPONSE,
            Message::NoticeResponse(_) => Tag::NOTICE_RESPONSE,
            Message::Query { .. } => Tag::QUERY,
            Message::Terminate => Tag::TERMINATE,
            Message::PasswordMessage { .. } => Tag::PASSWORD_MESSAGE,
            Message::Opaque(frame) => frame.tag(),
        }
    }

    /// Decodes a message received from a server (the backend half of the
    /// wire). Kinds the gateway does not inspect decode as Opaque.
    pub fn decode_backend(frame: Frame) -> Result<Message> {
        match frame.tag() {
            Tag::AUTHENTICATION => {
                let mut r = MessageReader::new(&frame);
                let code = r.read_i32();
                r.error()?;
                match code {
                    AUTH_OK => Ok(Message::AuthenticationOk),
                    AUTH_CLEARTEXT_PASSWORD => Ok(Message::AuthenticationCleartextPassword),
                    AUTH_MD5_PASSWORD => {
                        let salt = r.read_bytes(4)?;
                        Ok(Message::AuthenticationMd5Password { salt: salt.try_into().unwrap() })
                    },
                    AUTH_SASL => Ok(Message::AuthenticationSasl),
                    _ => Ok(Message::Opaque(frame)),
                }
            },
            Tag::BACKEND_KEY_DATA => {
                let mut r = MessageReader::new(&frame);
                let process_id = r.read_i32();
                let secret_key = r.read_i32();
                r.error()?;
                Ok(Message::BackendKeyData { process_id, secret_key })
            },
            Tag::PARAMETER_STATUS => {
                let mut r = MessageReader::new(&frame);
                let name = r.read_str()?.to_string();
                let value = r.read_str()?.to_string();
                Ok(Message::ParameterStatus { name, value })
            },
            Tag::READY_FOR_QUERY => {
                let mut r = MessageReader::new(&frame);
                let status = r.read_byte();
                r.error()?;
                Ok(Message::ReadyForQuery { status })
            },
            Tag::ERROR_RESPONSE => Ok(Message::ErrorResponse(PostgresError::parse(&frame)?)),
            Tag::NOTICE_RESPONSE => Ok(Message::NoticeResponse(PostgresError::parse(&frame)?)),
            _ => Ok(Message::Opaque(frame)),
        }
    }

    /// Decodes a message received from a client (the frontend half of the
    /// wire). Only Query and Terminate are inspected by the gateway.
    pub fn decode_frontend(frame: Frame) -> Result<Message> {
        match frame.tag() {
            Tag::QUERY => {
                let mut r = MessageReader::new(&frame);
                let sql = r.read_str()?.to_string();
                Ok(Message::Query { sql })
            },
            Tag::TERMINATE => Ok(Message::Terminate),
            _ => Ok(Message::Opaque(frame)),
        }
    }

    /// Serializes the message. For Opaque this returns the original frame
    /// bytes untouched, for all other kinds the canonical encoding.
    pub fn encode(&self) -> Bytes {
        if let Message::Opaque(frame) = self {
            return frame.clone().into_bytes();
        }
        let mut mb = MessageBuilder::new(self.tag());
        match self {
            Message::AuthenticationOk => mb.write_i32(AUTH_OK),
            Message::AuthenticationCleartextPassword => mb.write_i32(AUTH_CLEARTEXT_PASSWORD),
            Message::AuthenticationMd5Password { salt } => {
                mb.write_i32(AUTH_MD5_PASSWORD);
                mb.write_bytes(salt);
            },
            Message::AuthenticationSasl => {
                mb.write_i32(AUTH_SASL);
                mb.write_byte(0);
            },
            Message::BackendKeyData { process_id, secret_key } => {
                mb.write_i32(*process_id);
                mb.write_i32(*secret_key);
            },
            Message::ParameterStatus { name, value } => {
                mb.write_str(name);
                mb.write_str(value);
            },
            Message::ReadyForQuery { status } => mb.write_byte(*status),
            Message::ErrorResponse(err) | Message::NoticeResponse(err) => err.write(&mut mb),
            Message::Query { sql } => mb.write_str(sql),
            Message::Terminate => {},
            Message::PasswordMessage { password } => mb.write_str(password),
            Message::Opaque(_) => unreachable!(),
        }
        mb.finish()
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.tag(), f)
    }
}

/// The untagged startup family a client opens the wire with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupRequest {
    Startup(ServerParams),
    Cancel { process_id: i32, secret_key: i32 },
    SslRequest,
    GssEncRequest,
}

impl StartupRequest {
    /// Parses the body of an untagged message: the protocol version or
    /// special code followed by the payload.
    pub fn parse(body: &Bytes) -> Result<StartupRequest> {
        if body.len() < 4 {
            return Err(Error::protocol_error("startup message too short"));
        }
        let code = i32::from_be_bytes(body[..4].try_into().unwrap());
        match code {
            PROTOCOL_VERSION => Self::parse_params(&body[4..]),
            SSL_REQUEST => Ok(StartupRequest::SslRequest),
            GSSENC_REQUEST => Ok(StartupRequest::GssEncRequest),
            CANCEL_REQUEST => {
                if body.len() < 12 {
                    return Err(Error::protocol_error("cancel request too short"));
                }
                Ok(StartupRequest::Cancel {
                    process_id: i32::from_be_bytes(body[4..8].try_into().unwrap()),
                    secret_key: i32::from_be_bytes(body[8..12].try_into().unwrap()),
                })
            },
            _ => Err(Error::protocol_error(format!("unsupported protocol version {}", code))),
        }
    }

    fn parse_params(mut payload: &[u8]) -> Result<StartupRequest> {
        let mut params = ServerParams::new();
        loop {
            let (key, rest) = read_cstr(payload)?;
            if key.is_empty() {
                // terminating nul of the parameter list
                return Ok(StartupRequest::Startup(params));
            }
            let (value, rest) = read_cstr(rest)?;
            params.add(key, value);
            payload = rest;
        }
    }
}

fn read_cstr(bytes: &[u8]) -> Result<(&str, &[u8])> {
    match memchr::memchr(0, bytes) {
        Some(i) => Ok((std::str::from_utf8(&bytes[..i])?, &bytes[i + 1..])),
        None => Err(Error::protocol_error("unterminated string in startup message")),
    }
}

impl Display for StartupRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StartupRequest::Startup(_) => f.write_str("startup message"),
            StartupRequest::Cancel { .. } => f.write_str("cancel request"),
            StartupRequest::SslRequest => f.write_str("SSL request"),
            StartupRequest::GssEncRequest => f.write_str("GSSAPI encryption request"),
        }
    }
}
