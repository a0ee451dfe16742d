use std::fmt::{Display, Formatter, Debug};

use crate::pggate::{Error, Result};

pub const SSL_ALLOWED: u8 = 'S' as u8;
pub const SSL_NOT_ALLOWED: u8 = 'N' as u8;
pub const PROTOCOL_VERSION: i32 = 196608;
pub const SSL_REQUEST: i32 = 80877103;
pub const CANCEL_REQUEST: i32 = 80877102;
pub const GSSENC_REQUEST: i32 = 80877104;

// Tag defines the Postgres protocol message type tag bytes
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct Tag(u8);

impl Tag {
    pub const UNTAGGED: Tag = Tag(0);
    // includes Startup, CancelRequest, SSLRequest, GSSENCRequest
    // Frontend
    pub const BIND: Tag = Tag::new_unchecked('B' as u8);
    pub const CLOSE: Tag = Tag::new_unchecked('C' as u8);
    // close prepared statement or portal
    pub const COPY_FAIL: Tag = Tag::new_unchecked('f' as u8);
    pub const DESCRIBE: Tag = Tag::new_unchecked('D' as u8);
    pub const EXECUTE: Tag = Tag::new_unchecked('E' as u8);
    pub const FLUSH: Tag = Tag::new_unchecked('H' as u8);
    pub const FUNCTION_CALL: Tag = Tag::new_unchecked('F' as u8);
    pub const PARSE: Tag = Tag::new_unchecked('P' as u8);
    pub const PASSWORD_MESSAGE: Tag = Tag::new_unchecked('p' as u8);
    // also used for GSSAPI, SSPI and SASL
    pub const QUERY: Tag = Tag::new_unchecked('Q' as u8);
    pub const SYNC: Tag = Tag::new_unchecked('S' as u8);
    pub const TERMINATE: Tag = Tag::new_unchecked('X' as u8);
    // Frontend + Backend
    pub const COPY_DATA: Tag = Tag::new_unchecked('d' as u8);
    pub const COPY_DONE: Tag = Tag::new_unchecked('c' as u8);
    // Backend
    pub const AUTHENTICATION: Tag = Tag::new_unchecked('R' as u8);
    // one of AuthenticationOk, AuthenticationCleartextPassword, AuthenticationMD5Password,
    // AuthenticationSASL, AuthenticationSASLContinue, AuthenticationSASLFinal, ...
    pub const BACKEND_KEY_DATA: Tag = Tag::new_unchecked('K' as u8);
    pub const BIND_COMPLETE: Tag = Tag::new_unchecked('2' as u8);
    pub const CLOSE_COMPLETE: Tag = Tag::new_unchecked('3' as u8);
    pub const COMMAND_COMPLETE: Tag = Tag::new_unchecked('C' as u8);
    pub const COPY_IN_RESPONSE: Tag = Tag::new_unchecked('G' as u8);
    pub const COPY_OUT_RESPONSE: Tag = Tag::new_unchecked('H' as u8);
    pub const COPY_BOTH_RESPONSE: Tag = Tag::new_unchecked('W' as u8);
    pub const DATA_ROW: Tag = Tag::new_unchecked('D' as u8);
    pub const EMPTY_QUERY: Tag = Tag::new_unchecked('I' as u8);
    pub const FUNCTION_CALL_RESPONSE: Tag = Tag::new_unchecked('V' as u8);
    pub const NEGOTIATE_PROTOCOL_VERSION: Tag = Tag::new_unchecked('v' as u8);
    pub const NO_DATA: Tag = Tag::new_unchecked('n' as u8);
    pub const PARAMETER_DESCRIPTION: Tag = Tag::new_unchecked('t' as u8);
    pub const PARSE_COMPLETE: Tag = Tag::new_unchecked('1' as u8);
    pub const PORTAL: Tag = Tag::new_unchecked('s' as u8);
    pub const READY_FOR_QUERY: Tag = Tag::new_unchecked('Z' as u8);
    pub const ROW_DESCRIPTION: Tag = Tag::new_unchecked('T' as u8);
    // Backend Async Messages (can also be synchronous, depending on context)
    pub const ERROR_RESPONSE: Tag = Tag::new_unchecked('E' as u8);
    // can be sent async e.g. if server is shutdown gracefully
    pub const PARAMETER_STATUS: Tag = Tag::new_unchecked('S' as u8);
    pub const NOTICE_RESPONSE: Tag = Tag::new_unchecked('N' as u8);
    pub const NOTIFICATION_RESPONSE: Tag = Tag::new_unchecked('A' as u8);

    pub fn new(b: u8) -> Result<Self> {
        let tag = Tag(b);
        if tag.name().is_some() {
            Ok(tag)
        } else {
            Err(Error::protocol_error(format!("unknown message tag '{}'", b as char)))
        }
    }

    pub const fn new_unchecked(b: u8) -> Self {
        Tag(b)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns the conventional name for the tag byte. Bytes shared between
    /// the frontend and backend message sets resolve to the backend name.
    pub fn name(&self) -> Option<&'static str> {
        let name = match self.0 as char {
            '\0' => "Untagged",
            '1' => "ParseComplete",
            '2' => "BindComplete",
            '3' => "CloseComplete",
            'A' => "NotificationResponse",
            'B' => "Bind",
            'C' => "CommandComplete",
            'D' => "DataRow",
            'E' => "ErrorResponse",
            'F' => "FunctionCall",
            'G' => "CopyInResponse",
            'H' => "CopyOutResponse",
            'I' => "EmptyQuery",
            'K' => "BackendKeyData",
            'N' => "NoticeResponse",
            'P' => "Parse",
            'Q' => "Query",
            'R' => "Authentication",
            'S' => "ParameterStatus",
            'T' => "RowDescription",
            'V' => "FunctionCallResponse",
            'W' => "CopyBothResponse",
            'X' => "Terminate",
            'Z' => "ReadyForQuery",
            'c' => "CopyDone",
            'd' => "CopyData",
            'f' => "CopyFail",
            'n' => "NoData",
            'p' => "PasswordMessage",
            's' => "Portal",
            't' => "ParameterDescription",
            'v' => "NegotiateProtocolVersion",
            _ => return None,
        };
        Some(name)
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => f.write_fmt(format_args!("unknown message tag '{}'", self.0)),
        }
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
