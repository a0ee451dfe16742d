use std::fmt;
use std::fmt::{Display, Formatter};

use strum::EnumString;

use crate::pggate::Result;
use crate::pggate::pg::protocol::{Frame, MessageReader, MessageBuilder};

#[derive(EnumString, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum ErrorSeverity {
    Log,
    Info,
    Debug,
    Notice,
    Warning,
    Error,
    Panic,
    Fatal,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ErrorSeverity::Fatal => "FATAL",
            ErrorSeverity::Panic => "PANIC",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Notice => "NOTICE",
            ErrorSeverity::Debug => "DEBUG",
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Log => "LOG",
        }
    }
}

impl Display for ErrorSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ErrorSeverity {
    fn default() -> Self {
        ErrorSeverity::Error
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ErrorFieldTag(u8);

impl ErrorFieldTag {
    pub const NULL_TERMINATOR: ErrorFieldTag = ErrorFieldTag::new_unchecked(0);
    pub const LOCALIZED_SEVERITY: ErrorFieldTag = ErrorFieldTag::new_unchecked('S' as u8);
    pub const SEVERITY: ErrorFieldTag = ErrorFieldTag::new_unchecked('V' as u8);
    pub const CODE: ErrorFieldTag = ErrorFieldTag::new_unchecked('C' as u8);
    pub const MESSAGE: ErrorFieldTag = ErrorFieldTag::new_unchecked('M' as u8);
    pub const MESSAGE_DETAIL: ErrorFieldTag = ErrorFieldTag::new_unchecked('D' as u8);
    pub const MESSAGE_HINT: ErrorFieldTag = ErrorFieldTag::new_unchecked('H' as u8);
    pub const POSITION: ErrorFieldTag = ErrorFieldTag::new_unchecked('P' as u8);
    pub const INTERNAL_POSITION: ErrorFieldTag = ErrorFieldTag::new_unchecked('p' as u8);
    pub const INTERNAL_QUERY: ErrorFieldTag = ErrorFieldTag::new_unchecked('q' as u8);
    pub const WHERE: ErrorFieldTag = ErrorFieldTag::new_unchecked('W' as u8);
    pub const SCHEMA_NAME: ErrorFieldTag = ErrorFieldTag::new_unchecked('s' as u8);
    pub const TABLE_NAME: ErrorFieldTag = ErrorFieldTag::new_unchecked('t' as u8);
    pub const COLUMN_NAME: ErrorFieldTag = ErrorFieldTag::new_unchecked('c' as u8);
    pub const DATA_TYPE_NAME: ErrorFieldTag = ErrorFieldTag::new_unchecked('d' as u8);
    pub const CONSTRAINT_NAME: ErrorFieldTag = ErrorFieldTag::new_unchecked('n' as u8);
    pub const FILE: ErrorFieldTag = ErrorFieldTag::new_unchecked('F' as u8);
    pub const LINE: ErrorFieldTag = ErrorFieldTag::new_unchecked('L' as u8);
    pub const ROUTINE: ErrorFieldTag = ErrorFieldTag::new_unchecked('R' as u8);

    pub const fn new_unchecked(b: u8) -> Self {
        ErrorFieldTag(b)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// An ErrorResponse or NoticeResponse payload. The complete ordered field
/// list is retained so a re-encoded message is byte-identical to the
/// received one, fields the gateway never looks at included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresError {
    fields: Vec<(u8, String)>,
}

impl PostgresError {
    pub fn new(severity: ErrorSeverity, code: &str, message: &str) -> Self {
        PostgresError {
            fields: vec![
                (ErrorFieldTag::LOCALIZED_SEVERITY.as_u8(), severity.as_str().to_string()),
                (ErrorFieldTag::SEVERITY.as_u8(), severity.as_str().to_string()),
                (ErrorFieldTag::CODE.as_u8(), code.to_string()),
                (ErrorFieldTag::MESSAGE.as_u8(), message.to_string()),
            ],
        }
    }

    /// An error carrying nothing but the human-readable message, used to
    /// surface gateway-internal failures to a native client.
    pub fn message_only(message: &str) -> Self {
        PostgresError {
            fields: vec![(ErrorFieldTag::MESSAGE.as_u8(), message.to_string())],
        }
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.fields.push((ErrorFieldTag::MESSAGE_DETAIL.as_u8(), detail.to_string()));
        self
    }

    /// Parses the payload of an ErrorResponse/NoticeResponse frame.
    /// Unknown field tags are preserved, not rejected.
    pub fn parse(frame: &Frame) -> Result<Self> {
        let mut r = MessageReader::new(frame);
        let mut fields = Vec::new();
        loop {
            let tag = r.read_byte();
            r.error()?;
            if tag == ErrorFieldTag::NULL_TERMINATOR.as_u8() {
                return Ok(PostgresError { fields });
            }
            fields.push((tag, r.read_str()?.to_string()));
        }
    }

    fn field(&self, tag: ErrorFieldTag) -> Option<&str> {
        self.fields.iter()
            .find(|(t, _)| *t == tag.as_u8())
            .map(|(_, v)| v.as_str())
    }

    /// The non-localized severity when the server sent one, otherwise the
    /// localized value.
    pub fn severity(&self) -> &str {
        self.field(ErrorFieldTag::SEVERITY)
            .or_else(|| self.field(ErrorFieldTag::LOCALIZED_SEVERITY))
            .unwrap_or("")
    }

    pub fn code(&self) -> &str {
        self.field(ErrorFieldTag::CODE).unwrap_or("")
    }

    pub fn message(&self) -> &str {
        self.field(ErrorFieldTag::MESSAGE).unwrap_or("")
    }

    pub fn detail(&self) -> Option<&str> {
        self.field(ErrorFieldTag::MESSAGE_DETAIL)
    }

    /// Writes the fields into the body of an ErrorResponse/NoticeResponse
    /// message under construction.
    pub(crate) fn write(&self, mb: &mut MessageBuilder) {
        for (tag, value) in &self.fields {
            mb.write_byte(*tag);
            mb.write_str(value);
        }
        mb.write_byte(ErrorFieldTag::NULL_TERMINATOR.as_u8());
    }
}

impl Display for PostgresError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let severity = self.severity();
        if !severity.is_empty() {
            f.write_fmt(format_args!("{}: ", severity))?;
        }
        f.write_str(self.message())?;
        let code = self.code();
        if !code.is_empty() {
            f.write_fmt(format_args!(" (SQLSTATE {})", code))?;
        }
        Ok(())
    }
}
