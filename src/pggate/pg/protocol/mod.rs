mod message_parser;
mod tag;
mod message;
mod message_reader;
mod message_builder;
mod message_error;
mod server_params;
pub mod error_codes;

pub use self::message::{Frame, Message, StartupRequest};
pub use self::message_parser::{Header, MessageParser, MIN_MESSAGE_LEN, MAX_MESSAGE_LEN, MAX_STARTUP_LEN};
pub use self::message_reader::MessageReader;
pub use self::message_builder::MessageBuilder;
pub use self::message_error::{PostgresError, ErrorSeverity, ErrorFieldTag};
pub use self::server_params::ServerParams;
pub use self::tag::{
    Tag, PROTOCOL_VERSION, SSL_REQUEST, CANCEL_REQUEST, GSSENC_REQUEST,
    SSL_ALLOWED, SSL_NOT_ALLOWED,
};
