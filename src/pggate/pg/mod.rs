pub mod protocol;

mod cert;
mod codec;
mod engine;
mod relay;
mod session;
mod upstream;

pub use self::cert::{AuthClient, ClientCertBundle, DatabaseCertResponse};
pub use self::codec::{
    BackendCodec, BackendReader, BackendWriter,
    FrontendCodec, FrontendReader, FrontendWriter,
    DEFAULT_RECV_BUFFER_SIZE,
};
pub use self::engine::{Engine, SessionHooks, to_error_response};
pub use self::session::{AccessChecker, DatabaseServer, Identity, ServerKind, SessionContext};
pub use self::upstream::{TlsMaterials, TokenSource, UpstreamConn};

pub(crate) use self::cert::issue_client_cert;
pub(crate) use self::upstream::{md5_password, Connector};
