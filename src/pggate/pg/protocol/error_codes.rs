// Known Postgres error codes used by the gateway
// Class 08 — Connection Exception
pub const CONNECTION_EXCEPTION: &str = "08000"; // connection_exception
pub const CONNECTION_FAILURE: &str = "08006"; // connection_failure
pub const SQL_CLIENT_UNABLE_TO_ESTABLISH_SQL_CONNECTION: &str = "08001"; // sqlclient_unable_to_establish_sqlconnection
pub const SQL_SERVER_REJECTED_ESTABLISHEMENT_OF_SQL_CONNECTION: &str = "08004"; // sqlserver_rejected_establishment_of_sqlconnection
pub const PROTOCOL_VIOLATION: &str = "08P01"; // protocol_violation
// Class 0A — Feature Not Supported
pub const FEATURE_NOT_SUPPORTED: &str = "0A000"; // feature_not_supported
// Class 28 — Invalid Authorization Specification
pub const INVALID_AUTHORIZATION_SPECIFICATION: &str = "28000"; // invalid_authorization_specification
pub const INVALID_PASSWORD: &str = "28P01"; // invalid_password
// Class 3D — Invalid Catalog Name
pub const INVALID_CATALOG_NAME: &str = "3D000"; // invalid_catalog_name
// Class 42 — Syntax Error or Access Rule Violation
pub const SYNTAX_ERROR: &str = "42601"; // syntax_error
pub const INSUFFICIENT_PRIVILEGE: &str = "42501"; // insufficient_privilege
// Class 57 — Operator Intervention
pub const CANNOT_CONNECT_NOW: &str = "57P03"; // cannot_connect_now
// Class XX — Internal Error
pub const INTERNAL_ERROR: &str = "XX000"; // internal_error
