use fnv::FnvHashMap;
use rustls::client::ResolvesClientCert;
use test_log::test;

use crate::pggate::config::KeyAlgorithm;
use crate::pggate::pg::{md5_password, Connector, DatabaseServer, DEFAULT_RECV_BUFFER_SIZE};
use crate::tests::common;

fn connector<'a>(
    auth: &'a common::TestAuthClient,
    token_source: &'a common::StaticTokenSource,
    cloud_ca_certs: &'a FnvHashMap<String, Vec<u8>>,
) -> Connector<'a> {
    Connector {
        auth_client: auth,
        token_source,
        cloud_ca_certs,
        key_algorithm: KeyAlgorithm::EcdsaP256,
        recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
    }
}

#[test(tokio::test)]
async fn test_tls_materials_self_hosted() {
    let auth = common::TestAuthClient::new();
    let token_source = common::StaticTokenSource;
    let cloud_ca_certs = FnvHashMap::default();
    let connector = connector(&auth, &token_source, &cloud_ca_certs);

    let mut session = common::session(
        DatabaseServer::self_hosted("postgres-local", "db.local:5432"),
        common::RecordingChecker::allow(),
    );
    session.database_user = "app".to_string();
    session.database_name = "shop".to_string();

    let materials = connector.tls_materials(&session).await.unwrap();
    // exactly one client certificate, no password, issuing CA trusted
    let bundle = materials.client_cert.as_ref().expect("expected a client certificate");
    assert_eq!(bundle.cert_chain.len(), 1);
    assert_eq!(materials.password, None);
    assert!(!materials.roots.is_empty());

    let (config, _, password) = materials.into_client_config().unwrap();
    assert!(config.client_auth_cert_resolver.has_certs());
    assert_eq!(password, None);
}

#[test(tokio::test)]
async fn test_tls_materials_managed_cloud() {
    let auth = common::TestAuthClient::new();
    let token_source = common::StaticTokenSource;
    let mut cloud_ca_certs = FnvHashMap::default();
    cloud_ca_certs.insert("us-east-1".to_string(), common::TestCa::new().ca_pem());
    let connector = connector(&auth, &token_source, &cloud_ca_certs);

    let mut session = common::session(
        DatabaseServer::rds("orders-rds", "orders.us-east-1.rds.amazonaws.com:5432", "us-east-1"),
        common::RecordingChecker::allow(),
    );
    session.database_user = "app".to_string();
    session.database_name = "shop".to_string();

    let materials = connector.tls_materials(&session).await.unwrap();
    // no client certificate, the IAM token is the password, region roots trusted
    assert!(materials.client_cert.is_none());
    assert_eq!(
        materials.password.as_deref(),
        Some("token:orders.us-east-1.rds.amazonaws.com:us-east-1:app"));
    assert!(!materials.roots.is_empty());
    // the auth server was not asked for a certificate
    assert!(auth.requests().is_empty());

    let (config, _, _) = materials.into_client_config().unwrap();
    assert!(!config.client_auth_cert_resolver.has_certs());
}

#[test(tokio::test)]
async fn test_tls_materials_managed_cloud_unknown_region() {
    let auth = common::TestAuthClient::new();
    let token_source = common::StaticTokenSource;
    let cloud_ca_certs = FnvHashMap::default();
    let connector = connector(&auth, &token_source, &cloud_ca_certs);

    let mut session = common::session(
        DatabaseServer::rds("orders-rds", "orders.eu-west-3.rds.amazonaws.com:5432", "eu-west-3"),
        common::RecordingChecker::allow(),
    );
    session.database_user = "app".to_string();
    session.database_name = "shop".to_string();

    // an unknown region leaves the pool empty so TLS verification fails,
    // rather than silently trusting anything
    let materials = connector.tls_materials(&session).await.unwrap();
    assert!(materials.roots.is_empty());
    assert!(materials.password.is_some());
}

#[test(tokio::test)]
async fn test_tls_materials_server_ca_pinned() {
    let auth = common::TestAuthClient::new();
    let token_source = common::StaticTokenSource;
    let cloud_ca_certs = FnvHashMap::default();
    let connector = connector(&auth, &token_source, &cloud_ca_certs);

    let pinned = common::TestCa::new();
    let mut session = common::session(
        DatabaseServer::rds("orders-rds", "orders.eu-west-3.rds.amazonaws.com:5432", "eu-west-3")
            .with_ca_cert(pinned.ca_pem()),
        common::RecordingChecker::allow(),
    );
    session.database_user = "app".to_string();
    session.database_name = "shop".to_string();

    // the pinned bundle wins over the (missing) region entry
    let materials = connector.tls_materials(&session).await.unwrap();
    assert!(!materials.roots.is_empty());
}

#[test]
fn test_md5_password() {
    let hashed = md5_password("app", "secret", &[1, 2, 3, 4]);
    assert!(hashed.starts_with("md5"));
    // "md5" plus 32 hex digits
    assert_eq!(hashed.len(), 35);
    assert_eq!(hashed, md5_password("app", "secret", &[1, 2, 3, 4]));
    assert_ne!(hashed, md5_password("app", "secret", &[4, 3, 2, 1]));
    assert_ne!(hashed, md5_password("other", "secret", &[1, 2, 3, 4]));
}

#[test(tokio::test)]
async fn test_tls_materials_garbage_ca_rejected() {
    let auth = common::TestAuthClient::new();
    let token_source = common::StaticTokenSource;
    let cloud_ca_certs = FnvHashMap::default();
    let connector = connector(&auth, &token_source, &cloud_ca_certs);

    let mut session = common::session(
        DatabaseServer::rds("orders-rds", "orders.us-east-1.rds.amazonaws.com:5432", "us-east-1")
            .with_ca_cert(b"not a pem".to_vec()),
        common::RecordingChecker::allow(),
    );
    session.database_user = "app".to_string();
    session.database_name = "shop".to_string();

    assert!(connector.tls_materials(&session).await.is_err());
}
