use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

use crate::pggate::{Error, Result};
use crate::pggate::config::KeyAlgorithm;
use crate::pggate::pg::SessionContext;

/// The cluster auth server surface used to sign ephemeral database
/// certificates with the cluster host CA.
#[async_trait]
pub trait AuthClient: Send + Sync {
    async fn generate_database_cert(&self, csr_pem: &str, ttl: Duration) -> Result<DatabaseCertResponse>;
}

/// A signed leaf and the CA bundle the database instance is expected to
/// be configured with.
pub struct DatabaseCertResponse {
    /// The signed certificate, PEM.
    pub cert: Vec<u8>,
    /// Trusted CA certificates, PEM, in the authority's order.
    pub ca_certs: Vec<Vec<u8>>,
}

/// An ephemeral client certificate with its private key, plus the CAs to
/// trust for the upstream connection. Lives for a single connect.
#[derive(Debug)]
pub struct ClientCertBundle {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub ca_certs: Vec<Vec<u8>>,
}

/// Signs an ephemeral client certificate used by the gateway to
/// authenticate with a self-hosted database instance. The database maps
/// the mTLS identity through the certificate's common name, which must be
/// the database username.
pub(crate) async fn issue_client_cert(
    auth_client: &dyn AuthClient,
    algorithm: KeyAlgorithm,
    session: &SessionContext,
) -> Result<ClientCertBundle> {
    let ttl = (session.identity.expires - Utc::now()).to_std()
        .map_err(|_| Error::bad_parameter(format!("identity of {} has expired", session.identity.username)))?;

    let key_pair = KeyPair::generate_for(algorithm.signature_algorithm())?;
    let mut params = CertificateParams::new(Vec::new())?;
    let mut subject = DistinguishedName::new();
    subject.push(DnType::CommonName, session.database_user.as_str());
    params.distinguished_name = subject;
    let csr = params.serialize_request(&key_pair)?;

    debug!(session = %session, "requesting database certificate");
    let resp = auth_client.generate_database_cert(&csr.pem()?, ttl).await?;

    let mut pem = resp.cert.as_slice();
    let leaf = rustls_pemfile::certs(&mut pem).next()
        .ok_or_else(|| Error::new("auth server returned no certificate"))??;
    inspect_leaf(&leaf)?;

    Ok(ClientCertBundle {
        cert_chain: vec![leaf],
        key: PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
        ca_certs: resp.ca_certs,
    })
}

fn inspect_leaf(leaf: &CertificateDer<'static>) -> Result<()> {
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| Error::new(format!("failed to parse issued certificate: {}", e)))?;
    debug!(subject = %cert.subject(), "issued database certificate");
    Ok(())
}
