//! Mutual TLS `ServerConfig`/`ClientConfig` construction from a shared
//! root CA and a local identity: every channel is mutually authenticated
//! against the session's root CA.

use chord_core::ChordError;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;

fn parse_cert_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, ChordError> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ChordError::agent_error(format!("malformed certificate pem: {e}")))
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, ChordError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ChordError::agent_error(format!("malformed key pem: {e}")))?
        .ok_or_else(|| ChordError::agent_error("no private key found in pem"))
}

fn root_store(ca_cert_pem: &str) -> Result<RootCertStore, ChordError> {
    let mut store = RootCertStore::empty();
    for cert in parse_cert_chain(ca_cert_pem)? {
        store
            .add(cert)
            .map_err(|e| ChordError::agent_error(format!("invalid root ca certificate: {e}")))?;
    }
    Ok(store)
}

/// Build a `ServerConfig` that requires and verifies a client certificate
/// against `ca_cert_pem`, presenting `cert_pem`/`key_pem` as its own
/// identity. Used by the agent's listener and by `RemotingService`.
pub fn server_config(
    ca_cert_pem: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<Arc<ServerConfig>, ChordError> {
    let roots = root_store(ca_cert_pem)?;
    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ChordError::agent_error(format!("client verifier build failed: {e}")))?;

    let chain = parse_cert_chain(cert_pem)?;
    let key = parse_private_key(key_pem)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| ChordError::agent_error(format!("server config build failed: {e}")))?;

    Ok(Arc::new(config))
}

/// Build a `ClientConfig` that trusts `ca_cert_pem` and presents
/// `cert_pem`/`key_pem` as its own client identity. Used by the isolate's
/// `GrpcConnector` and by machine-side dialers once they hold a signed cert.
pub fn client_config(
    ca_cert_pem: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<Arc<ClientConfig>, ChordError> {
    let roots = root_store(ca_cert_pem)?;
    let chain = parse_cert_chain(cert_pem)?;
    let key = parse_private_key(key_pem)?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| ChordError::agent_error(format!("client config build failed: {e}")))?;

    Ok(Arc::new(config))
}

/// Build a `ClientConfig` that trusts `ca_cert_pem` but presents no client
/// identity. Used by a newly-spawned machine process to dial the agent's
/// supervisor endpoint before it has been issued a cert of its own — the
/// connection is still encrypted and the agent's identity still verified,
/// but the machine authenticates itself only at the RPC layer (its
/// `SignCertificates` call carries the CSR it is requesting a cert for).
pub fn client_config_anonymous(ca_cert_pem: &str) -> Result<Arc<ClientConfig>, ChordError> {
    let roots = root_store(ca_cert_pem)?;
    let config = ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    Ok(Arc::new(config))
}

/// Build a `ServerConfig` like [`server_config`] but that accepts a peer
/// presenting no client certificate at all, in addition to verifying one
/// when present. The agent's supervisor endpoint needs this: the isolate
/// always has a cert (it holds the CA), but a newly-spawned machine dials
/// in before it has been issued one.
pub fn server_config_optional_client_auth(
    ca_cert_pem: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<Arc<ServerConfig>, ChordError> {
    let roots = root_store(ca_cert_pem)?;
    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .allow_unauthenticated()
        .build()
        .map_err(|e| ChordError::agent_error(format!("client verifier build failed: {e}")))?;

    let chain = parse_cert_chain(cert_pem)?;
    let key = parse_private_key(key_pem)?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|e| ChordError::agent_error(format!("server config build failed: {e}")))?;

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CertificateAuthority, DEFAULT_CERT_LIFETIME};

    #[test]
    fn builds_server_and_client_configs_from_same_ca() {
        let ca = CertificateAuthority::generate().unwrap();
        let server_identity = ca.issue_server_cert("agent.chord", DEFAULT_CERT_LIFETIME).unwrap();
        let client_identity = ca.issue_server_cert("machine-1.chord", DEFAULT_CERT_LIFETIME).unwrap();

        server_config(ca.cert_pem(), &server_identity.cert_pem, &server_identity.key_pem).unwrap();
        client_config(ca.cert_pem(), &client_identity.cert_pem, &client_identity.key_pem).unwrap();
    }

    #[test]
    fn rejects_malformed_key_material() {
        let ca = CertificateAuthority::generate().unwrap();
        let err = server_config(ca.cert_pem(), "not a cert", "not a key").unwrap_err();
        assert!(matches!(err, ChordError::AgentError(_)));
    }

    #[test]
    fn builds_optional_auth_server_config_and_anonymous_client_config() {
        let ca = CertificateAuthority::generate().unwrap();
        let server_identity = ca.issue_server_cert("agent.chord", DEFAULT_CERT_LIFETIME).unwrap();

        server_config_optional_client_auth(ca.cert_pem(), &server_identity.cert_pem, &server_identity.key_pem)
            .unwrap();
        client_config_anonymous(ca.cert_pem()).unwrap();
    }
}
