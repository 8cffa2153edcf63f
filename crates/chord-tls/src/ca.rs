//! The shared root CA: one per session. The isolate generates it when it
//! spawns a fresh agent (or loads it from the session directory's
//! `rootca.crt`/implicit key when reattaching), issues the agent's own
//! server certificate, and signs every machine's CSR during `RunMachine` —
//! the isolate acts as a CA for every child CSR.

use crate::identity::CertifiedKey;
use chord_core::ChordError;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateSigningRequestParams, DnType,
    IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::time::Duration;
use time::OffsetDateTime;

/// Default certificate lifetime for endpoint and agent certs: short-lived,
/// on the order of a few hours.
pub const DEFAULT_CERT_LIFETIME: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    /// Generate a fresh, self-signed root CA.
    pub fn generate() -> Result<Self, ChordError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ChordError::agent_error(format!("ca keypair generation failed: {e}")))?;

        let mut params = CertificateParams::new(Vec::new())
            .map_err(|e| ChordError::agent_error(format!("ca params failed: {e}")))?;
        params.distinguished_name.push(DnType::CommonName, "Chord session root CA");
        params.distinguished_name.push(DnType::OrganizationName, "Chord");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let cert = params
            .self_signed(&key)
            .map_err(|e| ChordError::agent_error(format!("ca self-sign failed: {e}")))?;

        Ok(Self { cert_pem: cert.pem(), key_pem: key.serialize_pem() })
    }

    /// Load a CA from PEM material already on disk (session reattach).
    pub fn load(cert_pem: String, key_pem: String) -> Self {
        Self { cert_pem, key_pem }
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn issuer(&self) -> Result<(Certificate, KeyPair), ChordError> {
        let key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| ChordError::agent_error(format!("ca key parse failed: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&self.cert_pem)
            .map_err(|e| ChordError::agent_error(format!("ca cert parse failed: {e}")))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| ChordError::agent_error(format!("ca cert reconstruction failed: {e}")))?;
        Ok((cert, key))
    }

    /// Sign a PEM CSR, producing a short-lived end-entity certificate. CN of
    /// the issued cert equals the CSR's CN.
    pub fn sign_csr(&self, csr_pem: &str, lifetime: Duration) -> Result<String, ChordError> {
        let (issuer_cert, issuer_key) = self.issuer()?;
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| ChordError::invalid_configuration(format!("malformed csr: {e}")))?;
        apply_lifetime(&mut csr_params.params, lifetime);

        let cert = csr_params
            .signed_by(&issuer_cert, &issuer_key)
            .map_err(|e| ChordError::agent_error(format!("csr signing failed: {e}")))?;
        Ok(cert.pem())
    }

    /// Issue a server certificate directly, for the agent's own identity
    /// when the isolate provisions a fresh agent (
    /// directory: `agent.crt`, `agent.key`).
    pub fn issue_server_cert(
        &self,
        common_name: &str,
        lifetime: Duration,
    ) -> Result<CertifiedKey, ChordError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ChordError::agent_error(format!("server keypair generation failed: {e}")))?;

        let mut params = CertificateParams::new(vec![common_name.to_string()])
            .map_err(|e| ChordError::agent_error(format!("server cert params failed: {e}")))?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.distinguished_name.push(DnType::OrganizationName, "Chord");
        apply_lifetime(&mut params, lifetime);

        let (issuer_cert, issuer_key) = self.issuer()?;
        let cert = params
            .signed_by(&key, &issuer_cert, &issuer_key)
            .map_err(|e| ChordError::agent_error(format!("server cert signing failed: {e}")))?;

        Ok(CertifiedKey { cert_pem: cert.pem(), key_pem: key.serialize_pem() })
    }
}

fn apply_lifetime(params: &mut CertificateParams, lifetime: Duration) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::seconds(lifetime.as_secs() as i64);
}

/// Extract a certificate's CN, used by the agent to derive its own
/// server-name and to check it against a configured `--listen-endpoint`.
pub fn common_name_of(cert_pem: &str) -> Result<String, ChordError> {
    let params = CertificateParams::from_ca_cert_pem(cert_pem)
        .map_err(|e| ChordError::invalid_configuration(format!("cannot parse certificate: {e}")))?;
    params
        .distinguished_name
        .get(&DnType::CommonName)
        .and_then(|v| match v {
            rcgen::DnValue::Utf8String(s) => Some(s.clone()),
            _ => None,
        })
        .ok_or_else(|| ChordError::invalid_configuration("certificate has no CN"))
}
