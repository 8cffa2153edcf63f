//! ECC P-256 keypair + CSR generation for a machine's local TLS identity,
//! and the small PEM bundle a signed identity carries.

use chord_core::ChordError;
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};

/// A CSR plus the private key it was generated with. The private key never
/// leaves the owning process except to be written to its own local
/// filesystem.
pub struct LocalIdentity {
    key_pem: String,
    csr_pem: String,
}

impl LocalIdentity {
    /// Generate a fresh ECC P-256 keypair and a CSR whose CN is `common_name`
    /// (the machine URL's host component), O is "Chord", OU is
    /// "Chord machine".
    pub fn generate(common_name: &str, subject_alt_names: &[String]) -> Result<Self, ChordError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| ChordError::machine_error(format!("keypair generation failed: {e}")))?;

        let mut sans = vec![common_name.to_string()];
        for san in subject_alt_names {
            if !sans.contains(san) {
                sans.push(san.clone());
            }
        }

        let mut params = CertificateParams::new(sans)
            .map_err(|e| ChordError::machine_error(format!("csr params failed: {e}")))?;
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.distinguished_name.push(DnType::OrganizationName, "Chord");
        params.distinguished_name.push(DnType::OrganizationalUnitName, "Chord machine");

        let csr = params
            .serialize_request(&key)
            .map_err(|e| ChordError::machine_error(format!("csr generation failed: {e}")))?;
        let csr_pem = csr
            .pem()
            .map_err(|e| ChordError::machine_error(format!("csr pem encoding failed: {e}")))?;

        Ok(Self { key_pem: key.serialize_pem(), csr_pem })
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }
}

/// A certificate paired with its private key, ready to configure a TLS
/// endpoint (agent's own identity, or a signed server cert issued by the
/// isolate's CA).
#[derive(Clone)]
pub struct CertifiedKey {
    pub cert_pem: String,
    pub key_pem: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_csr_contains_expected_subject_fields() {
        let id = LocalIdentity::generate("machine-1.chord", &[]).unwrap();
        assert!(id.csr_pem().starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(!id.key_pem().is_empty());
    }

    #[test]
    fn subject_alt_names_deduplicate_common_name() {
        let id =
            LocalIdentity::generate("machine-1.chord", &["machine-1.chord".to_string()]).unwrap();
        assert!(id.csr_pem().starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
    }
}
