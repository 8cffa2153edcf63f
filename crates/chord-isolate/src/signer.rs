//! Signs declared endpoints' CSRs with the isolate's own CA during the
//! `RunMachine` step of the launch handshake.

use chord_core::{ChordError, DeclaredEndpoint, SignedEndpoint};
use chord_tls::{CertificateAuthority, DEFAULT_CERT_LIFETIME};

pub struct LocalCertificateSigner<'a> {
    ca: &'a CertificateAuthority,
}

impl<'a> LocalCertificateSigner<'a> {
    pub fn new(ca: &'a CertificateAuthority) -> Self {
        Self { ca }
    }

    /// Signs every declared endpoint's CSR. The issued certificate's CN
    /// equals the CSR's own CN, so callers never need to track it separately.
    pub fn sign_all(&self, declared: &[DeclaredEndpoint]) -> Result<Vec<SignedEndpoint>, ChordError> {
        declared
            .iter()
            .map(|endpoint| {
                let certificate = self.ca.sign_csr(&endpoint.csr, DEFAULT_CERT_LIFETIME)?;
                Ok(SignedEndpoint { endpoint_url: endpoint.endpoint_url.clone(), certificate })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chord_tls::LocalIdentity;

    #[test]
    fn signs_every_declared_endpoint() {
        let ca = CertificateAuthority::generate().unwrap();
        let signer = LocalCertificateSigner::new(&ca);
        let identity = LocalIdentity::generate("machine-1.chord", &[]).unwrap();
        let declared =
            vec![DeclaredEndpoint { endpoint_url: "unix://machine-1.chord/tmp/m.sock".into(), csr: identity.csr_pem().to_string() }];

        let signed = signer.sign_all(&declared).unwrap();

        assert_eq!(signed.len(), 1);
        assert_eq!(signed[0].endpoint_url, "unix://machine-1.chord/tmp/m.sock");
        assert!(signed[0].certificate.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn empty_declared_list_signs_nothing() {
        let ca = CertificateAuthority::generate().unwrap();
        let signer = LocalCertificateSigner::new(&ca);
        assert!(signer.sign_all(&[]).unwrap().is_empty());
    }
}
