// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! chord-tls: CSR generation, local CA signing, and mutual-TLS config
//! construction for the session's shared root CA.

pub mod ca;
pub mod identity;
pub mod rustls_config;

pub use ca::{common_name_of, CertificateAuthority, DEFAULT_CERT_LIFETIME};
pub use identity::{CertifiedKey, LocalIdentity};
pub use rustls_config::{
    client_config, client_config_anonymous, server_config, server_config_optional_client_auth,
};
