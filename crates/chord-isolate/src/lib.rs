// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! chord-isolate: the client embedding. Finds or spawns a session's agent,
//! drives each machine it launches through the registration handshake,
//! signs its declared endpoints with a locally-held CA, and hands back a
//! [`RemoteMachine`] handle wired to the caller's plug handlers.

pub mod bootstrap;
pub mod config;
pub mod connector;
pub mod isolate;
pub mod signer;

pub use bootstrap::{establish, EstablishedSession};
pub use config::{IsolateConfig, SessionMode};
pub use connector::{AgentClient, GrpcConnector, IsolateIdentity, PlugHandler};
pub use isolate::{ChordIsolate, LaunchRequest, PlugRequest, RemoteMachine};
pub use signer::LocalCertificateSigner;
