// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! chord-agent: the long-lived per-session supervisor (`chordd`). Owns the
//! machine table, spawns and reaps machine processes, and drives each
//! machine through its registration handshake over a TLS control channel.

pub mod config;
pub mod listener;
pub mod process;
pub mod service;
pub mod session;
pub mod supervisor;
pub mod url;

pub use config::{AgentConfig, Cli, PartialOrFullEndpoint};
pub use listener::{BoundListener, Listener};
pub use process::{MachineProcess, SpawnOptions};
pub use service::{AgentService, MachineSpawnContext};
pub use session::SessionDirectory;
pub use supervisor::{MachineSupervisor, SupervisorConfig};
