// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! chord-machine: the process spawned per machine. Registers itself with
//! its agent, hosts a TLS binder for plug streams and control RPCs, and
//! drives a single interpreter on its own thread.

pub mod binder;
pub mod config;
pub mod registration;
pub mod runner;

pub use binder::{EchoPortHandler, GrpcBinder, PortHandler, RemotingService, StreamWriter};
pub use config::{Cli, MachineConfig};
pub use registration::{sign_certificates, PendingRegistration, Registration};
pub use runner::{Interpreter, LocalMachine, MachineMonitor, RunnerCommand, RunnerEvent, StubInterpreter};
