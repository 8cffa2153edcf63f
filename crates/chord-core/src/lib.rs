// SPDX-License-Identifier: MIT

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! chord-core: shared types for the Chord machine lifecycle subsystem.

pub mod clock;
pub mod error;
pub mod machine;
pub mod transport;

pub use clock::{Clock, FakeClock, SystemClock};
pub use error::{fatal, ChordError, RpcStatusKind};
pub use machine::{
    BoundEndpoint, DeclaredEndpoint, DeclaredPort, ExitStatus,
    MachineId, MachineProcessState, MachineState, PortDirection, PortType,
    RequestedPort, SignedEndpoint,
};
pub use transport::{TransportKind, TransportLocation};
