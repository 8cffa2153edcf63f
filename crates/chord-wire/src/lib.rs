// SPDX-License-Identifier: MIT

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! chord-wire: wire protocol for the agent's lifecycle RPCs and the
//! machine's remoting surface.

pub mod frame;
pub mod remoting;
pub mod rpc;

pub use frame::{decode, encode, read_message, read_typed, write_message, write_typed, ProtocolError};
pub use remoting::{
    CommunicateOpen, ControlRequest, ControlResponse, FrameVersion, Message, MonitorEvent,
    RemotingErrorKind, RemotingOpenResult, RemotingRequest,
};
pub use rpc::{AgentReply, AgentRequest, AgentResponse, ErrorKind};
