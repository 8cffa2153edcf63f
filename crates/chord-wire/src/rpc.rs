//! Request/reply types for the agent's six lifecycle RPCs.
//!
//! A connection over the agent's supervisor endpoint carries a sequence of
//! `AgentRequest` / `AgentResponse` pairs, each length-framed (see
//! [`crate::frame`]).

use chord_core::{BoundEndpoint, DeclaredEndpoint, DeclaredPort, RequestedPort, SignedEndpoint};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload")]
pub enum AgentRequest {
    IdentifyAgent,
    CreateMachine {
        name: String,
        execution_url: String,
        config_hash: String,
        requested_ports: Vec<RequestedPort>,
        start_suspended: bool,
    },
    SignCertificates {
        machine_url: String,
        declared_ports: Vec<DeclaredPort>,
        declared_endpoints: Vec<DeclaredEndpoint>,
    },
    RunMachine {
        machine_url: String,
        signed_endpoints: Vec<SignedEndpoint>,
    },
    AdvertiseEndpoints {
        machine_url: String,
        bound_endpoints: Vec<BoundEndpoint>,
    },
    DeleteMachine {
        machine_url: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload")]
pub enum AgentResponse {
    Ok(AgentReply),
    /// RPC status mapped from a [`chord_core::ChordError`] at the adapter
    /// boundary.
    Error { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Aborted,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    Internal,
}

impl From<&chord_core::ChordError> for ErrorKind {
    fn from(e: &chord_core::ChordError) -> Self {
        match e.rpc_status() {
            chord_core::RpcStatusKind::InvalidArgument => ErrorKind::InvalidArgument,
            chord_core::RpcStatusKind::PermissionDenied => ErrorKind::PermissionDenied,
            chord_core::RpcStatusKind::NotFound => ErrorKind::NotFound,
            chord_core::RpcStatusKind::Internal => ErrorKind::Internal,
            chord_core::RpcStatusKind::Aborted | chord_core::RpcStatusKind::Ok => {
                ErrorKind::Aborted
            }
        }
    }
}

impl AgentResponse {
    pub fn from_error(err: &chord_core::ChordError) -> Self {
        AgentResponse::Error { kind: ErrorKind::from(err), message: err.message() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "payload")]
pub enum AgentReply {
    IdentifyAgent {
        agent_name: String,
        uptime_millis: u64,
    },
    CreateMachine {
        machine_url: String,
        declared_ports: Vec<DeclaredPort>,
        declared_endpoints: Vec<DeclaredEndpoint>,
        control_endpoint_index: i32,
    },
    SignCertificates {
        signed_endpoints: Vec<SignedEndpoint>,
    },
    RunMachine {
        bound_endpoints: Vec<BoundEndpoint>,
    },
    AdvertiseEndpoints,
    DeleteMachine {
        exit_status: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{decode, encode};

    #[test]
    fn create_machine_request_round_trips() {
        let req = AgentRequest::CreateMachine {
            name: "m1".into(),
            execution_url: "pkg://example".into(),
            config_hash: "{}".into(),
            requested_ports: vec![],
            start_suspended: false,
        };
        let bytes = encode(&req).unwrap();
        // first 4 bytes are the length prefix, stripped for decode
        let payload = &bytes[4..];
        let back: AgentRequest = decode(payload).unwrap();
        match back {
            AgentRequest::CreateMachine { name, .. } => assert_eq!(name, "m1"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn error_kind_maps_invalid_configuration_to_invalid_argument() {
        let err = chord_core::ChordError::invalid_configuration("bad");
        assert_eq!(ErrorKind::from(&err), ErrorKind::InvalidArgument);
    }
}
