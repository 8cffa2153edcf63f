//! The machine's own protocol surface: `Communicate` (bidirectional plug
//! stream), `Suspend`/`Resume`/`Terminate` (unary control), and `Monitor`
//! (server-streaming state/exit events).

use chord_core::MachineState;
use serde::{Deserialize, Serialize};

/// Version tag carried on every `Communicate` frame. `Stream` is reserved
/// for in-band negotiation and is never produced by this implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameVersion {
    Version1,
    Stream,
}

/// One frame of a `Communicate` stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub version: FrameVersion,
    pub data: Vec<u8>,
}

/// Metadata sent once, at stream open, identifying which registered
/// handler this stream attaches to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicateOpen {
    pub protocol_url: String,
}

/// Unary control requests — empty bodies, dispatched by method name.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ControlRequest {
    Suspend,
    Resume,
    Terminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlResponse {
    Ok,
    Err { message: String },
}

/// One event on the `Monitor` server-stream: either a state transition or
/// the single terminal exit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MonitorEvent {
    StateChanged { curr_state: MachineState },
    MachineExit { exit_status: i64 },
}

/// First frame on a fresh connection to a machine's binder, selecting which
/// of the three remoting operations this connection performs. Everything
/// after the open/ack exchange is operation-specific: `Message` frames for
/// `Communicate`, one `ControlResponse` for `Control`, a stream of
/// `MonitorEvent` for `Monitor`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemotingRequest {
    Communicate(CommunicateOpen),
    Control(ControlRequest),
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemotingErrorKind {
    PermissionDenied,
    InvalidArgument,
    Internal,
}

/// Acknowledges a `RemotingRequest::Communicate`/`Monitor` open. `Control`
/// replies with `ControlResponse` directly instead, since it is already a
/// single request/reply pair with no further framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RemotingOpenResult {
    Ok,
    Err { kind: RemotingErrorKind, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_event_serializes() {
        let ev = MonitorEvent::StateChanged { curr_state: MachineState::Running };
        let json = serde_json::to_string(&ev).unwrap();
        let back: MonitorEvent = serde_json::from_str(&json).unwrap();
        match back {
            MonitorEvent::StateChanged { curr_state } => assert_eq!(curr_state, MachineState::Running),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
