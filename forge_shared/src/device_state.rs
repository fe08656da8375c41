//! Device connection/operational states and the events that move between them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Idle,
    /// Entering a non-interruptible mode (start sequence in flight).
    Blocking,
    /// Leaving a non-interruptible mode (end sequence in flight).
    Unblocking,
    /// Pause accepted, parking motion not yet finished.
    Pausing,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceEvent {
    Connect,
    ConnectDone,
    Disconnect,
    Block,
    BlockDone,
    Unblock,
    UnblockDone,
    Pause,
    PauseDone,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {event} from state {from}")]
pub struct StateTransitionError {
    pub event: DeviceEvent,
    pub from: DeviceState,
}

impl DeviceState {
    /// States from which a pause request is applied without deferral.
    pub const PAUSEABLE: &'static [DeviceState] = &[DeviceState::Idle];

    pub fn is_pauseable(self) -> bool {
        Self::PAUSEABLE.contains(&self)
    }

    /// A non-interruptible operation is in flight; pause requests are deferred.
    pub fn is_transient(self) -> bool {
        matches!(self, DeviceState::Blocking | DeviceState::Unblocking)
    }

    /// Target state for `event`, or `None` when the event is not permitted here.
    /// `Resume` targets `Idle`; callers restoring a saved state override it.
    pub fn next(self, event: DeviceEvent) -> Option<DeviceState> {
        use DeviceEvent as E;
        use DeviceState as S;
        match (self, event) {
            (_, E::Disconnect) => Some(S::Disconnected),
            (S::Disconnected, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::ConnectDone) => Some(S::Idle),
            (S::Idle, E::Block) => Some(S::Blocking),
            (S::Blocking, E::BlockDone) => Some(S::Idle),
            (S::Idle, E::Unblock) => Some(S::Unblocking),
            (S::Unblocking, E::UnblockDone) => Some(S::Idle),
            (s, E::Pause) if s.is_pauseable() => Some(S::Pausing),
            (S::Pausing, E::PauseDone) => Some(S::Paused),
            (S::Paused, E::Resume) => Some(S::Idle),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Connecting => "connecting",
            DeviceState::Idle => "idle",
            DeviceState::Blocking => "blocking",
            DeviceState::Unblocking => "unblocking",
            DeviceState::Pausing => "pausing",
            DeviceState::Paused => "paused",
        };
        f.write_str(name)
    }
}

impl fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceEvent::Connect => "connect",
            DeviceEvent::ConnectDone => "connectDone",
            DeviceEvent::Disconnect => "disconnect",
            DeviceEvent::Block => "block",
            DeviceEvent::BlockDone => "blockDone",
            DeviceEvent::Unblock => "unblock",
            DeviceEvent::UnblockDone => "unblockDone",
            DeviceEvent::Pause => "pause",
            DeviceEvent::PauseDone => "pauseDone",
            DeviceEvent::Resume => "resume",
        };
        f.write_str(name)
    }
}
