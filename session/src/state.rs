use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Connection lifecycle states. `Ready` is the only state that accepts requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Dialing = 1,
    Authenticating = 2,
    Ready = 3,
    Reconnecting = 4,
    Closed = 5,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Dialing,
            2 => Self::Authenticating,
            3 => Self::Ready,
            4 => Self::Reconnecting,
            5 => Self::Closed,
            _ => Self::Disconnected,
        }
    }

    /// States from which a fresh `connect` may start.
    pub fn can_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Dialing => "DIALING",
            Self::Authenticating => "AUTHENTICATING",
            Self::Ready => "READY",
            Self::Reconnecting => "RECONNECTING",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Lock-free cell holding the current [`SessionState`].
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Store `next` and return the previous state.
    pub(crate) fn set(&self, next: SessionState) -> SessionState {
        let prev = SessionState::from_u8(self.0.swap(next as u8, Ordering::AcqRel));
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "session state transition");
        }
        prev
    }

    /// Move to `next` only if the current state is `expected`.
    pub(crate) fn transition(&self, expected: SessionState, next: SessionState) -> bool {
        let ok = self
            .0
            .compare_exchange(
                expected as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if ok {
            tracing::debug!(from = %expected, to = %next, "session state transition");
        }
        ok
    }
}
