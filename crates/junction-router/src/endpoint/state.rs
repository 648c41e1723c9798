//! Endpoint lifecycle.
//!
//! ```text
//! Stopped → Started → {StopWait | OtherEndStopWait} → Stopping → ExitWait → Stopped
//! ```
//!
//! Every transition raises the rank. A transition that does not apply to
//! the current state is a no-op and reports `false`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Started,
    /// We asked to stop; waiting for the peer to close its half.
    StopWait,
    /// The peer closed its half first.
    OtherEndStopWait,
    Stopping,
    ExitWait,
}

/// Current state plus whether the endpoint was ever started, which
/// separates the initial `Stopped` from the terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    state: StreamState,
    started: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: StreamState::Stopped,
            started: false,
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn was_started(&self) -> bool {
        self.started
    }

    /// Ordering used to check that transitions only move forward.
    pub fn rank(&self) -> u8 {
        match (self.state, self.started) {
            (StreamState::Stopped, false) => 0,
            (StreamState::Started, _) => 1,
            (StreamState::StopWait, _) | (StreamState::OtherEndStopWait, _) => 2,
            (StreamState::Stopping, _) => 3,
            (StreamState::ExitWait, _) => 4,
            (StreamState::Stopped, true) => 5,
        }
    }

    /// Pushes are admitted only here.
    pub fn is_accepting(&self) -> bool {
        self.state == StreamState::Started
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state,
            StreamState::Started | StreamState::StopWait | StreamState::OtherEndStopWait | StreamState::Stopping
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.started && self.state == StreamState::Stopped
    }

    pub fn start(&mut self) -> bool {
        self.advance(|s, started| match s {
            StreamState::Stopped if !started => Some(StreamState::Started),
            _ => None,
        })
    }

    pub fn local_stop(&mut self) -> bool {
        self.advance(|s, _| match s {
            StreamState::Started => Some(StreamState::StopWait),
            StreamState::OtherEndStopWait => Some(StreamState::Stopping),
            _ => None,
        })
    }

    pub fn peer_eof(&mut self) -> bool {
        self.advance(|s, _| match s {
            StreamState::Started => Some(StreamState::OtherEndStopWait),
            StreamState::StopWait => Some(StreamState::Stopping),
            _ => None,
        })
    }

    /// Both pumps are done, or the endpoint was aborted.
    pub fn halt(&mut self) -> bool {
        if !self.is_running() {
            return false;
        }
        self.advance(|_, _| Some(StreamState::ExitWait))
    }

    pub fn exited(&mut self) -> bool {
        self.advance(|s, _| match s {
            StreamState::ExitWait => Some(StreamState::Stopped),
            _ => None,
        })
    }

    fn advance(&mut self, next: impl FnOnce(StreamState, bool) -> Option<StreamState>) -> bool {
        let Some(state) = next(self.state, self.started) else {
            return false;
        };
        let candidate = Lifecycle {
            state,
            started: true,
        };
        if candidate.rank() <= self.rank() {
            return false;
        }
        *self = candidate;
        true
    }
}
