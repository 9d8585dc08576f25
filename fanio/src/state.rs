//! Lifecycle states for engines and their workers

use std::fmt;

/// Aggregate state of a fan-in or fan-out engine
///
/// Terminal states (`Finished`, `Errored`, `Closed`) never go back to
/// `Running`. `Errored` can still move to `Closed` when the caller shuts the
/// engine down; the recorded error stays available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Constructed, nothing attached yet
    Initialized,
    /// At least one worker is attached and running
    Running,
    /// Fan-in only: every source is done, no reader has seen end of stream
    /// yet. Attaching a source goes back to `Running`.
    Draining,
    /// Fan-in only: every source is done and a reader got end of stream
    Finished,
    /// Fan-in only: a source failed; the first failure is sticky
    Errored,
    /// `close()` was called
    Closed,
}

impl EngineStatus {
    /// True if the engine accepts new sources or destinations
    #[must_use]
    pub fn accepts_attach(self) -> bool {
        matches!(self, Self::Initialized | Self::Running | Self::Draining)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Finished => "finished",
            Self::Errored => "errored",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of one fan-in source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Attached,
    Reading,
    Finished,
    Errored,
}

impl SourceState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Errored)
    }
}

/// Lifecycle of one fan-out destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    Attached,
    Writing,
    Closed,
    Errored,
}

impl DestinationState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}
