use serde::Serialize;
use std::fmt;

// Bitwise maskable states
pub const STATE_PAUSED: u16 = 1;
pub const STATE_INITIALIZING: u16 = 2;
pub const STATE_RUNNING: u16 = 4;
pub const STATE_STALLED: u16 = 8;
pub const STATE_ABORTING: u16 = 16;
pub const STATE_FINISHED: u16 = 32;
pub const STATE_FAILED: u16 = 64;
pub const STATE_IDLE: u16 = 128;
pub const STATE_IOWAIT: u16 = 256;
pub const STATE_ABORTED: u16 = 512;

/// Flags that combine freely with any lifecycle state.
const ORTHOGONAL: u16 = STATE_PAUSED | STATE_IOWAIT;
const LIFECYCLE: u16 = !ORTHOGONAL;

/// Lifecycle stage of a transfer or segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Lifecycle {
    Idle = STATE_IDLE,
    Initializing = STATE_INITIALIZING,
    Running = STATE_RUNNING,
    Stalled = STATE_STALLED,
    Aborting = STATE_ABORTING,
    Aborted = STATE_ABORTED,
    Finished = STATE_FINISHED,
    Failed = STATE_FAILED,
}

impl Lifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(self, Lifecycle::Finished | Lifecycle::Failed | Lifecycle::Aborted)
    }

    pub fn can_transition_to(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Finished | Failed | Aborted, _) => false,
            (Aborting, Aborted) => true,
            (Aborting, _) => false,
            (_, Aborting) => true,
            (Idle, Initializing | Running) => true,
            (Initializing, Running | Failed | Idle | Finished) => true,
            (Running, Stalled | Idle | Finished | Failed) => true,
            (Stalled, Running | Failed | Idle) => true,
            // Uploads park in Idle between requests.
            (Idle, Finished) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Idle => write!(f, "Idle"),
            Lifecycle::Initializing => write!(f, "Initializing"),
            Lifecycle::Running => write!(f, "Running"),
            Lifecycle::Stalled => write!(f, "Stalled"),
            Lifecycle::Aborting => write!(f, "Aborting"),
            Lifecycle::Aborted => write!(f, "Aborted"),
            Lifecycle::Finished => write!(f, "Finished"),
            Lifecycle::Failed => write!(f, "Failed"),
        }
    }
}

/// Set of state flags: exactly one lifecycle flag plus any of Paused/IOWait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TransferState(u16);

impl Default for TransferState {
    fn default() -> Self {
        Self(STATE_IDLE)
    }
}

impl TransferState {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self(lifecycle as u16)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn contains(&self, flag: u16) -> bool {
        self.0 & flag == flag
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.0 & LIFECYCLE {
            STATE_INITIALIZING => Lifecycle::Initializing,
            STATE_RUNNING => Lifecycle::Running,
            STATE_STALLED => Lifecycle::Stalled,
            STATE_ABORTING => Lifecycle::Aborting,
            STATE_ABORTED => Lifecycle::Aborted,
            STATE_FINISHED => Lifecycle::Finished,
            STATE_FAILED => Lifecycle::Failed,
            _ => Lifecycle::Idle,
        }
    }

    /// Moves to `next` when the transition is legal; orthogonal flags survive.
    pub fn transition(&mut self, next: Lifecycle) -> bool {
        if !self.lifecycle().can_transition_to(next) {
            return false;
        }
        self.0 = (self.0 & ORTHOGONAL) | next as u16;
        true
    }

    pub fn is_paused(&self) -> bool {
        self.contains(STATE_PAUSED)
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.set_flag(STATE_PAUSED, paused);
    }

    pub fn is_io_wait(&self) -> bool {
        self.contains(STATE_IOWAIT)
    }

    pub fn set_io_wait(&mut self, waiting: bool) {
        self.set_flag(STATE_IOWAIT, waiting);
    }

    pub fn is_aborting(&self) -> bool {
        matches!(self.lifecycle(), Lifecycle::Aborting | Lifecycle::Aborted)
    }

    fn set_flag(&mut self, flag: u16, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lifecycle())?;
        if self.is_paused() {
            write!(f, "+Paused")?;
        }
        if self.is_io_wait() {
            write!(f, "+IOWait")?;
        }
        Ok(())
    }
}
