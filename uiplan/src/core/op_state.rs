//! Per-operation attempt state machine.
//!
//! `Pending -> Attempting(1) -> {Succeeded, Attempting(n + 1), Failed}`;
//! `Attempting(n + 1)` is only reachable while `n <= retries`, so an
//! operation runs at most `retries + 1` attempts.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Pending,
    /// 1-based attempt index.
    Attempting(u32),
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

impl OpState {
    pub fn start() -> Self {
        OpState::Attempting(1)
    }

    /// Transition after the current attempt finished.
    pub fn after_attempt(self, succeeded: bool, retries: u32) -> Self {
        match self {
            OpState::Pending => OpState::start(),
            OpState::Attempting(n) if succeeded => OpState::Succeeded { attempts: n },
            OpState::Attempting(n) if n <= retries => OpState::Attempting(n + 1),
            OpState::Attempting(n) => OpState::Failed { attempts: n },
            terminal => terminal,
        }
    }

    pub fn attempt(&self) -> Option<u32> {
        match self {
            OpState::Attempting(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OpState::Succeeded { .. } | OpState::Failed { .. })
    }
}
