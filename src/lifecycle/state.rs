// src/lifecycle/state.rs

//! Lifecycle states, triggers and the transition table.

use std::fmt;

/// State of a module (the supervisor or any subsystem).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Loaded,
    Initializing,
    Ready,
    Starting,
    Running,
    Stopping,
    Closed,
    Failed,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 8] = [
        LifecycleState::Loaded,
        LifecycleState::Initializing,
        LifecycleState::Ready,
        LifecycleState::Starting,
        LifecycleState::Running,
        LifecycleState::Stopping,
        LifecycleState::Closed,
        LifecycleState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Loaded => "loaded",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Closed => "closed",
            LifecycleState::Failed => "failed",
        }
    }

    /// `Closed` is the only state nothing leaves.
    pub fn is_closed(&self) -> bool {
        matches!(self, LifecycleState::Closed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, LifecycleState::Failed)
    }

    /// A module whose activity is live or in transition.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LifecycleState::Starting | LifecycleState::Running | LifecycleState::Stopping
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that move a module between states.
///
/// `Initialized`, `Started` and `Stopped` are the second phase of the
/// two-phase `initialize`, `start` and `stop` triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Initialize,
    Initialized,
    Start,
    Started,
    Stop,
    Stopped,
    Shutdown,
    Fail,
}

impl Trigger {
    pub const ALL: [Trigger; 8] = [
        Trigger::Initialize,
        Trigger::Initialized,
        Trigger::Start,
        Trigger::Started,
        Trigger::Stop,
        Trigger::Stopped,
        Trigger::Shutdown,
        Trigger::Fail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Initialize => "initialize",
            Trigger::Initialized => "initialized",
            Trigger::Start => "start",
            Trigger::Started => "started",
            Trigger::Stop => "stop",
            Trigger::Stopped => "stopped",
            Trigger::Shutdown => "shutdown",
            Trigger::Fail => "fail",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transition table. `None` means the trigger is illegal from `from`.
///
/// `shutdown` is accepted from every state but `Closed` (including `Failed`,
/// which is how a failed module gets torn down). `fail` is accepted from
/// every state but `Closed` and `Failed`.
pub fn next_state(from: LifecycleState, trigger: Trigger) -> Option<LifecycleState> {
    use LifecycleState::*;

    match (trigger, from) {
        (Trigger::Initialize, Loaded) => Some(Initializing),
        (Trigger::Initialized, Initializing) => Some(Ready),
        (Trigger::Start, Ready) => Some(Starting),
        (Trigger::Started, Starting) => Some(Running),
        (Trigger::Stop, Running) => Some(Stopping),
        (Trigger::Stopped, Stopping) => Some(Ready),
        (Trigger::Shutdown, Closed) => None,
        (Trigger::Shutdown, _) => Some(Closed),
        (Trigger::Fail, Closed | Failed) => None,
        (Trigger::Fail, _) => Some(Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn happy_path_walks_every_two_phase_edge() {
        let mut state = LifecycleState::Loaded;
        for trigger in [
            Trigger::Initialize,
            Trigger::Initialized,
            Trigger::Start,
            Trigger::Started,
            Trigger::Stop,
            Trigger::Stopped,
            Trigger::Shutdown,
        ] {
            state = next_state(state, trigger).expect("edge must exist");
        }
        assert_eq!(state, LifecycleState::Closed);
    }

    #[test]
    fn closed_accepts_nothing() {
        for trigger in Trigger::ALL {
            assert_eq!(next_state(LifecycleState::Closed, trigger), None);
        }
    }

    #[test]
    fn failed_only_accepts_shutdown() {
        for trigger in Trigger::ALL {
            let next = next_state(LifecycleState::Failed, trigger);
            if trigger == Trigger::Shutdown {
                assert_eq!(next, Some(LifecycleState::Closed));
            } else {
                assert_eq!(next, None, "{trigger} must be rejected while failed");
            }
        }
    }

    #[test]
    fn every_state_is_reachable_from_loaded() {
        let mut seen = HashSet::from([LifecycleState::Loaded]);
        let mut frontier = vec![LifecycleState::Loaded];
        while let Some(state) = frontier.pop() {
            for trigger in Trigger::ALL {
                if let Some(next) = next_state(state, trigger) {
                    if seen.insert(next) {
                        frontier.push(next);
                    }
                }
            }
        }
        assert_eq!(seen.len(), LifecycleState::ALL.len());
    }

    #[test]
    fn stop_is_illegal_while_starting() {
        assert_eq!(next_state(LifecycleState::Starting, Trigger::Stop), None);
    }
}
