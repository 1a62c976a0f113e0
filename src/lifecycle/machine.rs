// src/lifecycle/machine.rs

//! The state machine shared by the supervisor and every subsystem.

use tokio::sync::watch;
use tracing::{debug, error};

use crate::errors::{AthomeError, Result};
use crate::lifecycle::state::{LifecycleState, Trigger, next_state};

/// Current lifecycle state of one named module.
///
/// The state is published through a `watch` channel so handles held by other
/// tasks can observe it without touching the module itself.
#[derive(Debug)]
pub struct StateMachine {
    name: String,
    state: watch::Sender<LifecycleState>,
    failure: Option<String>,
}

impl StateMachine {
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Loaded);
        Self {
            name: name.into(),
            state,
            failure: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Error recorded by the last `fail`, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Check whether `trigger` is legal right now without firing it.
    pub fn can(&self, trigger: Trigger) -> bool {
        next_state(self.state(), trigger).is_some()
    }

    /// Fire `trigger`. On an illegal trigger the state is left unchanged.
    pub fn fire(&mut self, trigger: Trigger) -> Result<LifecycleState> {
        let from = self.state();
        let Some(to) = next_state(from, trigger) else {
            error!(
                module = %self.name,
                %trigger,
                state = %from,
                "illegal lifecycle trigger"
            );
            return Err(AthomeError::InvalidTransition {
                module: self.name.clone(),
                trigger,
                state: from,
            });
        };

        self.state.send_replace(to);
        debug!(module = %self.name, %trigger, %from, %to, "lifecycle transition");
        Ok(to)
    }

    /// Fire `fail` and remember why.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<LifecycleState> {
        let to = self.fire(Trigger::Fail)?;
        self.failure = Some(reason.into());
        Ok(to)
    }
}
