//! Sandbox instance record and lifecycle states.
//!
//! The provider-specific handle is owned exclusively by the manager; every
//! other component refers to an instance by its id only.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::config::SandboxConfig;

/// Lifecycle states of a sandbox instance.
///
/// Transitions: Provisioning -> Ready <-> Busy, any state -> Stopping ->
/// Terminated, and Provisioning/Ready/Busy -> Failed on a provider fault.
/// No operation is accepted on a Terminated instance except idempotent stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Provisioning,
    Ready,
    Busy,
    Stopping,
    Terminated,
    Failed,
}

impl SandboxState {
    pub fn is_live(self) -> bool {
        matches!(self, SandboxState::Ready | SandboxState::Busy)
    }
}

/// Bookkeeping record for one isolated execution environment.
#[derive(Debug)]
pub struct SandboxInstance {
    pub id: String,
    pub state: SandboxState,
    pub config: SandboxConfig,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl SandboxInstance {
    pub fn new(id: impl Into<String>, config: SandboxConfig) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            state: SandboxState::Provisioning,
            config,
            created_at: now,
            last_used: now,
        }
    }

    pub fn mark_ready(&mut self) {
        self.state = SandboxState::Ready;
    }

    pub fn mark_busy(&mut self) {
        self.state = SandboxState::Busy;
    }

    pub fn mark_stopping(&mut self) {
        self.state = SandboxState::Stopping;
    }

    /// Terminal states refresh the timestamp too: the sweep prunes the
    /// record once it has been terminated for a full TTL, not sooner.
    pub fn mark_terminated(&mut self) {
        self.state = SandboxState::Terminated;
        self.touch();
    }

    pub fn mark_failed(&mut self) {
        self.state = SandboxState::Failed;
        self.touch();
    }

    /// Refresh the last-used timestamp. Called on warm reuse and after each
    /// execute/transfer so the idle sweep only evicts genuinely cold
    /// instances.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instances_start_provisioning() {
        let instance = SandboxInstance::new("sb-1", SandboxConfig::default());
        assert_eq!(instance.state, SandboxState::Provisioning);
        assert!(!instance.is_live());
    }

    #[test]
    fn state_transitions() {
        let mut instance = SandboxInstance::new("sb-1", SandboxConfig::default());
        instance.mark_ready();
        assert!(instance.is_live());
        instance.mark_busy();
        assert!(instance.is_live());
        instance.mark_stopping();
        instance.mark_terminated();
        assert_eq!(instance.state, SandboxState::Terminated);
        assert!(!instance.is_live());
    }
}
