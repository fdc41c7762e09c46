//! Guest and host session state machines.

use crate::error::LifecycleCause;
use serde::{Deserialize, Serialize};

/// Guest session lifecycle.
///
/// # State Transitions
///
/// ```text
/// Uninitialized → Initializing → Initialized
///       ↑              │
///       └──────────────┘ (handshake failed)
///
/// any non-terminal state → Destroyed
/// ```
///
/// # Invariants
///
/// - Synchronous accessors only succeed in `Initialized`
/// - `Destroyed` cannot transition to any other state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuestState {
    /// `init()` not called yet (or the last attempt failed).
    Uninitialized,

    /// `hello` sent, waiting for the host's reply.
    Initializing,

    /// Handshake completed.
    Initialized,

    /// Torn down, no longer usable.
    Destroyed,
}

impl GuestState {
    /// Check if transition to next state is valid.
    ///
    /// # Valid Transitions
    ///
    /// - Uninitialized → Initializing
    /// - Initializing → Initialized
    /// - Initializing → Uninitialized (handshake failed)
    /// - Uninitialized | Initializing | Initialized → Destroyed
    pub fn can_transition_to(&self, next: GuestState) -> bool {
        use GuestState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Initialized)
                | (Initializing, Uninitialized)
                | (Uninitialized, Destroyed)
                | (Initializing, Destroyed)
                | (Initialized, Destroyed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GuestState::Destroyed)
    }
}

/// Host session lifecycle.
///
/// # State Transitions
///
/// ```text
/// Created → Booted → Ready
///              │       │
///              ↓       ↓
///           Errored(cause)
///
/// any non-terminal state → Destroyed
/// ```
///
/// `Errored` can be re-entered: the hello and ready timers are independent
/// and each reports its own cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostState {
    /// Constructed, timers not armed.
    Created,

    /// `boot()` called, waiting for the guest's milestones.
    Booted,

    /// The guest sent `ready`.
    Ready,

    /// A handshake timer fired.
    Errored(LifecycleCause),

    /// Torn down, no longer usable.
    Destroyed,
}

impl HostState {
    /// Check if transition to next state is valid.
    ///
    /// # Valid Transitions
    ///
    /// - Created → Booted
    /// - Booted → Ready
    /// - Booted | Ready | Errored → Errored (a timer fired)
    /// - any non-terminal state → Destroyed
    pub fn can_transition_to(&self, next: HostState) -> bool {
        use HostState::*;
        match (self, next) {
            (Destroyed, _) => false,
            (_, Destroyed) => true,
            (Created, Booted) => true,
            (Booted, Ready) => true,
            (Booted | Ready | Errored(_), Errored(_)) => true,
            _ => false,
        }
    }

    /// Whether `boot()` has been called and the session is still alive.
    pub fn is_booted(&self) -> bool {
        matches!(self, HostState::Booted | HostState::Ready | HostState::Errored(_))
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HostState::Destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_state_transitions() {
        use GuestState::*;

        // Valid transitions
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Initialized));
        assert!(Initializing.can_transition_to(Uninitialized)); // Handshake failed
        assert!(Initialized.can_transition_to(Destroyed));

        // Invalid transitions
        assert!(!Uninitialized.can_transition_to(Initialized)); // Skip Initializing
        assert!(!Initialized.can_transition_to(Initializing)); // Re-init
        assert!(!Destroyed.can_transition_to(Uninitialized)); // From terminal state
    }

    #[test]
    fn test_guest_state_is_terminal() {
        use GuestState::*;

        assert!(!Uninitialized.is_terminal());
        assert!(!Initializing.is_terminal());
        assert!(!Initialized.is_terminal());
        assert!(Destroyed.is_terminal());
    }

    #[test]
    fn test_host_state_transitions() {
        use HostState::*;
        use LifecycleCause::*;

        // Valid transitions
        assert!(Created.can_transition_to(Booted));
        assert!(Booted.can_transition_to(Ready));
        assert!(Booted.can_transition_to(Errored(NotStarted)));
        assert!(Ready.can_transition_to(Errored(NotStarted))); // ready before hello
        assert!(Errored(NotStarted).can_transition_to(Errored(NotReady)));
        assert!(Created.can_transition_to(Destroyed));
        assert!(Errored(NotReady).can_transition_to(Destroyed));

        // Invalid transitions
        assert!(!Created.can_transition_to(Ready)); // Skip Booted
        assert!(!Errored(NotReady).can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Booted)); // Backward
        assert!(!Destroyed.can_transition_to(Booted)); // From terminal state
        assert!(!Destroyed.can_transition_to(Destroyed));
    }

    #[test]
    fn test_host_state_is_booted() {
        use HostState::*;

        assert!(!Created.is_booted());
        assert!(Booted.is_booted());
        assert!(Ready.is_booted());
        assert!(Errored(LifecycleCause::NotReady).is_booted());
        assert!(!Destroyed.is_booted()); // destroy resets the booted flag
        assert!(Destroyed.is_terminal());
    }
}
