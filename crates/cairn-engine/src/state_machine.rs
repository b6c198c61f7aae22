//! Node state transitions

use crate::error::StateMachineError;
use crate::types::NodeState;

/// Validates a node state transition.
///
/// Cells resolve in one step (`Pending -> Resolved`); resource nodes pass
/// through `Resolving` while their provider call is in flight. Terminal states
/// have no outgoing transitions, which is what makes every node's slot
/// write-once.
pub fn validate_transition(from: NodeState, to: NodeState) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: NodeState) -> &'static [NodeState] {
    use NodeState::{Failed, Pending, Resolved, Resolving};
    match from {
        Pending => &[Resolving, Resolved, Failed],
        Resolving => &[Resolved, Failed],
        Resolved | Failed => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_lifecycle_is_allowed() {
        assert!(validate_transition(NodeState::Pending, NodeState::Resolving).is_ok());
        assert!(validate_transition(NodeState::Resolving, NodeState::Resolved).is_ok());
        assert!(validate_transition(NodeState::Resolving, NodeState::Failed).is_ok());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for to in [
            NodeState::Pending,
            NodeState::Resolving,
            NodeState::Resolved,
            NodeState::Failed,
        ] {
            assert!(validate_transition(NodeState::Resolved, to).is_err());
            assert!(validate_transition(NodeState::Failed, to).is_err());
        }
    }

    #[test]
    fn test_cannot_go_back_to_pending() {
        assert_eq!(
            validate_transition(NodeState::Resolving, NodeState::Pending),
            Err(StateMachineError::IllegalTransition {
                from: NodeState::Resolving,
                to: NodeState::Pending,
            })
        );
    }
}
