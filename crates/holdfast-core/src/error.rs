use crate::graph::GraphError;
use crate::id::NodeId;

/// Validation failures returned by request-facing engine operations.
///
/// These are always surfaced to the caller; background failures use
/// [`crate::collab::GatewayError`] and are logged instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NodeError {
    #[error("construction level already at maximum")]
    ConstructionLevelMaxReached,
    #[error("construction level already at zero")]
    ConstructionLevelMinReached,
    #[error("node is under construction; only construction is possible")]
    OnlyConstructionPossible,
    #[error("not possible while reinforced")]
    NotPossibleDuringReinforce,
    #[error("network contains a reinforced node")]
    NetworkHasReinforcedNode,
    #[error("network has no base")]
    NoBaseInNetwork,
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),
    #[error("invalid connection weight: {0}")]
    InvalidWeight(f64),
    #[error("invalid reinforce offset hour: {0}")]
    InvalidOffset(u8),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            NodeError::ConstructionLevelMinReached.to_string(),
            "construction level already at zero"
        );
        assert_eq!(NodeError::InvalidOffset(24).to_string(), "invalid reinforce offset hour: 24");
    }
}
