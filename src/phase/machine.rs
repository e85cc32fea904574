use std::fmt;

use serde::{Deserialize, Serialize};

/// Workflow phase of a research session.
///
/// Phases follow the information search process: a session moves forward
/// one phase at a time and may roll back a single step, except out of
/// Closed which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Initiation,
    Exploration,
    Formulation,
    Collection,
    Presentation,
    Closed,
}

impl Phase {
    /// Declared edges out of this phase, forward step first.
    /// The gate evaluator decides whether an edge is currently satisfied;
    /// anything not listed here is never reachable.
    pub fn allowed_transitions(&self) -> &'static [Phase] {
        use Phase::*;
        match self {
            Initiation => &[Exploration],
            Exploration => &[Formulation, Initiation],
            Formulation => &[Collection, Exploration],
            Collection => &[Presentation, Formulation],
            Presentation => &[Closed, Collection],
            Closed => &[],
        }
    }

    pub fn can_transition_to(&self, target: Phase) -> bool {
        self.allowed_transitions().contains(&target)
    }

    /// The single forward successor, if any.
    pub fn next(&self) -> Option<Phase> {
        use Phase::*;
        match self {
            Initiation => Some(Exploration),
            Exploration => Some(Formulation),
            Formulation => Some(Collection),
            Collection => Some(Presentation),
            Presentation => Some(Closed),
            Closed => None,
        }
    }

    /// True when `target` is the one-step rollback edge out of this phase.
    pub fn is_rollback_to(&self, target: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, target),
            (Exploration, Initiation)
                | (Formulation, Exploration)
                | (Collection, Formulation)
                | (Presentation, Collection)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiation => "initiation",
            Self::Exploration => "exploration",
            Self::Formulation => "formulation",
            Self::Collection => "collection",
            Self::Presentation => "presentation",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initiation => "Initiation",
            Self::Exploration => "Exploration",
            Self::Formulation => "Formulation",
            Self::Collection => "Collection",
            Self::Presentation => "Presentation",
            Self::Closed => "Closed",
        };
        write!(f, "{}", s)
    }
}
