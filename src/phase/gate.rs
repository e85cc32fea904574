//! Gate evaluation for phase transitions.
//!
//! The evaluator is pure: same snapshot and target always produce the same
//! decision, and a denial carries every unmet requirement so a client can
//! render the full remaining checklist instead of discovering requirements
//! one failure at a time.

use crate::config::GateConfig;
use crate::phase::Phase;
use crate::session::{Author, FeasibilityStatus, SessionSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    QuestionLocked,
    MinKeywords(usize),
    MinScopeElements(usize),
    FeasibilityAtLeast(FeasibilityStatus),
    MinUserReflections(usize),
}

impl Requirement {
    /// Returns None when satisfied, otherwise a user-facing reason.
    pub fn check(&self, snapshot: &SessionSnapshot) -> Option<String> {
        match self {
            Self::QuestionLocked => {
                if snapshot.question.is_locked() {
                    None
                } else {
                    Some("research question must be locked (currently draft)".to_string())
                }
            }
            Self::MinKeywords(min) => {
                let have = snapshot.keywords.len();
                if have >= *min {
                    None
                } else {
                    Some(format!("at least {} keywords required (have {})", min, have))
                }
            }
            Self::MinScopeElements(min) => {
                let have = snapshot.scope_elements.len();
                if have >= *min {
                    None
                } else {
                    Some(format!(
                        "at least {} scope elements required (have {})",
                        min, have
                    ))
                }
            }
            Self::FeasibilityAtLeast(min) => match snapshot.feasibility_status() {
                None => Some(format!(
                    "feasibility has not been assessed (minimum {})",
                    min
                )),
                Some(status) if status >= *min => None,
                Some(status) => Some(format!(
                    "feasibility must be at least {} (currently {})",
                    min, status
                )),
            },
            Self::MinUserReflections(min) => {
                let have = snapshot.reflections_by(Author::User);
                if have >= *min {
                    None
                } else {
                    Some(format!(
                        "at least {} user reflections required (have {})",
                        min, have
                    ))
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransitionRule {
    pub from: Phase,
    pub to: Phase,
    pub requirements: Vec<Requirement>,
    pub rollback: bool,
}

/// Outcome of evaluating one candidate transition. Allowed when no reason
/// remains; reasons are ordered by rule declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub from: Phase,
    pub to: Phase,
    pub reasons: Vec<String>,
}

impl GateDecision {
    pub fn allowed(&self) -> bool {
        self.reasons.is_empty()
    }
}

pub struct GateEvaluator {
    rules: Vec<TransitionRule>,
    allow_rollback: bool,
}

impl GateEvaluator {
    pub fn new(config: &GateConfig) -> Self {
        use Phase::*;
        let forward = |from, to, requirements| TransitionRule {
            from,
            to,
            requirements,
            rollback: false,
        };
        let rollback = |from, to| TransitionRule {
            from,
            to,
            requirements: Vec::new(),
            rollback: true,
        };

        let rules = vec![
            forward(
                Initiation,
                Exploration,
                vec![
                    Requirement::QuestionLocked,
                    Requirement::MinKeywords(config.min_keywords),
                ],
            ),
            forward(
                Exploration,
                Formulation,
                vec![
                    Requirement::MinScopeElements(config.min_scope_elements),
                    Requirement::FeasibilityAtLeast(config.min_feasibility),
                ],
            ),
            forward(
                Formulation,
                Collection,
                vec![
                    Requirement::QuestionLocked,
                    Requirement::MinUserReflections(config.collection_reflections),
                ],
            ),
            forward(
                Collection,
                Presentation,
                vec![
                    Requirement::MinKeywords(config.min_keywords),
                    Requirement::MinUserReflections(config.presentation_reflections),
                ],
            ),
            forward(Presentation, Closed, Vec::new()),
            rollback(Exploration, Initiation),
            rollback(Formulation, Exploration),
            rollback(Collection, Formulation),
            rollback(Presentation, Collection),
        ];

        Self {
            rules,
            allow_rollback: config.allow_rollback,
        }
    }

    pub fn rule(&self, from: Phase, to: Phase) -> Option<&TransitionRule> {
        self.rules.iter().find(|r| r.from == from && r.to == to)
    }

    /// Evaluate `snapshot` against the transition to `target`.
    ///
    /// Collects every failing requirement; an allowed decision has an empty
    /// reason list. Undeclared edges and disabled rollbacks are denials too,
    /// so callers never need a separate edge check.
    pub fn evaluate(&self, snapshot: &SessionSnapshot, target: Phase) -> GateDecision {
        let from = snapshot.phase;
        let mut reasons = Vec::new();

        if from == target {
            reasons.push(format!("session is already in {}", target));
            return GateDecision {
                from,
                to: target,
                reasons,
            };
        }

        let Some(rule) = self.rule(from, target) else {
            reasons.push(format!("no transition from {} to {}", from, target));
            return GateDecision {
                from,
                to: target,
                reasons,
            };
        };

        if rule.rollback && !self.allow_rollback {
            reasons.push("rollback transitions are disabled".to_string());
            return GateDecision {
                from,
                to: target,
                reasons,
            };
        }

        for requirement in &rule.requirements {
            if let Some(reason) = requirement.check(snapshot) {
                reasons.push(reason);
            }
        }

        GateDecision {
            from,
            to: target,
            reasons,
        }
    }
}
