//! Session mutations derived from task outputs.

use crate::dispatch::TaskOutput;
use crate::error::{Result, WorkflowError};
use crate::session::{
    Author, FeasibilityAssessment, ReflectionEntry, ScopeElement, SessionSnapshot,
};

/// A mutation the reconciler applies inside the store's write path.
///
/// Commutative mutations merge cleanly no matter what committed since the
/// producing task was issued. Non-commutative ones replace state the user
/// may have edited meanwhile, so they carry a staleness guard against the
/// question revision and reject rather than overwrite.
#[derive(Debug, Clone)]
pub enum SessionMutation {
    MergeKeywords(Vec<String>),
    AppendScopeElements(Vec<ScopeElement>),
    AppendReflection { author: Author, text: String },
    ReplaceQuestion { text: String },
    SetFeasibility {
        score: u8,
        is_niche: bool,
        summary: String,
    },
}

impl SessionMutation {
    pub fn from_output(output: TaskOutput) -> Self {
        match output {
            TaskOutput::Keywords { keywords } => Self::MergeKeywords(keywords),
            TaskOutput::ScopeElements { elements } => Self::AppendScopeElements(elements),
            TaskOutput::Reflection { text } => Self::AppendReflection {
                author: Author::Agent,
                text,
            },
            TaskOutput::RefinedQuestion { text } => Self::ReplaceQuestion { text },
            TaskOutput::Feasibility {
                score,
                is_niche,
                summary,
            } => Self::SetFeasibility {
                score,
                is_niche,
                summary,
            },
        }
    }

    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            Self::MergeKeywords(_) | Self::AppendScopeElements(_) | Self::AppendReflection { .. }
        )
    }

    /// Apply to a working snapshot. `issued_version` is the session version
    /// the producing task was dispatched against; `snapshot.version` is
    /// already the version this commit will land at.
    pub fn apply(self, snapshot: &mut SessionSnapshot, issued_version: u64) -> Result<()> {
        // A result can slip past the flight check while its session closes;
        // closed sessions accept no agent output at all.
        if snapshot.phase.is_terminal() {
            return Err(WorkflowError::StaleResult(
                "session is closed".to_string(),
            ));
        }
        match self {
            Self::MergeKeywords(keywords) => {
                let before = snapshot.keywords.len();
                for keyword in keywords {
                    let keyword = keyword.trim().to_string();
                    if !keyword.is_empty() {
                        snapshot.keywords.insert(keyword);
                    }
                }
                if snapshot.keywords.len() == before {
                    snapshot.keyword_stability += 1;
                } else {
                    snapshot.keyword_stability = 0;
                }
                Ok(())
            }
            Self::AppendScopeElements(elements) => {
                for element in elements {
                    let exists = snapshot
                        .scope_elements
                        .iter()
                        .any(|e| e.name == element.name);
                    if !exists {
                        snapshot.scope_elements.push(element);
                    }
                }
                Ok(())
            }
            Self::AppendReflection { author, text } => {
                snapshot
                    .reflection_log
                    .push(ReflectionEntry::new(author, text));
                Ok(())
            }
            Self::ReplaceQuestion { text } => {
                guard_question_unchanged(snapshot, issued_version, "refined question")?;
                if snapshot.question.is_locked() {
                    return Err(WorkflowError::QuestionLocked);
                }
                snapshot.question.text = text;
                snapshot.question.revision = snapshot.version;
                Ok(())
            }
            Self::SetFeasibility {
                score,
                is_niche,
                summary,
            } => {
                guard_question_unchanged(snapshot, issued_version, "feasibility assessment")?;
                snapshot.feasibility = Some(FeasibilityAssessment::new(
                    score,
                    is_niche,
                    summary,
                    snapshot.version,
                ));
                Ok(())
            }
        }
    }
}

fn guard_question_unchanged(
    snapshot: &SessionSnapshot,
    issued_version: u64,
    what: &str,
) -> Result<()> {
    if snapshot.question.revision > issued_version {
        return Err(WorkflowError::StaleResult(format!(
            "{} was computed against version {} but the question changed at version {}",
            what, issued_version, snapshot.question.revision
        )));
    }
    Ok(())
}
