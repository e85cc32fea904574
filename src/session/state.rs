//! Session state model: the snapshot every other component reads and mutates.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub(crate) String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl ToSql for SessionId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.0.as_bytes())))
    }
}

impl FromSql for SessionId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Text(s) => std::str::from_utf8(s)
                .map(|s| Self(s.to_string()))
                .map_err(|e| FromSqlError::Other(Box::new(e))),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    #[default]
    Draft,
    Locked,
}

/// The research question under refinement.
///
/// `revision` records the session version at which the text or status last
/// changed. Agent results issued against an older version are stale for any
/// question-dependent mutation and must be rejected, never merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub text: String,
    pub status: QuestionStatus,
    pub revision: u64,
}

impl Question {
    pub fn is_locked(&self) -> bool {
        self.status == QuestionStatus::Locked
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeElement {
    pub name: String,
    pub description: String,
}

impl ScopeElement {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Agent,
}

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionEntry {
    pub timestamp: DateTime<Utc>,
    pub author: Author,
    pub text: String,
}

impl ReflectionEntry {
    pub fn new(author: Author, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            author,
            text: text.into(),
        }
    }
}

/// Coarse feasibility rating derived from a numeric score and niche flag.
/// Ordering matters: gate rules compare against a minimum rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeasibilityStatus {
    Low,
    Medium,
    High,
}

impl FeasibilityStatus {
    /// Niche topics are capped at Low regardless of score; otherwise the
    /// score buckets are 0..4 Low, 4..8 Medium, 8..=10 High.
    pub fn from_assessment(score: u8, is_niche: bool) -> Self {
        if is_niche || score < 4 {
            Self::Low
        } else if score >= 8 {
            Self::High
        } else {
            Self::Medium
        }
    }

    pub fn resource_suggestion(&self) -> &'static str {
        match self {
            Self::Low => "Consider broadening the topic or consulting a subject librarian",
            Self::Medium => "Library databases and subject bibliographies should suffice",
            Self::High => "General catalogs and open-web sources will cover this topic",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for FeasibilityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeasibilityAssessment {
    pub score: u8,
    pub is_niche: bool,
    pub status: FeasibilityStatus,
    pub summary: String,
    /// Session version the assessment was computed against.
    pub assessed_at_version: u64,
}

impl FeasibilityAssessment {
    pub fn new(score: u8, is_niche: bool, summary: impl Into<String>, at_version: u64) -> Self {
        let score = score.min(10);
        Self {
            score,
            is_niche,
            status: FeasibilityStatus::from_assessment(score, is_niche),
            summary: summary.into(),
            assessed_at_version: at_version,
        }
    }
}

/// Full state of one research session.
///
/// Snapshots are value objects: reads hand out clones, mutations go through
/// the store which bumps `version` on every committed change. Two snapshots
/// with the same session id and version are identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub phase: Phase,
    pub question: Question,
    pub keywords: BTreeSet<String>,
    /// Consecutive keyword merges that added nothing new.
    pub keyword_stability: u32,
    pub scope_elements: Vec<ScopeElement>,
    pub feasibility: Option<FeasibilityAssessment>,
    pub reflection_log: Vec<ReflectionEntry>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            phase: Phase::Initiation,
            question: Question::default(),
            keywords: BTreeSet::new(),
            keyword_stability: 0,
            scope_elements: Vec::new(),
            feasibility: None,
            reflection_log: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn reflections_by(&self, author: Author) -> usize {
        self.reflection_log
            .iter()
            .filter(|entry| entry.author == author)
            .count()
    }

    pub fn feasibility_status(&self) -> Option<FeasibilityStatus> {
        self.feasibility.as_ref().map(|f| f.status)
    }
}
