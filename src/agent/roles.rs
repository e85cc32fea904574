//! Role registry: execution configuration per dispatchable task type.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::dispatch::{Lane, RetryPolicy, TaskType};
use crate::error::Result;

/// How one task type runs: which prompt template the generator resolves,
/// which lane it occupies, how stubborn retries are, and any provider
/// parameters passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub prompt_ref: String,
    #[serde(default)]
    pub lane: Lane,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub model_params: serde_json::Value,
}

impl RoleConfig {
    pub fn new(prompt_ref: impl Into<String>) -> Self {
        Self {
            prompt_ref: prompt_ref.into(),
            lane: Lane::Default,
            retry: RetryPolicy::default(),
            model_params: serde_json::Value::Null,
        }
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_model_params(mut self, params: serde_json::Value) -> Self {
        self.model_params = params;
        self
    }
}

/// Task type to role lookup. The dispatcher refuses task types the registry
/// does not know, so the registry is the single list of what agents can do.
pub trait RoleRegistry: Send + Sync {
    fn role(&self, task_type: &TaskType) -> Option<RoleConfig>;
    fn task_types(&self) -> Vec<TaskType>;
}

/// Registry backed by a plain table, loadable from TOML:
///
/// ```toml
/// [roles.question_refinement]
/// prompt_ref = "research/question-refinement"
/// lane = "stream"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleTable {
    roles: HashMap<String, RoleConfig>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, task_type: impl Into<String>, config: RoleConfig) -> Self {
        self.roles.insert(task_type.into(), config);
        self
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let table: RoleTable = toml::from_str(content)?;
        Ok(table)
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// The standard research workflow roles. The demo runs on these; real
    /// deployments load their own table.
    pub fn builtin() -> Self {
        Self::new()
            .with_role(
                "question_refinement",
                RoleConfig::new("research/question-refinement")
                    .with_lane(Lane::Stream)
                    .with_model_params(serde_json::json!({ "temperature": 0.7 })),
            )
            .with_role(
                "keyword_extraction",
                RoleConfig::new("research/keyword-extraction")
                    .with_model_params(serde_json::json!({ "temperature": 0.2 })),
            )
            .with_role(
                "scope_summary",
                RoleConfig::new("research/scope-summary"),
            )
            .with_role(
                "feasibility_scoring",
                RoleConfig::new("research/feasibility-scoring"),
            )
    }
}

impl RoleRegistry for RoleTable {
    fn role(&self, task_type: &TaskType) -> Option<RoleConfig> {
        self.roles.get(task_type.as_str()).cloned()
    }

    fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.roles.keys().map(|k| TaskType::from(k.as_str())).collect();
        types.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_roles() {
        let table = RoleTable::builtin();
        let role = table.role(&TaskType::new("question_refinement")).unwrap();
        assert_eq!(role.lane, Lane::Stream);
        let role = table.role(&TaskType::new("keyword_extraction")).unwrap();
        assert_eq!(role.lane, Lane::Default);
        assert!(table.role(&TaskType::new("summon_demon")).is_none());
    }

    #[test]
    fn test_toml_round_trip() {
        let table = RoleTable::from_toml(
            r#"
            [roles.scope_summary]
            prompt_ref = "research/scope-summary"

            [roles.question_refinement]
            prompt_ref = "research/question-refinement"
            lane = "stream"

            [roles.question_refinement.retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        let role = table.role(&TaskType::new("question_refinement")).unwrap();
        assert_eq!(role.lane, Lane::Stream);
        assert_eq!(role.retry.max_attempts, 5);
        assert_eq!(role.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);

        let role = table.role(&TaskType::new("scope_summary")).unwrap();
        assert_eq!(role.lane, Lane::Default);
    }

    #[test]
    fn test_task_types_sorted() {
        let types = RoleTable::builtin().task_types();
        let names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn test_bad_lane_rejected() {
        let result = RoleTable::from_toml(
            r#"
            [roles.broken]
            prompt_ref = "x"
            lane = "sideways"
            "#,
        );
        assert!(result.is_err());
    }
}
