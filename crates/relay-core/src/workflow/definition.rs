//! Workflow definitions and design-time validation
//!
//! Definitions are validated eagerly: step names must be unique, `depends_on`
//! must reference declared steps, and the dependency relation must be
//! acyclic. Validation works over an arena (step list + name→index map), not
//! a pointer graph.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::step::StepDef;

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail the workflow immediately.
    #[default]
    Stop,

    /// Continue to the next step; terminal status becomes PARTIAL.
    Continue,

    /// Retry per the step's retry policy, then escalate per `strict`.
    Retry,
}

/// How steps are ordered for execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// Strictly declared order.
    #[default]
    Sequential,

    /// Accepted and validated; currently executed sequentially.
    ParallelWherePossible,
}

/// Definition-time validation failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WorkflowValidationError {
    #[error("duplicate step name: {0}")]
    DuplicateStepName(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}' depends on later step '{dependency}'")]
    ForwardDependency { step: String, dependency: String },

    #[error("dependency cycle involving step '{0}'")]
    DependencyCycle(String),
}

/// Design-time definition of a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowDef {
    pub name: String,
    pub version: u32,
    pub steps: Vec<StepDef>,
    pub error_policy: ErrorPolicy,
    pub execution_policy: ExecutionPolicy,
}

impl WorkflowDef {
    pub fn new(name: impl Into<String>, steps: Vec<StepDef>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            steps,
            error_policy: ErrorPolicy::Stop,
            execution_policy: ExecutionPolicy::Sequential,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.execution_policy = policy;
        self
    }

    /// Index of a step by name.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Validate names and the dependency relation.
    ///
    /// `depends_on` entries must name earlier-declared steps; since the
    /// declared order is the execution order, this also makes the relation
    /// acyclic.
    pub fn validate(&self) -> Result<(), WorkflowValidationError> {
        let mut index_by_name: HashMap<&str, usize> = HashMap::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            if index_by_name.insert(step.name.as_str(), index).is_some() {
                return Err(WorkflowValidationError::DuplicateStepName(
                    step.name.clone(),
                ));
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            for dependency in &step.depends_on {
                match index_by_name.get(dependency.as_str()) {
                    None => {
                        return Err(WorkflowValidationError::UnknownDependency {
                            step: step.name.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                    Some(&dep_index) if dep_index == index => {
                        return Err(WorkflowValidationError::DependencyCycle(step.name.clone()));
                    }
                    Some(&dep_index) if dep_index > index => {
                        return Err(WorkflowValidationError::ForwardDependency {
                            step: step.name.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(name: &str) -> StepDef {
        StepDef::operation(name, format!("op.{name}"))
    }

    #[test]
    fn test_valid_definition() {
        let def = WorkflowDef::new(
            "etl",
            vec![
                op("extract"),
                op("transform").with_depends_on(vec!["extract".to_string()]),
                op("load").with_depends_on(vec!["transform".to_string()]),
            ],
        );

        assert!(def.validate().is_ok());
        assert_eq!(def.step_index("transform"), Some(1));
        assert_eq!(def.step_index("missing"), None);
    }

    #[test]
    fn test_empty_definition_is_valid() {
        let def = WorkflowDef::new("empty", vec![]);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let def = WorkflowDef::new("dup", vec![op("a"), op("a")]);
        assert_eq!(
            def.validate(),
            Err(WorkflowValidationError::DuplicateStepName("a".to_string()))
        );
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let def = WorkflowDef::new(
            "bad",
            vec![op("a").with_depends_on(vec!["ghost".to_string()])],
        );
        assert!(matches!(
            def.validate(),
            Err(WorkflowValidationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let def = WorkflowDef::new("cyc", vec![op("a").with_depends_on(vec!["a".to_string()])]);
        assert_eq!(
            def.validate(),
            Err(WorkflowValidationError::DependencyCycle("a".to_string()))
        );
    }

    #[test]
    fn test_forward_dependency_rejected() {
        // b -> a declared after it; with declared-order execution this is a
        // cycle in disguise.
        let def = WorkflowDef::new(
            "fwd",
            vec![op("a").with_depends_on(vec!["b".to_string()]), op("b")],
        );
        assert!(matches!(
            def.validate(),
            Err(WorkflowValidationError::ForwardDependency { .. })
        ));
    }
}
