//! Workflow step variants
//!
//! Steps come in five flavours: operation (delegates to a registered
//! operation), lambda (inline handler), choice (conditional branch), wait
//! (pause), and map (fan-out/fan-in). Authors build them through the factory
//! methods on [`StepDef`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::retry::RetryPolicy;

use super::context::{StepResult, WorkflowContext};
use super::definition::ErrorPolicy;

/// Read-only snapshot handed to a lambda step handler.
#[derive(Debug, Clone)]
pub struct StepInput {
    /// Submission params.
    pub params: serde_json::Value,

    /// Current workflow state (prior step outputs and anything set since).
    pub state: serde_json::Value,

    /// Step-level config from the definition.
    pub config: serde_json::Value,

    /// For map iterations: the current item.
    pub item: Option<serde_json::Value>,
}

/// Inline step handler.
pub type StepHandler = Arc<
    dyn Fn(StepInput) -> Pin<Box<dyn Future<Output = Result<StepResult, CoreError>> + Send>>
        + Send
        + Sync,
>;

/// Branch condition for choice steps.
pub type ChoiceCondition = Arc<dyn Fn(&WorkflowContext) -> bool + Send + Sync>;

/// How long a wait step suspends.
#[derive(Debug, Clone, PartialEq)]
pub enum Wait {
    /// Fixed duration.
    For(Duration),

    /// Until a wall-clock instant; already-past instants do not wait.
    Until(DateTime<Utc>),
}

/// The per-variant payload of a step.
#[derive(Clone)]
pub enum StepKind {
    /// Delegates to a registered operation via the dispatcher.
    Operation {
        operation_name: String,
        config: serde_json::Value,
    },

    /// Inline handler invoked with `(context snapshot, config)`.
    Lambda { handler: StepHandler },

    /// Conditional branch; intermediate steps are skipped.
    Choice {
        condition: ChoiceCondition,
        then_step: String,
        else_step: String,
    },

    /// Cooperative pause; honours cancellation.
    Wait { wait: Wait },

    /// Fan-out `iterator` over the items at `state[items_key]`, fan-in the
    /// ordered outputs under the step's name.
    Map {
        items_key: String,
        iterator: Box<StepDef>,
        max_parallel: usize,
    },
}

impl StepKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Operation { .. } => "operation",
            Self::Lambda { .. } => "lambda",
            Self::Choice { .. } => "choice",
            Self::Wait { .. } => "wait",
            Self::Map { .. } => "map",
        }
    }
}

impl fmt::Debug for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation {
                operation_name, ..
            } => f
                .debug_struct("Operation")
                .field("operation_name", operation_name)
                .finish(),
            Self::Lambda { .. } => f.debug_struct("Lambda").finish_non_exhaustive(),
            Self::Choice {
                then_step,
                else_step,
                ..
            } => f
                .debug_struct("Choice")
                .field("then_step", then_step)
                .field("else_step", else_step)
                .finish_non_exhaustive(),
            Self::Wait { wait } => f.debug_struct("Wait").field("wait", wait).finish(),
            Self::Map {
                items_key,
                max_parallel,
                ..
            } => f
                .debug_struct("Map")
                .field("items_key", items_key)
                .field("max_parallel", max_parallel)
                .finish_non_exhaustive(),
        }
    }
}

/// A single workflow step.
#[derive(Debug, Clone)]
pub struct StepDef {
    pub name: String,
    pub kind: StepKind,

    /// What to do when this step fails; `None` inherits the workflow's
    /// error policy.
    pub on_error: Option<ErrorPolicy>,

    /// Step-level retry policy, used when `on_error` is RETRY.
    pub retry_policy: Option<RetryPolicy>,

    /// Under RETRY, whether exhaustion escalates to workflow failure.
    pub strict: bool,

    /// Ordering hints; must reference earlier-declared steps.
    pub depends_on: Vec<String>,
}

impl StepDef {
    fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            on_error: None,
            retry_policy: None,
            strict: true,
            depends_on: Vec::new(),
        }
    }

    /// A step that dispatches a registered operation.
    pub fn operation(name: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self::new(
            name,
            StepKind::Operation {
                operation_name: operation_name.into(),
                config: serde_json::Value::Null,
            },
        )
    }

    /// An inline handler step.
    pub fn lambda<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult, CoreError>> + Send + 'static,
    {
        Self::new(
            name,
            StepKind::Lambda {
                handler: Arc::new(move |input| Box::pin(f(input))),
            },
        )
    }

    /// A conditional branch.
    pub fn choice<C>(
        name: impl Into<String>,
        condition: C,
        then_step: impl Into<String>,
        else_step: impl Into<String>,
    ) -> Self
    where
        C: Fn(&WorkflowContext) -> bool + Send + Sync + 'static,
    {
        Self::new(
            name,
            StepKind::Choice {
                condition: Arc::new(condition),
                then_step: then_step.into(),
                else_step: else_step.into(),
            },
        )
    }

    /// A fixed-duration pause.
    pub fn wait(name: impl Into<String>, duration: Duration) -> Self {
        Self::new(
            name,
            StepKind::Wait {
                wait: Wait::For(duration),
            },
        )
    }

    /// A pause until a wall-clock instant.
    pub fn wait_until(name: impl Into<String>, until: DateTime<Utc>) -> Self {
        Self::new(
            name,
            StepKind::Wait {
                wait: Wait::Until(until),
            },
        )
    }

    /// A fan-out/fan-in step.
    pub fn map(
        name: impl Into<String>,
        items_key: impl Into<String>,
        iterator: StepDef,
        max_parallel: usize,
    ) -> Self {
        Self::new(
            name,
            StepKind::Map {
                items_key: items_key.into(),
                iterator: Box::new(iterator),
                max_parallel: max_parallel.max(1),
            },
        )
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        if let StepKind::Operation {
            config: step_config,
            ..
        } = &mut self.kind
        {
            *step_config = config;
        }
        self
    }

    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = Some(policy);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_step_builder() {
        let step = StepDef::operation("ingest", "filings.ingest")
            .with_config(json!({"form": "10-K"}))
            .with_on_error(ErrorPolicy::Continue);

        assert_eq!(step.name, "ingest");
        assert_eq!(step.on_error, Some(ErrorPolicy::Continue));
        match &step.kind {
            StepKind::Operation {
                operation_name,
                config,
            } => {
                assert_eq!(operation_name, "filings.ingest");
                assert_eq!(config, &json!({"form": "10-K"}));
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_lambda_step_invokes() {
        let step = StepDef::lambda("double", |input: StepInput| async move {
            let n = input.params["n"].as_i64().unwrap_or(0);
            Ok(StepResult::ok(json!({"doubled": n * 2})))
        });

        let handler = match &step.kind {
            StepKind::Lambda { handler } => Arc::clone(handler),
            other => panic!("unexpected kind: {other:?}"),
        };

        let result = handler(StepInput {
            params: json!({"n": 21}),
            state: json!({}),
            config: serde_json::Value::Null,
            item: None,
        })
        .await
        .unwrap();

        assert_eq!(result.output, Some(json!({"doubled": 42})));
    }

    #[test]
    fn test_choice_condition() {
        let step = StepDef::choice(
            "route",
            |ctx: &WorkflowContext| ctx.params["annual"].as_bool().unwrap_or(false),
            "annual",
            "quarterly",
        );

        let condition = match &step.kind {
            StepKind::Choice { condition, .. } => Arc::clone(condition),
            other => panic!("unexpected kind: {other:?}"),
        };

        let ctx = WorkflowContext::new(uuid::Uuid::now_v7(), json!({"annual": true}));
        assert!(condition(&ctx));
    }

    #[test]
    fn test_map_parallelism_floor() {
        let step = StepDef::map("fan", "items", StepDef::operation("each", "op"), 0);
        match step.kind {
            StepKind::Map { max_parallel, .. } => assert_eq!(max_parallel, 1),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(
            StepDef::operation("a", "op").kind.kind_name(),
            "operation"
        );
        assert_eq!(
            StepDef::wait("b", Duration::from_secs(1)).kind.kind_name(),
            "wait"
        );
    }
}
