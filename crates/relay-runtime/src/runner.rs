//! Workflow runner
//!
//! Evaluates a workflow definition step by step against a context: operation
//! steps dispatch through the Dispatcher and await terminal state, lambda
//! steps run inline, choice steps branch (skipping the untaken path), wait
//! steps suspend cooperatively, and map steps fan out with a bounded worker
//! budget and fan in ordered outputs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use relay_core::bus::EventBus;
use relay_core::error::CoreError;
use relay_core::event::{event_type, BusEvent, NewEvent};
use relay_core::registry::{Handler, HandlerContext};
use relay_core::retry::RetryPolicy;
use relay_core::run::{RunRecord, RunStatus};
use relay_core::spec::WorkKind;
use relay_core::workflow::{
    ErrorPolicy, StepDef, StepInput, StepKind, StepResult, Wait, WorkflowContext, WorkflowDef,
    WorkflowStatus, WorkflowValidationError,
};
use relay_storage::Ledger;

use crate::dispatcher::{DispatchError, Dispatcher};

/// Reason recorded on steps skipped by branching.
const BRANCH_NOT_TAKEN: &str = "branch_not_taken";

/// Reason recorded on steps skipped by cancellation.
const CANCELLED: &str = "cancelled";

/// Errors from workflow registration.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowRegistrationError {
    #[error("invalid workflow definition: {0}")]
    Invalid(#[from] WorkflowValidationError),

    #[error("workflow '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// Result of one workflow execution.
#[derive(Debug)]
pub struct WorkflowRunResult {
    pub status: WorkflowStatus,
    pub context: WorkflowContext,
}

impl WorkflowRunResult {
    /// Summary value stored as the run result.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status.as_str(),
            "state": self.context.state,
            "completed_steps": self.context.completed_steps(),
            "failed_steps": self.context.failed_steps(),
            "skipped_steps": self.context.skipped_steps(),
        })
    }
}

/// Executes workflow definitions and registers them as dispatchable
/// handlers.
pub struct WorkflowRunner {
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<dyn Ledger>,
    bus: Arc<dyn EventBus>,
    catalog: DashMap<String, Arc<WorkflowDef>>,
}

impl WorkflowRunner {
    pub fn new(dispatcher: Arc<Dispatcher>, bus: Arc<dyn EventBus>) -> Arc<Self> {
        let ledger = Arc::clone(dispatcher.ledger());
        Arc::new(Self {
            dispatcher,
            ledger,
            bus,
            catalog: DashMap::new(),
        })
    }

    /// Validate a definition, add it to the catalog, and register it as a
    /// workflow handler so `Dispatcher::submit` can start it by name.
    pub fn register(self: &Arc<Self>, def: WorkflowDef) -> Result<(), WorkflowRegistrationError> {
        def.validate()?;
        let name = def.name.clone();
        let def = Arc::new(def);

        if self.catalog.contains_key(&name) {
            return Err(WorkflowRegistrationError::AlreadyRegistered(name));
        }
        self.catalog.insert(name.clone(), Arc::clone(&def));

        let handler = Arc::new(WorkflowHandler {
            runner: Arc::clone(self),
            def,
        });
        if self
            .dispatcher
            .registry()
            .register(WorkKind::Workflow, &name, handler)
            .is_err()
        {
            self.catalog.remove(&name);
            return Err(WorkflowRegistrationError::AlreadyRegistered(name));
        }

        info!(workflow = %name, "registered workflow");
        Ok(())
    }

    pub fn get_definition(&self, name: &str) -> Option<Arc<WorkflowDef>> {
        self.catalog.get(name).map(|d| Arc::clone(&d))
    }

    /// Registered workflow names, sorted.
    pub fn list_definitions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.catalog.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Evaluate a workflow without dispatching operation steps: every
    /// operation and map iteration synthesises a completed result. No events
    /// are recorded.
    pub async fn dry_run(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> Result<WorkflowRunResult, CoreError> {
        let def = self
            .get_definition(name)
            .ok_or_else(|| CoreError::validation(format!("no registered workflow '{name}'")))?;
        Ok(self
            .execute(
                &def,
                Uuid::now_v7(),
                params,
                CancellationToken::new(),
                true,
            )
            .await)
    }

    /// Execute a definition against a fresh context.
    #[instrument(skip(self, def, params, cancellation), fields(workflow = %def.name))]
    pub async fn execute(
        &self,
        def: &WorkflowDef,
        run_id: Uuid,
        params: serde_json::Value,
        cancellation: CancellationToken,
        dry_run: bool,
    ) -> WorkflowRunResult {
        let mut ctx = WorkflowContext::new(run_id, params);

        self.emit_workflow_event(
            run_id,
            event_type::WORKFLOW_STARTED,
            serde_json::json!({"workflow": def.name, "steps": def.steps.len()}),
            dry_run,
        )
        .await;

        let mut cursor = 0usize;
        let mut stopped: Option<CoreError> = None;
        let mut cancelled = false;

        while cursor < def.steps.len() {
            let step = &def.steps[cursor];

            // Already settled (e.g. a branch target pre-skipped by a choice).
            if ctx.step_results.contains_key(&step.name) {
                cursor += 1;
                continue;
            }

            if cancellation.is_cancelled() {
                self.skip_remaining(def, cursor, &mut ctx, CANCELLED, dry_run).await;
                cancelled = true;
                break;
            }

            // Choice steps are handled inline: they move the cursor.
            if let StepKind::Choice {
                condition,
                then_step,
                else_step,
            } = &step.kind
            {
                let taken = if condition(&ctx) {
                    then_step.clone()
                } else {
                    else_step.clone()
                };
                let other = if taken == *then_step {
                    else_step.clone()
                } else {
                    then_step.clone()
                };

                match self
                    .resolve_branch(def, cursor, &step.name, &taken, &other, &mut ctx, dry_run)
                    .await
                {
                    Ok(target_index) => {
                        cursor = target_index;
                        continue;
                    }
                    Err(error) => {
                        let result = StepResult::fail(error.clone());
                        self.record_step(run_id, &step.name, &result, &mut ctx, dry_run)
                            .await;
                        stopped = Some(error);
                        break;
                    }
                }
            }

            self.emit_step_event(
                run_id,
                &step.name,
                event_type::STEP_STARTED,
                serde_json::json!({"kind": step.kind.kind_name()}),
                dry_run,
            )
            .await;

            let result = self
                .run_step_with_retry(def, step, &ctx, &cancellation, dry_run)
                .await;

            if cancellation.is_cancelled() && result.status == relay_core::StepStatus::Skipped {
                self.record_step(run_id, &step.name, &result, &mut ctx, dry_run).await;
                self.skip_remaining(def, cursor + 1, &mut ctx, CANCELLED, dry_run).await;
                cancelled = true;
                break;
            }

            let next_step = result.next_step.clone();
            let failed = result.is_fail();
            let error = result.error.clone();
            self.record_step(run_id, &step.name, &result, &mut ctx, dry_run).await;

            if failed {
                let policy = effective_policy(def, step);
                match policy {
                    ErrorPolicy::Continue => {
                        cursor += 1;
                        continue;
                    }
                    // Stop, or Retry that exhausted on a strict step.
                    _ => {
                        stopped =
                            Some(error.unwrap_or_else(|| CoreError::internal("step failed")));
                        break;
                    }
                }
            }

            // Dynamic routing from lambda results.
            if let Some(target) = next_step {
                match self
                    .jump_to(def, cursor, &target, &mut ctx, dry_run)
                    .await
                {
                    Ok(target_index) => {
                        cursor = target_index;
                        continue;
                    }
                    Err(error) => {
                        stopped = Some(error);
                        break;
                    }
                }
            }

            cursor += 1;
        }

        let status = if cancelled {
            WorkflowStatus::Cancelled
        } else if stopped.is_some() {
            WorkflowStatus::Failed
        } else {
            let failed = ctx.failed_steps().len();
            let completed = ctx.completed_steps().len();
            if failed == 0 {
                WorkflowStatus::Completed
            } else if completed > 0 {
                WorkflowStatus::Partial
            } else {
                WorkflowStatus::Failed
            }
        };

        let (terminal_event, payload) = match status {
            WorkflowStatus::Completed => (
                Some(event_type::WORKFLOW_COMPLETED),
                serde_json::json!({"workflow": def.name}),
            ),
            WorkflowStatus::Partial => (
                Some(event_type::WORKFLOW_PARTIAL),
                serde_json::json!({"workflow": def.name, "failed_steps": ctx.failed_steps()}),
            ),
            WorkflowStatus::Failed => (
                Some(event_type::WORKFLOW_FAILED),
                serde_json::json!({
                    "workflow": def.name,
                    "error": stopped.as_ref().map(|e| e.message.clone()),
                }),
            ),
            _ => (None, serde_json::Value::Null),
        };
        if let Some(event) = terminal_event {
            self.emit_workflow_event(run_id, event, payload, dry_run).await;
        }

        debug!(workflow = %def.name, status = %status, "workflow finished");
        WorkflowRunResult {
            status,
            context: ctx,
        }
    }

    /// Resolve a choice: skip the untaken branch target and the steps
    /// between the choice and the taken target, record the choice result,
    /// and return the taken target's index.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_branch(
        &self,
        def: &WorkflowDef,
        cursor: usize,
        step_name: &str,
        taken: &str,
        other: &str,
        ctx: &mut WorkflowContext,
        dry_run: bool,
    ) -> Result<usize, CoreError> {
        let target_index = match def.step_index(taken) {
            Some(index) if index > cursor => index,
            _ => {
                return Err(CoreError::validation(format!(
                    "invalid_branch_target: '{taken}' is not ahead of choice '{step_name}'"
                )));
            }
        };

        // The untaken branch is settled now so it is skipped when the cursor
        // passes over it.
        if let Some(other_index) = def.step_index(other) {
            if other_index > cursor && !ctx.step_results.contains_key(other) {
                let skipped = StepResult::skipped(BRANCH_NOT_TAKEN);
                self.record_step(ctx.run_id, other, &skipped, ctx, dry_run).await;
            }
        }

        for intermediate in &def.steps[cursor + 1..target_index] {
            if !ctx.step_results.contains_key(&intermediate.name) {
                let skipped = StepResult::skipped(BRANCH_NOT_TAKEN);
                self.record_step(ctx.run_id, &intermediate.name, &skipped, ctx, dry_run)
                    .await;
            }
        }

        let result = StepResult::ok(serde_json::json!({"branch": taken}));
        self.record_step(ctx.run_id, step_name, &result, ctx, dry_run).await;
        Ok(target_index)
    }

    /// Forward jump for dynamic `next_step` routing.
    async fn jump_to(
        &self,
        def: &WorkflowDef,
        cursor: usize,
        target: &str,
        ctx: &mut WorkflowContext,
        dry_run: bool,
    ) -> Result<usize, CoreError> {
        let target_index = match def.step_index(target) {
            Some(index) if index > cursor => index,
            _ => {
                return Err(CoreError::validation(format!(
                    "invalid_branch_target: '{target}' is not ahead of the current step"
                )));
            }
        };

        for intermediate in &def.steps[cursor + 1..target_index] {
            if !ctx.step_results.contains_key(&intermediate.name) {
                let skipped = StepResult::skipped(BRANCH_NOT_TAKEN);
                self.record_step(ctx.run_id, &intermediate.name, &skipped, ctx, dry_run)
                    .await;
            }
        }
        Ok(target_index)
    }

    /// Run one step, applying its retry policy when the error policy is
    /// RETRY.
    async fn run_step_with_retry(
        &self,
        def: &WorkflowDef,
        step: &StepDef,
        ctx: &WorkflowContext,
        cancellation: &CancellationToken,
        dry_run: bool,
    ) -> StepResult {
        let policy_kind = step.on_error.unwrap_or(def.error_policy);
        if policy_kind != ErrorPolicy::Retry {
            return self.run_step(step, ctx, cancellation, dry_run).await;
        }

        let policy = step.retry_policy.clone().unwrap_or_else(RetryPolicy::exponential);
        let mut attempt = 1;
        loop {
            let result = self.run_step(step, ctx, cancellation, dry_run).await;
            if !result.is_fail() {
                return result;
            }

            let category = result
                .error
                .as_ref()
                .map(|e| e.category)
                .unwrap_or(relay_core::ErrorCategory::Internal);
            if !policy.should_retry(category) || !policy.has_attempts_remaining(attempt) {
                return result;
            }

            attempt += 1;
            let delay = policy.delay_for_attempt(attempt);
            debug!(step = %step.name, attempt, ?delay, "retrying step");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => return StepResult::skipped(CANCELLED),
            }
        }
    }

    /// Evaluate one step by variant.
    async fn run_step(
        &self,
        step: &StepDef,
        ctx: &WorkflowContext,
        cancellation: &CancellationToken,
        dry_run: bool,
    ) -> StepResult {
        match &step.kind {
            StepKind::Operation {
                operation_name,
                config,
            } => {
                if dry_run {
                    return StepResult::ok(serde_json::json!({"dry_run": true}));
                }
                let params = merge_params(&ctx.params, config);
                match self
                    .dispatcher
                    .submit_operation_sync(operation_name, params, ctx.run_id, None)
                    .await
                {
                    Ok(record) => step_result_from_run(&record),
                    Err(DispatchError::Validation(error)) => StepResult::fail(error),
                    Err(e) => StepResult::fail(
                        CoreError::internal(format!("operation dispatch failed: {e}"))
                            .with_context("operation", operation_name.clone()),
                    ),
                }
            }

            StepKind::Lambda { handler } => {
                let input = StepInput {
                    params: ctx.params.clone(),
                    state: serde_json::json!(ctx.state),
                    config: serde_json::Value::Null,
                    item: None,
                };
                match handler(input).await {
                    Ok(result) => result,
                    Err(error) => StepResult::fail(error),
                }
            }

            StepKind::Choice { .. } => {
                // Handled inline by the main loop.
                StepResult::fail(CoreError::internal("choice step reached run_step"))
            }

            StepKind::Wait { wait } => {
                let duration = match wait {
                    Wait::For(duration) => *duration,
                    Wait::Until(instant) => (*instant - chrono::Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                };
                if dry_run {
                    return StepResult::ok(serde_json::json!({"waited_ms": 0}));
                }
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        StepResult::ok(serde_json::json!({"waited_ms": duration.as_millis() as u64}))
                    }
                    _ = cancellation.cancelled() => StepResult::skipped(CANCELLED),
                }
            }

            StepKind::Map {
                items_key,
                iterator,
                max_parallel,
            } => {
                self.run_map_step(ctx, items_key, iterator, *max_parallel, cancellation, dry_run)
                    .await
            }
        }
    }

    /// Fan out the iterator over the items, fan in ordered outputs.
    async fn run_map_step(
        &self,
        ctx: &WorkflowContext,
        items_key: &str,
        iterator: &StepDef,
        max_parallel: usize,
        cancellation: &CancellationToken,
        dry_run: bool,
    ) -> StepResult {
        let Some(items_value) = ctx.state.get(items_key) else {
            return StepResult::fail(
                CoreError::validation(format!("map items key '{items_key}' not found in state")),
            );
        };
        let Some(items) = items_value.as_array() else {
            return StepResult::fail(
                CoreError::validation(format!("map items at '{items_key}' must be a sequence")),
            );
        };
        if items.is_empty() {
            return StepResult::ok(serde_json::json!([]));
        }

        let fan_out = futures::stream::iter(items.iter().cloned().map(|item| {
            let iterator = iterator.clone();
            let params = ctx.params.clone();
            let run_id = ctx.run_id;
            async move {
                self.run_map_iteration(&iterator, params, run_id, item, dry_run)
                    .await
            }
        }))
        .buffered(max_parallel.max(1))
        .collect::<Vec<Result<serde_json::Value, CoreError>>>();

        let outputs = tokio::select! {
            outputs = fan_out => outputs,
            _ = cancellation.cancelled() => return StepResult::skipped(CANCELLED),
        };

        let mut collected = Vec::with_capacity(outputs.len());
        for output in outputs {
            match output {
                Ok(value) => collected.push(value),
                Err(error) => return StepResult::fail(error),
            }
        }
        StepResult::ok(serde_json::Value::Array(collected))
    }

    /// One map iteration: the iterator step applied to a single item.
    async fn run_map_iteration(
        &self,
        iterator: &StepDef,
        params: serde_json::Value,
        run_id: Uuid,
        item: serde_json::Value,
        dry_run: bool,
    ) -> Result<serde_json::Value, CoreError> {
        match &iterator.kind {
            StepKind::Operation {
                operation_name,
                config,
            } => {
                if dry_run {
                    return Ok(serde_json::json!({"dry_run": true}));
                }
                let mut merged = merge_params(&params, config);
                if let Some(object) = merged.as_object_mut() {
                    object.insert("item".to_string(), item);
                }
                let record = self
                    .dispatcher
                    .submit_operation_sync(operation_name, merged, run_id, None)
                    .await
                    .map_err(|e| match e {
                        DispatchError::Validation(error) => error,
                        other => CoreError::internal(format!("map dispatch failed: {other}")),
                    })?;
                match step_result_from_run(&record) {
                    result if result.is_ok() => {
                        Ok(result.output.unwrap_or(serde_json::Value::Null))
                    }
                    result => Err(result
                        .error
                        .unwrap_or_else(|| CoreError::internal("map iteration failed"))),
                }
            }

            StepKind::Lambda { handler } => {
                let input = StepInput {
                    params,
                    state: serde_json::Value::Null,
                    config: serde_json::Value::Null,
                    item: Some(item),
                };
                let result = handler(input).await?;
                if result.is_ok() {
                    Ok(result.output.unwrap_or(serde_json::Value::Null))
                } else {
                    Err(result
                        .error
                        .unwrap_or_else(|| CoreError::internal("map iteration failed")))
                }
            }

            _ => Err(CoreError::validation(format!(
                "map iterator must be an operation or lambda step, got {}",
                iterator.kind.kind_name()
            ))),
        }
    }

    /// Mark all unsettled steps from `from` onward as skipped.
    async fn skip_remaining(
        &self,
        def: &WorkflowDef,
        from: usize,
        ctx: &mut WorkflowContext,
        reason: &str,
        dry_run: bool,
    ) {
        for step in &def.steps[from..] {
            if !ctx.step_results.contains_key(&step.name) {
                let skipped = StepResult::skipped(reason);
                self.record_step(ctx.run_id, &step.name, &skipped, ctx, dry_run).await;
            }
        }
    }

    /// Merge a result into the context and emit the matching step event.
    async fn record_step(
        &self,
        run_id: Uuid,
        step_name: &str,
        result: &StepResult,
        ctx: &mut WorkflowContext,
        dry_run: bool,
    ) {
        ctx.record_step(step_name, result.clone());

        let (event, payload) = match result.status {
            relay_core::StepStatus::Ok => (
                event_type::STEP_COMPLETED,
                serde_json::json!({"output": result.output}),
            ),
            relay_core::StepStatus::Fail => (
                event_type::STEP_FAILED,
                serde_json::json!({
                    "error": result.error.as_ref().map(|e| e.message.clone()),
                    "category": result.error.as_ref().map(|e| e.category.as_str()),
                }),
            ),
            relay_core::StepStatus::Skipped => (
                event_type::STEP_SKIPPED,
                serde_json::json!({"reason": result.skip_reason}),
            ),
        };
        self.emit_step_event(run_id, step_name, event, payload, dry_run).await;
    }

    async fn emit_step_event(
        &self,
        run_id: Uuid,
        step_name: &str,
        event: &str,
        payload: serde_json::Value,
        dry_run: bool,
    ) {
        if dry_run {
            return;
        }
        if let Err(e) = self
            .ledger
            .record_event(
                NewEvent::new(run_id, event, payload.clone()).with_step_id(step_name),
            )
            .await
        {
            warn!(%e, step = %step_name, "failed to record step event");
        }
        self.bus.publish(BusEvent::for_run(run_id, event, payload)).await;
    }

    async fn emit_workflow_event(
        &self,
        run_id: Uuid,
        event: &str,
        payload: serde_json::Value,
        dry_run: bool,
    ) {
        if dry_run {
            return;
        }
        if let Err(e) = self
            .ledger
            .record_event(NewEvent::new(run_id, event, payload.clone()))
            .await
        {
            warn!(%e, "failed to record workflow event");
        }
        self.bus.publish(BusEvent::for_run(run_id, event, payload)).await;
    }
}

/// The terminal policy applied when a step fails: RETRY collapses to STOP
/// for strict steps and CONTINUE otherwise once attempts are spent.
fn effective_policy(def: &WorkflowDef, step: &StepDef) -> ErrorPolicy {
    match step.on_error.unwrap_or(def.error_policy) {
        ErrorPolicy::Retry => {
            if step.strict {
                ErrorPolicy::Stop
            } else {
                ErrorPolicy::Continue
            }
        }
        policy => policy,
    }
}

/// Workflow params overlaid with the step config.
fn merge_params(params: &serde_json::Value, config: &serde_json::Value) -> serde_json::Value {
    let mut merged = match params {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let serde_json::Value::Object(config) = config {
        for (key, value) in config {
            merged.insert(key.clone(), value.clone());
        }
    }
    serde_json::Value::Object(merged)
}

/// Convert a terminal run record into a step result.
fn step_result_from_run(record: &RunRecord) -> StepResult {
    match record.status {
        RunStatus::Completed => {
            StepResult::ok(record.result.clone().unwrap_or(serde_json::Value::Null))
        }
        RunStatus::Cancelled => StepResult::skipped(CANCELLED),
        _ => {
            let category = record
                .error_category
                .unwrap_or(relay_core::ErrorCategory::Internal);
            let message = record
                .error
                .clone()
                .unwrap_or_else(|| "operation failed".to_string());
            StepResult::fail(CoreError::new(category, message))
        }
    }
}

/// Handler wrapper that lets workflows be submitted like any other work.
struct WorkflowHandler {
    runner: Arc<WorkflowRunner>,
    def: Arc<WorkflowDef>,
}

#[async_trait]
impl Handler for WorkflowHandler {
    async fn invoke(&self, params: serde_json::Value) -> Result<serde_json::Value, CoreError> {
        self.invoke_with_context(HandlerContext::new(Uuid::now_v7()), params)
            .await
    }

    async fn invoke_with_context(
        &self,
        ctx: HandlerContext,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CoreError> {
        let result = self
            .runner
            .execute(&self.def, ctx.run_id, params, ctx.cancellation, false)
            .await;

        match result.status {
            WorkflowStatus::Completed | WorkflowStatus::Partial => Ok(result.to_value()),
            WorkflowStatus::Cancelled => Err(CoreError::internal("workflow cancelled")),
            _ => {
                let message = result
                    .context
                    .failed_steps()
                    .first()
                    .and_then(|name| result.context.step_results.get(*name))
                    .and_then(|r| r.error.as_ref())
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "workflow failed".to_string());
                Err(CoreError::internal(message)
                    .with_context("workflow", self.def.name.clone())
                    .with_context("failed_steps", serde_json::json!(result.context.failed_steps())))
            }
        }
    }
}
