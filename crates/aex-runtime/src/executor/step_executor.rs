//! Step executor - runs an action's steps in order against a run context
//!
//! Each step result is merged into the context before the next step starts.
//! A failing step aborts the remaining steps of its action and is wrapped with
//! its index; nothing is retried here.

use std::sync::Arc;
use std::time::Instant;

use aex_core::{
    Action, ActionId, ActionRegistry, AexError, AexResult, AmbientContext, AmbientProvider,
    AmbientRefresh, EngineConfig, FunctionStep, Message, ModelRequest, ModelResponse, ModelStep,
    ModelStepMode, OutputSchema, RequestedOutput, RunContext, Step, SubActionStep,
    TemplateResolver, Tier, TraceKind,
};
use aex_llm::{CascadeAttempt, CascadePass, Generation, ModelCascade};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, warn};

use crate::events::RunEvent;
use crate::tracer::{RunTrace, TraceSpan};

/// State shared by every invocation inside one top-level run
#[derive(Clone, Copy)]
pub(crate) struct RunScope<'a> {
    pub trace_id: &'a str,
    pub depth: usize,
    /// Ambient context cached for the run when refresh is per-run
    pub ambient: &'a OnceCell<AmbientContext>,
    pub events: Option<&'a mpsc::Sender<RunEvent>>,
}

impl<'a> RunScope<'a> {
    pub fn nested(self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self
        }
    }

    pub async fn emit(&self, event: RunEvent) {
        if let Some(tx) = self.events {
            if tx.send(event).await.is_err() {
                warn!("Failed to send run event");
            }
        }
    }
}

/// How an action treats input that does not match its schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputCheck {
    /// Fail the action
    Strict,
    /// Log the violations and run anyway
    Lenient,
}

pub(crate) enum StepOutcome {
    Completed(Value),
    Skipped,
}

pub(crate) struct StepExecutor {
    pub registry: Arc<ActionRegistry>,
    pub cascade: Arc<ModelCascade>,
    pub templates: TemplateResolver,
    pub ambient: Arc<dyn AmbientProvider>,
    pub config: EngineConfig,
}

impl StepExecutor {
    /// Run an action to completion. `span` is the action's own trace node and
    /// is closed before this returns.
    pub fn run_action<'a>(
        &'a self,
        scope: RunScope<'a>,
        id: ActionId,
        context: RunContext,
        span: TraceSpan,
        check: InputCheck,
    ) -> BoxFuture<'a, AexResult<RunContext>> {
        async move {
            let action = Arc::clone(self.registry.get(id));

            if scope.depth > self.config.max_depth {
                let err = AexError::DepthExceeded {
                    max: self.config.max_depth,
                };
                span.fail(&err);
                return Err(err);
            }

            let report = action.input_schema.validate(context.values());
            if !report.valid {
                let violations = json!(report.errors);
                let err = AexError::Validation {
                    action: action.name.clone(),
                    violations: report.errors,
                };
                match check {
                    InputCheck::Strict => {
                        warn!("{}", err);
                        span.fail(&err);
                        return Err(err);
                    }
                    InputCheck::Lenient => {
                        warn!("Continuing despite {}", err);
                        span.warning("invalid_input", violations);
                    }
                }
            }

            debug!("Running action '{}' at depth {}", action.name, scope.depth);
            let mut ctx = context;
            for (index, step) in action.steps.iter().enumerate() {
                if let Err(source) = self.run_step(scope, &action, index, step, &mut ctx, &span).await {
                    let err = AexError::StepFailed {
                        action: action.name.clone(),
                        step_index: index,
                        step: self.step_label(step),
                        source: Box::new(source),
                    };
                    span.fail(&err);
                    return Err(err);
                }
            }

            span.succeed(Value::Object(ctx.values().clone()));
            Ok(ctx)
        }
        .boxed()
    }

    pub(crate) async fn run_step(
        &self,
        scope: RunScope<'_>,
        action: &Action,
        index: usize,
        step: &Step,
        ctx: &mut RunContext,
        parent: &TraceSpan,
    ) -> AexResult<()> {
        let label = self.step_label(step);
        let span = parent.child(TraceKind::Step, &label, Value::Object(ctx.values().clone()));
        let start = Instant::now();

        scope
            .emit(RunEvent::StepStarted {
                trace_id: scope.trace_id.to_string(),
                action: action.name.clone(),
                step_index: index,
                step: label.clone(),
            })
            .await;

        let outcome = match step {
            Step::Function(function) => self.run_function(function, ctx).await,
            Step::Model(model) => self.run_model(scope, model, ctx, &span).await,
            Step::SubAction(sub) => self.run_sub_action(scope, sub, ctx, &span).await,
        };

        match outcome {
            Ok(StepOutcome::Completed(output)) => {
                span.succeed(output);
                scope
                    .emit(RunEvent::StepCompleted {
                        trace_id: scope.trace_id.to_string(),
                        action: action.name.clone(),
                        step_index: index,
                        step: label,
                        duration_ms: start.elapsed().as_millis() as u64,
                    })
                    .await;
                Ok(())
            }
            Ok(StepOutcome::Skipped) => {
                debug!("Skipped step {} ({}) of '{}'", index, label, action.name);
                span.succeed(json!({ "skipped": true }));
                scope
                    .emit(RunEvent::StepSkipped {
                        trace_id: scope.trace_id.to_string(),
                        action: action.name.clone(),
                        step_index: index,
                        step: label,
                    })
                    .await;
                Ok(())
            }
            Err(err) => {
                warn!("Step {} ({}) of '{}' failed: {}", index, label, action.name, err);
                span.fail(&err);
                scope
                    .emit(RunEvent::StepFailed {
                        trace_id: scope.trace_id.to_string(),
                        action: action.name.clone(),
                        step_index: index,
                        step: label,
                        error: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    async fn run_function(&self, step: &FunctionStep, ctx: &mut RunContext) -> AexResult<StepOutcome> {
        let limit = step.timeout.unwrap_or(self.config.timeouts.function_step);
        let value = tokio::time::timeout(limit, step.handler.call(ctx))
            .await
            .map_err(|_| AexError::Timeout {
                what: format!("function step '{}'", step.name),
                after: limit,
            })??;

        ctx.merge_output(value.clone(), step.output_key.as_deref());
        Ok(StepOutcome::Completed(value))
    }

    async fn run_sub_action(
        &self,
        scope: RunScope<'_>,
        step: &SubActionStep<ActionId>,
        ctx: &mut RunContext,
        span: &TraceSpan,
    ) -> AexResult<StepOutcome> {
        if let Some(skip) = &step.skip_if {
            if skip(&*ctx) {
                return Ok(StepOutcome::Skipped);
            }
        }

        let target = self.registry.get(step.action);
        let projected = ctx.project(&target.input_schema);
        let child_span = span.child(
            TraceKind::Action,
            &target.name,
            Value::Object(projected.values().clone()),
        );
        let child = self
            .run_action(scope.nested(), step.action, projected, child_span, InputCheck::Lenient)
            .await?;

        let output = Value::Object(child.values().clone());
        ctx.replace_conversation(child.conversation().to_vec());
        ctx.merge(child.into_values());
        Ok(StepOutcome::Completed(output))
    }

    async fn run_model(
        &self,
        scope: RunScope<'_>,
        step: &ModelStep<ActionId>,
        ctx: &mut RunContext,
        span: &TraceSpan,
    ) -> AexResult<StepOutcome> {
        match &step.mode {
            ModelStepMode::Structured(schema) => self.run_structured(scope, step, schema, ctx, span).await,
            ModelStepMode::ToolChoice(choice) => self.run_tool_loop(scope, step, choice, ctx, span).await,
        }
    }

    async fn run_structured(
        &self,
        scope: RunScope<'_>,
        step: &ModelStep<ActionId>,
        schema: &OutputSchema,
        ctx: &mut RunContext,
        span: &TraceSpan,
    ) -> AexResult<StepOutcome> {
        let ambient = self.ambient(scope).await?;
        let (system, user) = self.render_prompts(step, ctx, &ambient)?;

        let mut messages = vec![Message::system(format!(
            "{}\n\n{}",
            system,
            schema.to_system_instructions()
        ))];
        messages.extend(ctx.conversation().iter().cloned());
        messages.push(Message::user(user.clone()));

        let request = ModelRequest {
            messages,
            output: RequestedOutput::Structured(schema.clone()),
        };
        let generation = self.generate(step.tier, &request, span).await?;

        let value = match generation.response {
            ModelResponse::Structured { value } => value,
            ModelResponse::Text { content } => serde_json::from_str(&content).map_err(|_| {
                AexError::model(format!(
                    "model step '{}' expected structured output but got free text",
                    step.name
                ))
            })?,
            ModelResponse::ToolSelection { call } => {
                return Err(AexError::model(format!(
                    "model step '{}' expected structured output but got a call to '{}'",
                    step.name, call.name
                )))
            }
        };

        ctx.push_message(Message::user(user));
        ctx.push_message(Message::assistant(value.to_string()));
        ctx.merge_output(value.clone(), step.output_key.as_deref());
        Ok(StepOutcome::Completed(value))
    }

    /// Ambient context for the next prompt, fresh or cached per run
    pub(crate) async fn ambient(&self, scope: RunScope<'_>) -> AexResult<AmbientContext> {
        match self.config.ambient.refresh {
            AmbientRefresh::PerStep => self.ambient.fetch().await,
            AmbientRefresh::PerRun => scope
                .ambient
                .get_or_try_init(|| self.ambient.fetch())
                .await
                .cloned(),
        }
    }

    pub(crate) fn render_prompts(
        &self,
        step: &ModelStep<ActionId>,
        ctx: &RunContext,
        ambient: &AmbientContext,
    ) -> AexResult<(String, String)> {
        let system = self.templates.render(&step.system_prompt, ctx, Some(ambient))?;
        let user = self.templates.render(&step.user_prompt, ctx, Some(ambient))?;
        Ok((system, user))
    }

    /// Call the cascade, recording each candidate attempt under `span`
    pub(crate) async fn generate(
        &self,
        tier: Tier,
        request: &ModelRequest,
        span: &TraceSpan,
    ) -> AexResult<Generation> {
        let observer = |attempt: &CascadeAttempt| {
            let pass = match attempt.pass {
                CascadePass::Tier => "tier",
                CascadePass::Recovery => "recovery",
            };
            span.trace().record_child(
                span.id(),
                TraceKind::ModelCall,
                &attempt.candidate.model_id,
                json!({
                    "endpoint": attempt.candidate.endpoint,
                    "routing_provider": attempt.candidate.routing_provider,
                    "tier": tier,
                    "pass": pass,
                }),
                Value::Null,
                attempt.error.as_ref().map(ToString::to_string),
                attempt.started_at,
                attempt.duration_ms,
            );
        };
        self.cascade.generate_observed(tier, request, &observer).await
    }

    /// Post-steps of a finished top-level run; failures are logged only
    pub(crate) async fn run_post_steps(
        &self,
        trace: &Arc<RunTrace>,
        action: &Action,
        mut ctx: RunContext,
        events: Option<&mpsc::Sender<RunEvent>>,
    ) {
        let ambient = OnceCell::new();
        let scope = RunScope {
            trace_id: trace.trace_id(),
            depth: 0,
            ambient: &ambient,
            events,
        };
        let span = trace.open_child(trace.trace_id(), TraceKind::Step, "post_steps", Value::Null);
        let offset = action.steps.len();

        let mut failures = Vec::new();
        for (i, step) in action.post_steps.iter().enumerate() {
            if let Err(e) = self.run_step(scope, action, offset + i, step, &mut ctx, &span).await {
                warn!("Post-step {} of '{}' failed: {}", offset + i, action.name, e);
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            span.succeed(json!({ "completed": action.post_steps.len() }));
        } else {
            span.fail(failures.join("; "));
        }
    }

    pub(crate) fn step_label(&self, step: &Step) -> String {
        match step {
            Step::Function(f) => format!("function:{}", f.name),
            Step::Model(m) => format!("model:{}", m.name),
            Step::SubAction(s) => format!("sub_action:{}", self.registry.name_of(s.action)),
        }
    }
}
