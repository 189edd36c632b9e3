//! Multi-turn tool-choice loop
//!
//! Each turn the model must pick exactly one action from the allow-list.
//! Selections that cannot run (free text, unknown names, malformed or invalid
//! arguments, failing actions) are fed back into the transcript and cost a
//! turn. Choosing the stop action ends the loop with that action's result; an
//! exhausted budget force-invokes it.

use aex_core::{
    ActionId, AexError, AexResult, Message, ModelRequest, ModelResponse, ModelStep, PruningPolicy,
    RequestedOutput, RunContext, ToolCall, ToolChoice, ToolDefinition, TraceKind, Transcript,
};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::step_executor::{InputCheck, RunScope, StepExecutor, StepOutcome};
use crate::events::RunEvent;
use crate::tracer::TraceSpan;

/// Empty arguments mean no arguments; anything else must be a JSON object
fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("arguments must be a JSON object, got {}", other)),
        Err(e) => Err(format!("arguments are not valid JSON: {}", e)),
    }
}

fn tool_error(call: &ToolCall, message: &str) -> Vec<Message> {
    vec![
        Message::assistant_tool_call(call.clone()),
        Message::tool_result(&call.id, json!({ "error": message }).to_string()),
    ]
}

impl StepExecutor {
    pub(crate) async fn run_tool_loop(
        &self,
        scope: RunScope<'_>,
        step: &ModelStep<ActionId>,
        choice: &ToolChoice<ActionId>,
        ctx: &mut RunContext,
        span: &TraceSpan,
    ) -> AexResult<StepOutcome> {
        let tools = self.tool_definitions(choice);
        let tool_names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let stop_name = self.registry.name_of(choice.stop_action).to_string();
        let policy = self.config.pruning_policy();

        let base = ctx.conversation().to_vec();
        let mut transcript = Transcript::new();

        for turn in 1..=choice.max_iterations {
            let ambient = self.ambient(scope).await?;
            let (system, user) = self.render_prompts(step, ctx, &ambient)?;

            let mut messages = Vec::with_capacity(base.len() + transcript.message_count() + 2);
            messages.push(Message::system(system));
            messages.extend(base.iter().cloned());
            messages.push(Message::user(user));
            messages.extend(transcript.messages());

            let request = ModelRequest {
                messages,
                output: RequestedOutput::ToolChoice {
                    tools: tools.clone(),
                    require_tool_call: true,
                },
            };
            let generation = self.generate(step.tier, &request, span).await?;

            let call = match generation.response {
                ModelResponse::ToolSelection { call } => call,
                ModelResponse::Text { content } => {
                    self.push_corrective(step, turn, content, &tool_names, &mut transcript, span);
                    self.prune(&mut transcript, policy, span);
                    continue;
                }
                ModelResponse::Structured { value } => {
                    self.push_corrective(step, turn, value.to_string(), &tool_names, &mut transcript, span);
                    self.prune(&mut transcript, policy, span);
                    continue;
                }
            };

            let Some(chosen) = choice
                .available_actions
                .iter()
                .copied()
                .find(|id| self.registry.name_of(*id) == call.name)
            else {
                debug!("Model chose unknown tool '{}'", call.name);
                transcript.push_turn(tool_error(
                    &call,
                    &format!(
                        "unknown tool '{}'; available: {}",
                        call.name,
                        tool_names.join(", ")
                    ),
                ));
                self.prune(&mut transcript, policy, span);
                continue;
            };

            scope
                .emit(RunEvent::ToolSelected {
                    trace_id: scope.trace_id.to_string(),
                    action: step.name.clone(),
                    tool: call.name.clone(),
                    turn,
                })
                .await;

            let args = match parse_arguments(&call.arguments) {
                Ok(args) => args,
                Err(message) => {
                    debug!("Tool '{}' called with bad arguments: {}", call.name, message);
                    transcript.push_turn(tool_error(&call, &message));
                    self.prune(&mut transcript, policy, span);
                    continue;
                }
            };

            if chosen == choice.stop_action {
                info!("Model step '{}' chose stop action '{}' on turn {}", step.name, stop_name, turn);
                let mut conversation = base.clone();
                conversation.extend(transcript.messages());
                conversation.push(Message::assistant_tool_call(call.clone()));
                conversation.push(Message::tool_result(
                    &call.id,
                    json!({ "status": "finishing" }).to_string(),
                ));
                return self.invoke_stop(scope, chosen, args, conversation, ctx, span).await;
            }

            let target = self.registry.get(chosen);
            let params = self.tool_params(ctx, chosen, args);
            let report = target.input_schema.validate(params.values());
            if !report.valid {
                let message = AexError::Validation {
                    action: target.name.clone(),
                    violations: report.errors,
                }
                .to_string();
                transcript.push_turn(tool_error(&call, &message));
                self.prune(&mut transcript, policy, span);
                continue;
            }

            let child_span = span.child(
                TraceKind::Action,
                &target.name,
                Value::Object(params.values().clone()),
            );
            match self
                .run_action(scope.nested(), chosen, params, child_span, InputCheck::Lenient)
                .await
            {
                Ok(result) => {
                    let output = Value::Object(result.into_values());
                    transcript.push_turn(vec![
                        Message::assistant_tool_call(call.clone()),
                        Message::tool_result(&call.id, output.to_string()),
                    ]);
                    if let Value::Object(values) = output {
                        ctx.merge(values);
                    }
                }
                Err(e) if matches!(e.root_cause(), AexError::DepthExceeded { .. }) => return Err(e),
                Err(e) => {
                    warn!("Tool '{}' failed: {}", call.name, e);
                    transcript.push_turn(tool_error(&call, &e.to_string()));
                }
            }
            self.prune(&mut transcript, policy, span);
        }

        warn!(
            "Model step '{}' used all {} turns; forcing '{}'",
            step.name, choice.max_iterations, stop_name
        );
        span.warning(
            "iteration_budget_exhausted",
            json!({ "max_iterations": choice.max_iterations, "stop_action": stop_name }),
        );
        let mut conversation = base;
        conversation.extend(transcript.messages());
        conversation.push(Message::user(format!(
            "The turn budget of {} is exhausted; finishing with '{}'.",
            choice.max_iterations, stop_name
        )));
        self.invoke_stop(scope, choice.stop_action, Map::new(), conversation, ctx, span)
            .await
    }

    /// Run the stop action with the accumulated conversation; its failure
    /// fails the step
    async fn invoke_stop(
        &self,
        scope: RunScope<'_>,
        stop: ActionId,
        args: Map<String, Value>,
        conversation: Vec<Message>,
        ctx: &mut RunContext,
        span: &TraceSpan,
    ) -> AexResult<StepOutcome> {
        let mut params = self.tool_params(ctx, stop, args);
        params.replace_conversation(conversation);

        let name = self.registry.name_of(stop);
        let child_span = span.child(TraceKind::Action, name, Value::Object(params.values().clone()));
        let result = self
            .run_action(scope.nested(), stop, params, child_span, InputCheck::Lenient)
            .await?;

        let output = Value::Object(result.values().clone());
        ctx.replace_conversation(result.conversation().to_vec());
        ctx.merge(result.into_values());
        Ok(StepOutcome::Completed(output))
    }

    /// Projection of the context onto the chosen action, overridden by the
    /// model's arguments
    fn tool_params(&self, ctx: &RunContext, id: ActionId, args: Map<String, Value>) -> RunContext {
        let mut params = ctx.project(&self.registry.get(id).input_schema);
        params.merge(args);
        params
    }

    fn tool_definitions(&self, choice: &ToolChoice<ActionId>) -> Vec<ToolDefinition> {
        choice
            .available_actions
            .iter()
            .map(|id| {
                let action = self.registry.get(*id);
                ToolDefinition {
                    name: action.name.clone(),
                    description: action.description.clone(),
                    parameters: action.input_schema.to_json_schema(),
                }
            })
            .collect()
    }

    /// Free text instead of a tool call: keep it and ask again
    fn push_corrective(
        &self,
        step: &ModelStep<ActionId>,
        turn: usize,
        content: String,
        tool_names: &[&str],
        transcript: &mut Transcript,
        span: &TraceSpan,
    ) {
        warn!("Model step '{}' turn {} answered without a tool call", step.name, turn);
        span.warning("free_text_response", json!({ "turn": turn, "content": content }));
        transcript.push_turn(vec![
            Message::assistant(content),
            Message::user(format!(
                "Respond by calling exactly one of the available tools: {}.",
                tool_names.join(", ")
            )),
        ]);
    }

    fn prune(&self, transcript: &mut Transcript, policy: PruningPolicy, span: &TraceSpan) {
        let collapsed = transcript.prune(policy);
        if collapsed > 0 {
            debug!("Collapsed {} transcript turns", collapsed);
            span.warning(
                "conversation_pruned",
                json!({ "collapsed_turns": transcript.collapsed_turns() }),
            );
        }
    }
}
