// aex Core - Action Registry
//
// Actions are registered once at startup. Building the registry validates
// every cross-reference (sub-action targets, tool-choice allow-lists, stop
// actions) and resolves names into ActionIds. The built registry is
// immutable and shared read-only by all runs.

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{
    Action, ActionId, ActionSpec, ModelStep, ModelStepMode, Step, StepSpec, SubActionStep,
    ToolChoice,
};
use crate::error::{AexError, AexResult};

// ============================================================================
// Builder
// ============================================================================

/// Collects action definitions before validation
#[derive(Debug, Default)]
pub struct ActionRegistryBuilder {
    specs: Vec<ActionSpec>,
}

impl ActionRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, action: ActionSpec) -> Self {
        self.specs.push(action);
        self
    }

    pub fn register_all(mut self, actions: impl IntoIterator<Item = ActionSpec>) -> Self {
        self.specs.extend(actions);
        self
    }

    pub fn count(&self) -> usize {
        self.specs.len()
    }

    /// Validate all definitions and resolve references. Every problem found
    /// is reported at once.
    pub fn build(self) -> AexResult<ActionRegistry> {
        let mut issues = Vec::new();
        let mut by_name = HashMap::new();

        for (index, spec) in self.specs.iter().enumerate() {
            if spec.name.trim().is_empty() {
                issues.push(RegistryIssue::new(&spec.name, None, "action name is empty"));
                continue;
            }
            if by_name.insert(spec.name.clone(), ActionId(index)).is_some() {
                issues.push(RegistryIssue::new(
                    &spec.name,
                    None,
                    "action is registered more than once",
                ));
            }
        }

        let mut actions = Vec::with_capacity(self.specs.len());
        for spec in self.specs {
            let mut resolver = Resolver {
                by_name: &by_name,
                action: spec.name.clone(),
                issues: &mut issues,
            };
            let step_count = spec.steps.len();
            let steps = resolver.resolve_steps(spec.steps, 0);
            let post_steps = resolver.resolve_steps(spec.post_steps, step_count);

            actions.push(Arc::new(Action {
                name: spec.name,
                description: spec.description,
                input_schema: spec.input_schema,
                steps,
                post_steps,
            }));
        }

        if !issues.is_empty() {
            return Err(AexError::Registry(
                issues.iter().map(ToString::to_string).collect(),
            ));
        }

        tracing::debug!("Built action registry with {} actions", actions.len());
        Ok(ActionRegistry { actions, by_name })
    }
}

struct Resolver<'a> {
    by_name: &'a HashMap<String, ActionId>,
    action: String,
    issues: &'a mut Vec<RegistryIssue>,
}

impl Resolver<'_> {
    fn lookup(&mut self, name: &str, step: usize, field: &str) -> Option<ActionId> {
        let found = self.by_name.get(name).copied();
        if found.is_none() {
            self.issues.push(RegistryIssue::new(
                &self.action,
                Some(step),
                format!("{} references unknown action '{}'", field, name),
            ));
        }
        found
    }

    fn resolve_steps(&mut self, steps: Vec<StepSpec>, offset: usize) -> Vec<Step> {
        steps
            .into_iter()
            .enumerate()
            .filter_map(|(i, step)| self.resolve_step(step, offset + i))
            .collect()
    }

    fn resolve_step(&mut self, step: StepSpec, index: usize) -> Option<Step> {
        match step {
            Step::Function(function) => Some(Step::Function(function)),
            Step::SubAction(sub) => {
                let action = self.lookup(&sub.action, index, "sub-action")?;
                Some(Step::SubAction(SubActionStep {
                    action,
                    skip_if: sub.skip_if,
                }))
            }
            Step::Model(model) => {
                let mode = match model.mode {
                    ModelStepMode::Structured(schema) => ModelStepMode::Structured(schema),
                    ModelStepMode::ToolChoice(choice) => {
                        ModelStepMode::ToolChoice(self.resolve_tool_choice(choice, index)?)
                    }
                };
                Some(Step::Model(ModelStep {
                    name: model.name,
                    tier: model.tier,
                    system_prompt: model.system_prompt,
                    user_prompt: model.user_prompt,
                    mode,
                    output_key: model.output_key,
                }))
            }
        }
    }

    fn resolve_tool_choice(
        &mut self,
        choice: ToolChoice<String>,
        index: usize,
    ) -> Option<ToolChoice<ActionId>> {
        let mut valid = true;

        if choice.max_iterations == 0 {
            self.issues.push(RegistryIssue::new(
                &self.action,
                Some(index),
                "tool choice max_iterations must be greater than zero",
            ));
            valid = false;
        }
        if !choice.available_actions.contains(&choice.stop_action) {
            self.issues.push(RegistryIssue::new(
                &self.action,
                Some(index),
                format!(
                    "stop action '{}' is not one of the available actions",
                    choice.stop_action
                ),
            ));
            valid = false;
        }

        let mut available = Vec::with_capacity(choice.available_actions.len());
        for name in &choice.available_actions {
            match self.lookup(name, index, "tool choice") {
                Some(id) if !available.contains(&id) => available.push(id),
                Some(_) => {}
                None => valid = false,
            }
        }
        let stop = self.by_name.get(&choice.stop_action).copied();

        match (valid, stop) {
            (true, Some(stop_action)) => Some(ToolChoice {
                available_actions: available,
                stop_action,
                max_iterations: choice.max_iterations,
            }),
            _ => None,
        }
    }
}

// ============================================================================
// Built registry
// ============================================================================

/// Immutable, validated set of actions
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    actions: Vec<Arc<Action>>,
    by_name: HashMap<String, ActionId>,
}

impl ActionRegistry {
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::new()
    }

    /// Resolved ids only come from this registry, so indexing cannot miss
    pub fn get(&self, id: ActionId) -> &Arc<Action> {
        &self.actions[id.0]
    }

    pub fn lookup(&self, name: &str) -> Option<ActionId> {
        self.by_name.get(name).copied()
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Arc<Action>> {
        self.lookup(name).map(|id| self.get(id))
    }

    pub fn name_of(&self, id: ActionId) -> &str {
        &self.get(id).name
    }

    pub fn names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn count(&self) -> usize {
        self.actions.len()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

/// Problem found while validating definitions
#[derive(Debug, Clone)]
pub struct RegistryIssue {
    pub action: String,
    pub step: Option<usize>,
    pub message: String,
}

impl RegistryIssue {
    fn new(action: &str, step: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            step,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RegistryIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.step {
            Some(step) => write!(f, "action '{}' step {}: {}", self.action, step, self.message),
            None => write!(f, "action '{}': {}", self.action, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tier;
    use crate::schema::OutputSchema;
    use serde_json::{json, Value};

    fn noop(name: &str) -> ActionSpec {
        Action::new(name).step(Step::function("noop", |_ctx| async { Ok(Value::Null) }))
    }

    fn registry_issues(result: AexResult<ActionRegistry>) -> Vec<String> {
        match result {
            Err(AexError::Registry(issues)) => issues,
            other => panic!("expected registry error, got {:?}", other.map(|r| r.count())),
        }
    }

    #[test]
    fn test_build_resolves_references() {
        let registry = ActionRegistry::builder()
            .register(noop("a"))
            .register(noop("stop"))
            .register(
                Action::new("root")
                    .step(Step::sub_action("a"))
                    .step(Step::tool_choice("pick", Tier::Low, "sys", "user", ["a", "stop"], "stop", 3)),
            )
            .build()
            .unwrap();

        assert_eq!(registry.count(), 3);
        assert!(registry.exists("root"));

        let root = registry.get_by_name("root").unwrap();
        let Step::SubAction(sub) = &root.steps[0] else {
            panic!("expected sub-action");
        };
        assert_eq!(registry.name_of(sub.action), "a");

        let Step::Model(model) = &root.steps[1] else {
            panic!("expected model step");
        };
        let ModelStepMode::ToolChoice(choice) = &model.mode else {
            panic!("expected tool choice");
        };
        assert_eq!(registry.name_of(choice.stop_action), "stop");
        assert_eq!(choice.available_actions.len(), 2);
    }

    #[test]
    fn test_stop_action_must_be_available() {
        let issues = registry_issues(
            ActionRegistry::builder()
                .register(noop("a"))
                .register(noop("stop"))
                .register(Action::new("root").step(Step::tool_choice(
                    "pick",
                    Tier::Low,
                    "sys",
                    "user",
                    ["a"],
                    "stop",
                    2,
                )))
                .build(),
        );

        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("stop action 'stop' is not one of the available actions"));
    }

    #[test]
    fn test_all_problems_reported_together() {
        let issues = registry_issues(
            ActionRegistry::builder()
                .register(noop("dup"))
                .register(noop("dup"))
                .register(
                    Action::new("root")
                        .step(Step::sub_action("ghost"))
                        .step(Step::tool_choice("pick", Tier::High, "s", "u", ["phantom"], "phantom", 0))
                        .post_step(Step::sub_action("missing")),
                )
                .build(),
        );

        assert!(issues.iter().any(|i| i.contains("registered more than once")));
        assert!(issues.iter().any(|i| i.contains("step 0: sub-action references unknown action 'ghost'")));
        assert!(issues.iter().any(|i| i.contains("max_iterations must be greater than zero")));
        assert!(issues.iter().any(|i| i.contains("unknown action 'phantom'")));
        assert!(issues.iter().any(|i| i.contains("step 2: sub-action references unknown action 'missing'")));
    }

    #[test]
    fn test_structured_steps_need_no_references() {
        let registry = ActionRegistry::builder()
            .register(Action::new("summarize").step(Step::structured(
                "summary",
                Tier::Medium,
                "You summarize.",
                "{{ text }}",
                OutputSchema::from_json_schema(json!({"type": "object"})),
            )))
            .build()
            .unwrap();

        assert_eq!(registry.names(), vec!["summarize"]);
        assert!(registry.lookup("other").is_none());
    }
}
