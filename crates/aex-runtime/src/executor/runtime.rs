//! Engine - top-level entry point for running actions
//!
//! The Engine owns the validated registry, the model cascade and the trace
//! store. Every call to [`Engine::run_action`] is an independent run with its
//! own context and trace tree; runs may execute concurrently.

use std::sync::Arc;
use std::time::Instant;

use aex_core::store::CASCADE_STATS_KEY;
use aex_core::{
    Action, ActionRegistry, AexError, AexResult, AmbientProvider, ClockProvider, EngineConfig,
    FieldViolation, KvStore, ModelClient, RunContext, TemplateResolver, TraceNode,
};
use aex_llm::{ModelCascade, StatsStore};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::step_executor::{InputCheck, RunScope, StepExecutor};
use crate::events::RunEvent;
use crate::tracer::{RunTrace, TraceStore};

/// Result of a successful top-level run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Accumulated context of the action after its last step
    pub result: Value,
    pub trace_id: String,
}

/// Terminal failure of a top-level run
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RunFailure {
    pub trace_id: String,
    pub message: String,
    /// Index of the failing top-level step, if a step failed
    pub step_index: Option<usize>,
    pub violations: Vec<FieldViolation>,
    #[source]
    pub error: AexError,
}

impl RunFailure {
    fn new(trace_id: String, error: AexError) -> Self {
        Self {
            trace_id,
            message: error.to_string(),
            step_index: error.step_index(),
            violations: error.violations().to_vec(),
            error,
        }
    }
}

struct EngineInner {
    executor: StepExecutor,
    traces: TraceStore,
    store: Option<Arc<dyn KvStore>>,
    /// Serializes export and write so an older snapshot never lands last
    stats_lock: tokio::sync::Mutex<()>,
}

impl EngineInner {
    async fn persist_stats(&self) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.stats_lock.lock().await;
        let snapshot = match self.executor.cascade.export_stats() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to export cascade statistics: {}", e);
                return;
            }
        };
        if let Err(e) = store.set(CASCADE_STATS_KEY, snapshot).await {
            warn!("Failed to persist cascade statistics: {}", e);
        }
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    registry: Arc<ActionRegistry>,
    client: Arc<dyn ModelClient>,
    config: EngineConfig,
    ambient: Arc<dyn AmbientProvider>,
    store: Option<Arc<dyn KvStore>>,
    stats: Option<Arc<dyn StatsStore>>,
}

impl EngineBuilder {
    pub fn new(registry: impl Into<Arc<ActionRegistry>>, client: Arc<dyn ModelClient>) -> Self {
        Self {
            registry: registry.into(),
            client,
            config: EngineConfig::default(),
            ambient: Arc::new(ClockProvider),
            store: None,
            stats: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ambient_provider(mut self, provider: Arc<dyn AmbientProvider>) -> Self {
        self.ambient = provider;
        self
    }

    /// Persistence for completed traces and candidate statistics
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn stats_store(mut self, stats: Arc<dyn StatsStore>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Validate the configuration and restore persisted statistics
    pub async fn build(self) -> AexResult<Engine> {
        self.config.validate()?;

        let mut cascade = ModelCascade::new(&self.config.cascade, self.client)
            .with_attempt_timeout(self.config.timeouts.model_call);
        if let Some(stats) = self.stats {
            cascade = cascade.with_stats_store(stats);
        }

        if let Some(store) = &self.store {
            match store.get(CASCADE_STATS_KEY).await? {
                Some(snapshot) => match cascade.restore_stats(snapshot) {
                    Ok(()) => debug!("Restored cascade statistics"),
                    Err(e) => warn!("Ignoring unreadable cascade statistics: {}", e),
                },
                None => debug!("No persisted cascade statistics"),
            }
        }

        let traces = TraceStore::new(self.store.clone(), self.config.traces.max_retained);
        let executor = StepExecutor {
            registry: self.registry,
            cascade: Arc::new(cascade),
            templates: TemplateResolver::new(),
            ambient: self.ambient,
            config: self.config,
        };

        info!(
            "Engine ready with {} actions",
            executor.registry.count()
        );

        Ok(Engine {
            inner: Arc::new(EngineInner {
                executor,
                traces,
                store: self.store,
                stats_lock: tokio::sync::Mutex::new(()),
            }),
            events: None,
            tracker: TaskTracker::new(),
        })
    }
}

/// Action execution engine
///
/// Cloning is cheap; clones share the registry, cascade statistics, traces
/// and background tasks.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
    events: Option<mpsc::Sender<RunEvent>>,
    tracker: TaskTracker,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("actions", &self.inner.executor.registry.count())
            .field("traces", &self.inner.traces)
            .field("background_tasks", &self.tracker.len())
            .finish()
    }
}

impl Engine {
    pub fn builder(registry: impl Into<Arc<ActionRegistry>>, client: Arc<dyn ModelClient>) -> EngineBuilder {
        EngineBuilder::new(registry, client)
    }

    /// Stream run events to `tx`
    pub fn with_event_channel(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.inner.executor.registry
    }

    pub fn cascade(&self) -> &Arc<ModelCascade> {
        &self.inner.executor.cascade
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.executor.config
    }

    /// Run an action to completion
    ///
    /// # Arguments
    /// * `name` - Registered action name
    /// * `params` - JSON object matching the action's input shape
    ///
    /// # Returns
    /// The action's accumulated result and the id of its trace. Post-steps
    /// continue in the background after this returns.
    pub async fn run_action(&self, name: &str, params: Value) -> Result<RunOutcome, RunFailure> {
        self.run_action_cancellable(name, params, CancellationToken::new())
            .await
    }

    /// Like [`Engine::run_action`], but stops as soon as `token` is cancelled.
    /// Nodes still open at that point are closed as errors.
    pub async fn run_action_cancellable(
        &self,
        name: &str,
        params: Value,
        token: CancellationToken,
    ) -> Result<RunOutcome, RunFailure> {
        let trace_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        info!("Starting run {} of action '{}'", trace_id, name);

        let (trace, root) = self.inner.traces.begin(&trace_id, name, params.clone());
        let guard = RunGuard {
            engine: self,
            trace: Some(trace),
        };
        let ambient = OnceCell::new();
        let scope = RunScope {
            trace_id: &trace_id,
            depth: 0,
            ambient: &ambient,
            events: self.events.as_ref(),
        };
        scope
            .emit(RunEvent::RunStarted {
                trace_id: trace_id.clone(),
                action: name.to_string(),
            })
            .await;

        let executor = &self.inner.executor;
        let Some(id) = executor.registry.lookup(name) else {
            let err = AexError::UnknownAction(name.to_string());
            root.fail(&err);
            return Err(self.fail_run(scope, name, guard, err).await);
        };
        let action = Arc::clone(executor.registry.get(id));

        let context = match RunContext::from_params(name, params) {
            Ok(context) => context,
            Err(err) => {
                root.fail(&err);
                return Err(self.fail_run(scope, name, guard, err).await);
            }
        };
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(AexError::Cancelled),
            result = executor.run_action(scope, id, context, root, InputCheck::Strict) => result,
        };

        match result {
            Ok(ctx) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!("Run {} of '{}' completed in {}ms", trace_id, name, duration_ms);
                scope
                    .emit(RunEvent::RunCompleted {
                        trace_id: trace_id.clone(),
                        action: name.to_string(),
                        duration_ms,
                    })
                    .await;

                let result = Value::Object(ctx.values().clone());
                guard.finish(Some((action, ctx)));
                Ok(RunOutcome { result, trace_id })
            }
            Err(err) => Err(self.fail_run(scope, name, guard, err).await),
        }
    }

    /// Tree of a running or retained trace
    pub async fn get_trace(&self, trace_id: &str) -> AexResult<Option<TraceNode>> {
        self.inner.traces.get(trace_id).await
    }

    /// Wait for post-steps, trace finalization and statistics persistence of
    /// every run finished so far
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    async fn fail_run(
        &self,
        scope: RunScope<'_>,
        name: &str,
        guard: RunGuard<'_>,
        err: AexError,
    ) -> RunFailure {
        error!("Run {} of '{}' failed: {}", scope.trace_id, name, err);
        scope
            .emit(RunEvent::RunFailed {
                trace_id: scope.trace_id.to_string(),
                action: name.to_string(),
                error: err.to_string(),
                step_index: err.step_index(),
            })
            .await;
        guard.finish(None);
        RunFailure::new(scope.trace_id.to_string(), err)
    }

    /// Post-steps, trace persistence and statistics export, off the caller's
    /// path
    fn finish_run(&self, trace: Arc<RunTrace>, post: Option<(Arc<Action>, RunContext)>) {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        self.tracker.spawn(async move {
            if let Some((action, ctx)) = post {
                if !action.post_steps.is_empty() {
                    inner
                        .executor
                        .run_post_steps(&trace, &action, ctx, events.as_ref())
                        .await;
                }
            }
            if let Err(e) = inner.traces.finish(&trace).await {
                warn!("Failed to persist trace {}: {}", trace.trace_id(), e);
            }
            inner.persist_stats().await;
        });
    }
}

/// Finishes a run's trace exactly once, including when the run's future is
/// dropped before it completes
struct RunGuard<'a> {
    engine: &'a Engine,
    trace: Option<Arc<RunTrace>>,
}

impl RunGuard<'_> {
    fn finish(mut self, post: Option<(Arc<Action>, RunContext)>) {
        if let Some(trace) = self.trace.take() {
            self.engine.finish_run(trace, post);
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let Some(trace) = self.trace.take() else {
            return;
        };
        warn!("Run {} dropped before completion", trace.trace_id());
        if tokio::runtime::Handle::try_current().is_ok() {
            self.engine.finish_run(trace, None);
        } else {
            self.engine.inner.traces.discard(trace.trace_id());
        }
    }
}
