//! Scripted model client for tests.
//!
//! Replies are queued per model id and consumed in order; a standing reply set
//! with `respond_always`/`fail_always` answers once the queue is empty. Every
//! request is recorded for later assertions.

use std::collections::VecDeque;
use std::time::Duration;

use aex_core::{ModelCallError, ModelCandidate, ModelClient, ModelRequest, ModelResponse, ToolCall};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

type Reply = Result<ModelResponse, ModelCallError>;

/// A request observed by [`ScriptedModelClient`]
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub candidate: ModelCandidate,
    pub request: ModelRequest,
}

#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    queued: DashMap<String, VecDeque<Reply>>,
    standing: DashMap<String, Reply>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Option<Duration>,
}

impl ScriptedModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply, to exercise timeouts and interleaving
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn respond(&self, model_id: &str, response: ModelResponse) {
        self.enqueue(model_id, Ok(response));
    }

    pub fn fail(&self, model_id: &str, error: ModelCallError) {
        self.enqueue(model_id, Err(error));
    }

    pub fn respond_always(&self, model_id: &str, response: ModelResponse) {
        self.standing.insert(model_id.to_string(), Ok(response));
    }

    pub fn fail_always(&self, model_id: &str, error: ModelCallError) {
        self.standing.insert(model_id.to_string(), Err(error));
    }

    /// Queue a tool selection with JSON arguments
    pub fn select_tool(&self, model_id: &str, tool: &str, arguments: serde_json::Value) {
        let id = format!("call_{}", self.queued_len(model_id));
        self.respond(
            model_id,
            ModelResponse::ToolSelection {
                call: ToolCall {
                    id,
                    name: tool.to_string(),
                    arguments: arguments.to_string(),
                },
            },
        );
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn called_models(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| c.candidate.model_id.clone())
            .collect()
    }

    fn enqueue(&self, model_id: &str, reply: Reply) {
        self.queued
            .entry(model_id.to_string())
            .or_default()
            .push_back(reply);
    }

    fn queued_len(&self, model_id: &str) -> usize {
        self.queued.get(model_id).map_or(0, |q| q.len())
    }

    fn next_reply(&self, model_id: &str) -> Reply {
        if let Some(reply) = self
            .queued
            .get_mut(model_id)
            .and_then(|mut queue| queue.pop_front())
        {
            return reply;
        }
        match self.standing.get(model_id) {
            Some(reply) => reply.clone(),
            None => Err(ModelCallError::Transport(format!(
                "no scripted reply for model {}",
                model_id
            ))),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn call(
        &self,
        request: &ModelRequest,
        candidate: &ModelCandidate,
    ) -> Result<ModelResponse, ModelCallError> {
        self.calls.lock().push(RecordedCall {
            candidate: candidate.clone(),
            request: request.clone(),
        });
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.next_reply(&candidate.model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aex_core::{Message, OutputSchema, RequestedOutput};
    use serde_json::json;

    fn request() -> ModelRequest {
        ModelRequest {
            messages: vec![Message::user("hello")],
            output: RequestedOutput::Structured(OutputSchema::from_json_schema(json!({}))),
        }
    }

    #[tokio::test]
    async fn test_queue_then_standing_then_unscripted() {
        let client = ScriptedModelClient::new();
        let candidate = ModelCandidate::new("e", "m");
        client.respond("m", ModelResponse::Text { content: "first".into() });
        client.respond_always("m", ModelResponse::Text { content: "always".into() });

        let first = client.call(&request(), &candidate).await.unwrap();
        let second = client.call(&request(), &candidate).await.unwrap();
        assert_eq!(first, ModelResponse::Text { content: "first".into() });
        assert_eq!(second, ModelResponse::Text { content: "always".into() });

        let other = ModelCandidate::new("e", "unknown");
        assert!(matches!(
            client.call(&request(), &other).await,
            Err(ModelCallError::Transport(_))
        ));
        assert_eq!(client.called_models(), vec!["m", "m", "unknown"]);
    }

    #[tokio::test]
    async fn test_select_tool_encodes_arguments() {
        let client = ScriptedModelClient::new();
        client.select_tool("m", "search", json!({"q": "rust"}));

        let reply = client
            .call(&request(), &ModelCandidate::new("e", "m"))
            .await
            .unwrap();
        let ModelResponse::ToolSelection { call } = reply else {
            panic!("expected tool selection");
        };
        assert_eq!(call.name, "search");
        assert_eq!(serde_json::from_str::<serde_json::Value>(&call.arguments).unwrap(), json!({"q": "rust"}));
        assert_eq!(client.calls()[0].request.messages[0].content, "hello");
    }
}
