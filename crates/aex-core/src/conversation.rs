//! Conversation history threaded through model-facing steps.

use serde::{Deserialize, Serialize};

/// Message in conversation history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Tool call ID (required for Tool role messages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

/// Tool selection proposed by a model. `arguments` is kept raw so callers can
/// tell malformed argument payloads apart from valid ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl Message {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    pub fn assistant_tool_call(call: ToolCall) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: String::new(),
            tool_calls: Some(vec![call]),
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// When and how far a tool-loop transcript is collapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruningPolicy {
    /// Message count above which earlier turns are collapsed
    pub threshold: usize,
    /// Most recent turns always kept verbatim
    pub keep_recent_turns: usize,
}

/// Turn-grouped transcript of a multi-turn tool loop.
///
/// Turns are pruned whole so a tool call is never separated from its result.
/// The first turn is always kept; collapsed turns are represented by a single
/// marker message placed right after it.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Vec<Message>>,
    collapsed: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_turn(&mut self, turn: Vec<Message>) {
        if !turn.is_empty() {
            self.turns.push(turn);
        }
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    /// Number of turns replaced by the marker so far
    pub fn collapsed_turns(&self) -> usize {
        self.collapsed
    }

    pub fn message_count(&self) -> usize {
        let marker = usize::from(self.collapsed > 0);
        self.turns.iter().map(Vec::len).sum::<usize>() + marker
    }

    /// Collapse the oldest turns after the first until the transcript fits the
    /// threshold or only the first and the recent turns remain. Returns the
    /// number of turns collapsed by this call.
    pub fn prune(&mut self, policy: PruningPolicy) -> usize {
        let mut removed = 0;
        while self.message_count() > policy.threshold
            && self.turns.len() > 1 + policy.keep_recent_turns
        {
            self.turns.remove(1);
            self.collapsed += 1;
            removed += 1;
        }
        removed
    }

    pub fn messages(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.message_count());
        for (index, turn) in self.turns.iter().enumerate() {
            out.extend(turn.iter().cloned());
            if index == 0 && self.collapsed > 0 {
                out.push(Message::user(format!(
                    "[{} earlier turns omitted]",
                    self.collapsed
                )));
            }
        }
        out
    }
}
