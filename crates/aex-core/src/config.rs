//! Engine configuration, loadable from YAML.
//!
//! ```yaml
//! timeouts:
//!   function_step: 30s
//!   model_call: 2m
//! conversation:
//!   prune_threshold: 40
//!   keep_recent_turns: 4
//! ambient:
//!   refresh: per_step
//! cascade:
//!   backoff_base: 30s
//!   tiers:
//!     low:
//!       - endpoint: https://api.example
//!         model_id: small
//! traces:
//!   max_retained: 100
//! max_depth: 16
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conversation::PruningPolicy;
use crate::error::{AexError, AexResult};
use crate::model::{ModelCandidate, Tier};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub timeouts: TimeoutConfig,
    pub conversation: ConversationConfig,
    pub ambient: AmbientConfig,
    pub cascade: CascadeConfig,
    pub traces: TraceConfig,
    /// Maximum nesting of sub-actions and tool-chosen actions
    pub max_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            conversation: ConversationConfig::default(),
            ambient: AmbientConfig::default(),
            cascade: CascadeConfig::default(),
            traces: TraceConfig::default(),
            max_depth: 16,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> AexResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> AexResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            AexError::config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> AexResult<()> {
        if self.max_depth == 0 {
            return Err(AexError::config("max_depth must be greater than zero"));
        }
        if self.cascade.backoff_base > self.cascade.backoff_max {
            return Err(AexError::config(
                "cascade.backoff_base must not exceed cascade.backoff_max",
            ));
        }
        if self.conversation.prune_threshold == 0 {
            return Err(AexError::config(
                "conversation.prune_threshold must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn pruning_policy(&self) -> PruningPolicy {
        PruningPolicy {
            threshold: self.conversation.prune_threshold,
            keep_recent_turns: self.conversation.keep_recent_turns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(with = "duration_str")]
    pub function_step: Duration,
    /// Applies to each candidate attempt separately
    #[serde(with = "duration_str")]
    pub model_call: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            function_step: Duration::from_secs(30),
            model_call: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Message count above which older turns are collapsed
    pub prune_threshold: usize,
    pub keep_recent_turns: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            prune_threshold: 40,
            keep_recent_turns: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbientRefresh {
    #[default]
    PerStep,
    PerRun,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbientConfig {
    pub refresh: AmbientRefresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    #[serde(with = "duration_str")]
    pub backoff_base: Duration,
    #[serde(with = "duration_str")]
    pub backoff_max: Duration,
    /// Errors older than this no longer count toward backoff
    #[serde(with = "duration_str")]
    pub error_decay_window: Duration,
    /// Ordered preference list per tier
    pub tiers: BTreeMap<Tier, Vec<ModelCandidate>>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(600),
            error_decay_window: Duration::from_secs(900),
            tiers: BTreeMap::new(),
        }
    }
}

impl CascadeConfig {
    pub fn with_tier(mut self, tier: Tier, candidates: Vec<ModelCandidate>) -> Self {
        self.tiers.insert(tier, candidates);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub max_retained: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { max_retained: 100 }
    }
}

/// Parse duration string (e.g., "250ms", "30s", "5m", "1h"); bare numbers are seconds
pub fn parse_duration(s: &str) -> AexResult<Duration> {
    let s = s.trim();
    let invalid = || AexError::config(format!("Invalid duration: {}", s));

    let (digits, scale_ms) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1_000)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60_000)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3_600_000)
    } else {
        (s, 1_000)
    };

    let num: u64 = digits.trim().parse().map_err(|_| invalid())?;
    Ok(Duration::from_millis(num.checked_mul(scale_ms).ok_or_else(invalid)?))
}

pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1_000 == 0 {
        format!("{}s", ms / 1_000)
    } else {
        format!("{}ms", ms)
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
