use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Search-index selection for one dialed number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    pub search_index: String,
    pub search_semantic_configuration: String,
}

/// Everything keyed off the number the caller dialed: the persona blurb for
/// the system prompt, the human agent to transfer to, and the knowledge base
/// to search. Any of them may be absent for a given number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RouteConfig {
    pub system_blurb: Option<String>,
    pub agent_number: Option<String>,
    pub knowledge_base: Option<KnowledgeBaseConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: attempt n waits n * base_delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms * u64::from(attempt.max(1)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// `sqlite://...` URL for the session store. Defaults to a file next to
    /// the process when unset.
    pub database_url: Option<String>,
    /// How long webhook and socket events for the same call may straddle
    /// each other before a half-correlated session is discarded.
    #[serde(default = "default_correlation_window_secs")]
    pub correlation_window_secs: u64,
    #[serde(default = "default_engine_turn_timeout_secs")]
    pub engine_turn_timeout_secs: u64,
    #[serde(default = "default_collaborator_timeout_secs")]
    pub collaborator_timeout_secs: u64,
    #[serde(default)]
    pub store_retry: RetryPolicy,
    /// Dialed number -> routing configuration.
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
    /// Fallback search configuration for numbers with no mapped knowledge
    /// base. When this is also absent, `search` reports `NotConfigured`.
    pub default_knowledge_base: Option<KnowledgeBaseConfig>,
    #[serde(default)]
    pub collaborators: CollaboratorSettings,
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Endpoints for the request/response external collaborators. Keys come
/// from the environment, not the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorSettings {
    #[serde(default = "default_sms_url")]
    pub sms_url: String,
    #[serde(default = "default_sms_from")]
    pub sms_from_number: String,
    #[serde(default = "default_search_url")]
    pub search_url: String,
    #[serde(default = "default_call_control_url")]
    pub call_control_url: String,
    #[serde(default = "default_speech_url")]
    pub speech_url: String,
}

impl Default for CollaboratorSettings {
    fn default() -> Self {
        Self {
            sms_url: default_sms_url(),
            sms_from_number: default_sms_from(),
            search_url: default_search_url(),
            call_control_url: default_call_control_url(),
            speech_url: default_speech_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_engine_url")]
    pub base_url: String,
    #[serde(default = "default_engine_model")]
    pub model: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_url: default_engine_url(),
            model: default_engine_model(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            database_url: None,
            correlation_window_secs: default_correlation_window_secs(),
            engine_turn_timeout_secs: default_engine_turn_timeout_secs(),
            collaborator_timeout_secs: default_collaborator_timeout_secs(),
            store_retry: RetryPolicy::default(),
            routes: HashMap::new(),
            default_knowledge_base: None,
            collaborators: CollaboratorSettings::default(),
            engine: EngineSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)?;
                serde_json::from_str(&raw)?
            }
            None => Settings::default(),
        };
        if let Ok(listen) = std::env::var("SWITCHBOARD_LISTEN") {
            settings.listen = listen;
        }
        if let Ok(url) = std::env::var("SWITCHBOARD_DATABASE_URL") {
            settings.database_url = Some(url);
        }
        Ok(settings)
    }

    pub fn correlation_window(&self) -> Duration {
        Duration::from_secs(self.correlation_window_secs)
    }

    pub fn engine_turn_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_turn_timeout_secs)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }
}

fn default_listen() -> String {
    "127.0.0.1:7070".into()
}

fn default_correlation_window_secs() -> u64 {
    30
}

fn default_engine_turn_timeout_secs() -> u64 {
    30
}

fn default_collaborator_timeout_secs() -> u64 {
    10
}

fn default_sms_url() -> String {
    "http://127.0.0.1:8081/sms".into()
}

fn default_sms_from() -> String {
    "+15550000000".into()
}

fn default_search_url() -> String {
    "http://127.0.0.1:8082/search".into()
}

fn default_call_control_url() -> String {
    "http://127.0.0.1:8083/calls".into()
}

fn default_speech_url() -> String {
    "http://127.0.0.1:8085/speech".into()
}

fn default_engine_url() -> String {
    "http://127.0.0.1:8084/v1".into()
}

fn default_engine_model() -> String {
    "gpt-4o-realtime".into()
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    25
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_sparse_config() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "routes": {
                    "+15559990000": {
                        "system_blurb": "Cricket Expert",
                        "agent_number": "+15557770000",
                        "knowledge_base": {
                            "search_index": "cricket-index",
                            "search_semantic_configuration": "cricket-semantic"
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.listen, default_listen());
        assert_eq!(settings.correlation_window_secs, 30);
        assert_eq!(settings.store_retry.attempts, 5);
        let route = settings.routes.get("+15559990000").unwrap();
        assert_eq!(route.system_blurb.as_deref(), Some("Cricket Expert"));
        assert_eq!(
            route.knowledge_base.as_ref().unwrap().search_index,
            "cricket-index"
        );
    }

    #[test]
    fn retry_delay_grows_linearly() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay_ms: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(30));
    }
}
