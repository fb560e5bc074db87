use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SwitchboardError;
use crate::kb_router::KnowledgeBaseRouter;
use crate::session::TerminalAction;
use crate::settings::KnowledgeBaseConfig;
use crate::store::SessionStore;
use crate::tools::{SEARCH_RESULT_SEPARATOR, SmsDelivery, ToolCall, ToolOutcome};

/// One knowledge base match, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub source: String,
    pub content: String,
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<(), SwitchboardError>;
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(
        &self,
        config: &KnowledgeBaseConfig,
        query: &str,
    ) -> Result<Vec<SearchHit>, SwitchboardError>;
}

#[async_trait]
pub trait CallControl: Send + Sync {
    async fn hang_up(&self, call_connection_id: &str) -> Result<(), SwitchboardError>;
    async fn transfer(
        &self,
        call_connection_id: &str,
        agent_number: &str,
        source_number: &str,
    ) -> Result<(), SwitchboardError>;
}

/// Render hits in the engine wire format: each tagged with its source
/// label, joined and terminated by the result separator.
pub fn format_search_results(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for hit in hits {
        out.push_str(&format!("[source: {}] {}", hit.source, hit.content));
        out.push_str(SEARCH_RESULT_SEPARATOR);
    }
    out
}

fn looks_like_e164(number: &str) -> bool {
    let mut chars = number.chars();
    chars.next() == Some('+') && number.len() > 1 && chars.all(|c| c.is_ascii_digit())
}

/// Executes validated tool calls against a resolved session. Terminal
/// actions are guarded by the store's conditional `Active ->
/// {Ending|Transferring}` transition, so a second concurrent hang-up or
/// transfer fails fast with `ActionConflict` while the first one's
/// external call runs unlocked.
pub struct ToolDispatcher {
    store: Arc<dyn SessionStore>,
    router: Arc<KnowledgeBaseRouter>,
    sms: Arc<dyn SmsSender>,
    search: Arc<dyn SearchClient>,
    call_control: Arc<dyn CallControl>,
    fallback_kb: Option<KnowledgeBaseConfig>,
}

impl ToolDispatcher {
    pub fn new(
        store: Arc<dyn SessionStore>,
        router: Arc<KnowledgeBaseRouter>,
        sms: Arc<dyn SmsSender>,
        search: Arc<dyn SearchClient>,
        call_control: Arc<dyn CallControl>,
        fallback_kb: Option<KnowledgeBaseConfig>,
    ) -> Self {
        Self {
            store,
            router,
            sms,
            search,
            call_control,
            fallback_kb,
        }
    }

    pub async fn dispatch(
        &self,
        session_id: Uuid,
        call: &ToolCall,
    ) -> Result<ToolOutcome, SwitchboardError> {
        call.validate()?;
        info!(session = %session_id, tool = call.name(), "dispatching tool call");
        match call {
            ToolCall::SendSms { messages } => self.send_sms(session_id, messages).await,
            ToolCall::Search { query } => self.search(session_id, query).await,
            ToolCall::EndCall { reason } => self.end_call(session_id, reason).await,
            ToolCall::TransferCall => self.transfer_call(session_id).await,
        }
    }

    async fn send_sms(
        &self,
        session_id: Uuid,
        messages: &[String],
    ) -> Result<ToolOutcome, SwitchboardError> {
        let session = self.store.get(session_id).await?;
        let to = session.phone_number.ok_or_else(|| {
            SwitchboardError::InvariantViolation(format!(
                "send_sms on session {session_id} with no caller number"
            ))
        })?;
        // raw telephony ids (e.g. "4:+1555...") can reach here when the
        // webhook carried no plain phone number; an undeliverable
        // destination is a tool failure, not corruption
        if !looks_like_e164(&to) {
            return Err(SwitchboardError::InvalidToolArgs(format!(
                "sms destination {to:?} is not an E.164 number"
            )));
        }

        // one attempt per message; a failure never blocks the rest
        let mut deliveries = Vec::with_capacity(messages.len());
        for (index, body) in messages.iter().enumerate() {
            match self.sms.send(&to, body).await {
                Ok(()) => deliveries.push(SmsDelivery {
                    index,
                    delivered: true,
                    error: None,
                }),
                Err(e) => {
                    warn!(session = %session_id, index, "sms delivery failed: {e}");
                    deliveries.push(SmsDelivery {
                        index,
                        delivered: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(ToolOutcome::SmsSent { deliveries })
    }

    async fn search(
        &self,
        session_id: Uuid,
        query: &str,
    ) -> Result<ToolOutcome, SwitchboardError> {
        let session = self.store.get(session_id).await?;
        let service_number = session.service_number.ok_or_else(|| {
            SwitchboardError::InvariantViolation(format!(
                "search on session {session_id} with no dialed number"
            ))
        })?;
        let config = match self.router.knowledge_base(&service_number) {
            Ok(config) => config.clone(),
            Err(SwitchboardError::NotConfigured(n)) => match &self.fallback_kb {
                Some(fallback) => fallback.clone(),
                None => return Err(SwitchboardError::NotConfigured(n)),
            },
            Err(e) => return Err(e),
        };

        let hits = self.search.search(&config, query).await?;
        Ok(ToolOutcome::SearchResults {
            formatted: format_search_results(&hits),
            hits: hits.len(),
        })
    }

    async fn end_call(
        &self,
        session_id: Uuid,
        reason: &str,
    ) -> Result<ToolOutcome, SwitchboardError> {
        let session = self
            .store
            .update(session_id, &|s| s.begin_terminal(TerminalAction::EndCall))
            .await?;
        let conn_id = match &session.call_connection_id {
            Some(id) => id.clone(),
            None => {
                self.revert(session_id).await;
                return Err(SwitchboardError::InvariantViolation(format!(
                    "active session {session_id} has no call connection id"
                )));
            }
        };

        info!(session = %session_id, call_connection_id = %conn_id, reason, "hanging up");
        match self.call_control.hang_up(&conn_id).await {
            Ok(()) => {
                self.store
                    .update(session_id, &|s| {
                        s.complete_terminal();
                        Ok(())
                    })
                    .await?;
                Ok(ToolOutcome::CallEnded)
            }
            Err(e) => {
                self.revert(session_id).await;
                Err(e)
            }
        }
    }

    async fn transfer_call(&self, session_id: Uuid) -> Result<ToolOutcome, SwitchboardError> {
        // resolve the transfer target before touching session state
        let current = self.store.get(session_id).await?;
        let service_number = current.service_number.clone().ok_or_else(|| {
            SwitchboardError::InvariantViolation(format!(
                "transfer on session {session_id} with no dialed number"
            ))
        })?;
        let agent_number = self.router.agent_number(&service_number)?.to_string();

        let session = self
            .store
            .update(session_id, &|s| {
                s.begin_terminal(TerminalAction::TransferCall)
            })
            .await?;
        let conn_id = match &session.call_connection_id {
            Some(id) => id.clone(),
            None => {
                self.revert(session_id).await;
                return Err(SwitchboardError::InvariantViolation(format!(
                    "active session {session_id} has no call connection id"
                )));
            }
        };

        info!(session = %session_id, agent = %agent_number, "transferring to human agent");
        match self
            .call_control
            .transfer(&conn_id, &agent_number, &service_number)
            .await
        {
            Ok(()) => {
                self.store
                    .update(session_id, &|s| {
                        s.complete_terminal();
                        Ok(())
                    })
                    .await?;
                Ok(ToolOutcome::CallTransferred)
            }
            Err(e) => {
                self.revert(session_id).await;
                Err(e)
            }
        }
    }

    async fn revert(&self, session_id: Uuid) {
        let res = self
            .store
            .update(session_id, &|s| {
                s.revert_terminal();
                Ok(())
            })
            .await;
        if let Err(e) = res {
            warn!(session = %session_id, "failed to revert terminal action: {e}");
        }
    }
}

/// SMS collaborator speaking a plain JSON gateway protocol.
pub struct HttpSmsSender {
    client: reqwest::Client,
    url: String,
    from_number: String,
}

impl HttpSmsSender {
    pub fn new(client: reqwest::Client, url: String, from_number: String) -> Self {
        Self {
            client,
            url,
            from_number,
        }
    }
}

#[async_trait]
impl SmsSender for HttpSmsSender {
    async fn send(&self, to: &str, body: &str) -> Result<(), SwitchboardError> {
        let payload = serde_json::json!({
            "from": self.from_number,
            "to": to,
            "message": body,
            "enableDeliveryReport": true,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SwitchboardError::collaborator("sms", e))?;
        if !resp.status().is_success() {
            return Err(SwitchboardError::collaborator("sms", resp.status()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

pub struct HttpSearchClient {
    client: reqwest::Client,
    url: String,
}

impl HttpSearchClient {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(
        &self,
        config: &KnowledgeBaseConfig,
        query: &str,
    ) -> Result<Vec<SearchHit>, SwitchboardError> {
        let payload = serde_json::json!({
            "query": query,
            "searchIndex": config.search_index,
            "semanticConfiguration": config.search_semantic_configuration,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SwitchboardError::collaborator("search", e))?;
        if !resp.status().is_success() {
            return Err(SwitchboardError::collaborator("search", resp.status()));
        }
        let parsed: SearchResponse = resp
            .json()
            .await
            .map_err(|e| SwitchboardError::collaborator("search", e))?;
        Ok(parsed.results)
    }
}

pub struct HttpCallControl {
    client: reqwest::Client,
    url: String,
}

impl HttpCallControl {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    async fn post(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> Result<(), SwitchboardError> {
        let url = format!("{}/{}", self.url.trim_end_matches('/'), path);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SwitchboardError::collaborator("call-control", e))?;
        if !resp.status().is_success() {
            return Err(SwitchboardError::collaborator("call-control", resp.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl CallControl for HttpCallControl {
    async fn hang_up(&self, call_connection_id: &str) -> Result<(), SwitchboardError> {
        self.post(
            "hangUp",
            serde_json::json!({
                "callConnectionId": call_connection_id,
                "isForEveryone": true,
            }),
        )
        .await
    }

    async fn transfer(
        &self,
        call_connection_id: &str,
        agent_number: &str,
        source_number: &str,
    ) -> Result<(), SwitchboardError> {
        self.post(
            "transferToParticipant",
            serde_json::json!({
                "callConnectionId": call_connection_id,
                "targetParticipant": agent_number,
                "sourceCallerIdNumber": source_number,
            }),
        )
        .await
    }
}
