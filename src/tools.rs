use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SwitchboardError;

pub const MAX_SMS_MESSAGES: usize = 3;
pub const MAX_SMS_MESSAGE_CHARS: usize = 300;

/// Separator the AI engine is told to parse between search results. Part of
/// the engine wire contract, not a formatting convenience.
pub const SEARCH_RESULT_SEPARATOR: &str = "\n---\n";

/// The closed set of actions the AI engine may request. Argument shapes are
/// validated here, before any session state is touched; an engine that
/// names an unknown tool or malforms arguments gets `InvalidToolArgs` back
/// as a tool failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "name")]
pub enum ToolCall {
    SendSms { messages: Vec<String> },
    Search { query: String },
    EndCall { reason: String },
    TransferCall,
}

impl ToolCall {
    /// Build a validated tool call from the engine's `(name, arguments)`
    /// pair.
    pub fn parse(name: &str, args: &Value) -> Result<ToolCall, SwitchboardError> {
        let call = match name {
            "send_sms" => {
                let messages = args
                    .get("messages")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        SwitchboardError::InvalidToolArgs("send_sms requires a messages array".into())
                    })?
                    .iter()
                    .map(|m| {
                        m.as_str().map(str::to_string).ok_or_else(|| {
                            SwitchboardError::InvalidToolArgs(
                                "send_sms messages must be strings".into(),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                ToolCall::SendSms { messages }
            }
            "search" => {
                let query = args
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        SwitchboardError::InvalidToolArgs("search requires a query string".into())
                    })?
                    .to_string();
                ToolCall::Search { query }
            }
            "end_call" => {
                let reason = args
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("caller requested")
                    .to_string();
                ToolCall::EndCall { reason }
            }
            "transfer_call" => ToolCall::TransferCall,
            other => {
                return Err(SwitchboardError::InvalidToolArgs(format!(
                    "unknown tool {other}"
                )));
            }
        };
        call.validate()?;
        Ok(call)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::SendSms { .. } => "send_sms",
            ToolCall::Search { .. } => "search",
            ToolCall::EndCall { .. } => "end_call",
            ToolCall::TransferCall => "transfer_call",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolCall::EndCall { .. } | ToolCall::TransferCall)
    }

    pub fn validate(&self) -> Result<(), SwitchboardError> {
        match self {
            ToolCall::SendSms { messages } => {
                if messages.is_empty() || messages.len() > MAX_SMS_MESSAGES {
                    return Err(SwitchboardError::InvalidToolArgs(format!(
                        "send_sms takes 1 to {MAX_SMS_MESSAGES} messages, got {}",
                        messages.len()
                    )));
                }
                for (i, m) in messages.iter().enumerate() {
                    if m.is_empty() {
                        return Err(SwitchboardError::InvalidToolArgs(format!(
                            "send_sms message {i} is empty"
                        )));
                    }
                    if m.chars().count() > MAX_SMS_MESSAGE_CHARS {
                        return Err(SwitchboardError::InvalidToolArgs(format!(
                            "send_sms message {i} exceeds {MAX_SMS_MESSAGE_CHARS} characters"
                        )));
                    }
                }
                Ok(())
            }
            ToolCall::Search { query } => {
                if query.trim().is_empty() {
                    return Err(SwitchboardError::InvalidToolArgs(
                        "search query is empty".into(),
                    ));
                }
                Ok(())
            }
            ToolCall::EndCall { .. } | ToolCall::TransferCall => Ok(()),
        }
    }
}

/// Outcome of one SMS message attempt, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmsDelivery {
    pub index: usize,
    pub delivered: bool,
    pub error: Option<String>,
}

/// Result of a dispatched tool call, fed back to the AI engine so the
/// dialogue can continue (or, for terminal tools, stop).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ToolOutcome {
    SmsSent { deliveries: Vec<SmsDelivery> },
    SearchResults { formatted: String, hits: usize },
    CallEnded,
    CallTransferred,
}

impl ToolOutcome {
    /// Render the outcome as the text handed back to the engine.
    pub fn engine_output(&self) -> String {
        match self {
            ToolOutcome::SmsSent { deliveries } => {
                let sent = deliveries.iter().filter(|d| d.delivered).count();
                if sent == deliveries.len() {
                    format!("All {sent} messages were sent.")
                } else {
                    let failed: Vec<String> = deliveries
                        .iter()
                        .filter(|d| !d.delivered)
                        .map(|d| format!("message {}", d.index + 1))
                        .collect();
                    format!(
                        "Sent {sent} of {} messages; {} failed.",
                        deliveries.len(),
                        failed.join(", ")
                    )
                }
            }
            ToolOutcome::SearchResults { formatted, hits } => {
                if *hits == 0 {
                    "I couldn't find the information requested.".to_string()
                } else {
                    format!("I have found the insights for query: {formatted}")
                }
            }
            ToolOutcome::CallEnded => "The call is being terminated.".to_string(),
            ToolOutcome::CallTransferred => {
                "The call is being transferred to a human agent.".to_string()
            }
        }
    }
}
