use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SwitchboardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Transferring,
    Ending,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Transferring => "transferring",
            SessionStatus::Ending => "ending",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SessionStatus::Pending),
            "active" => Some(SessionStatus::Active),
            "transferring" => Some(SessionStatus::Transferring),
            "ending" => Some(SessionStatus::Ending),
            "closed" => Some(SessionStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An irreversible call-ending operation. At most one may be in flight per
/// session at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalAction {
    EndCall,
    TransferCall,
}

impl TerminalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalAction::EndCall => "end_call",
            TerminalAction::TransferCall => "transfer_call",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "end_call" => Some(TerminalAction::EndCall),
            "transfer_call" => Some(TerminalAction::TransferCall),
            _ => None,
        }
    }

    /// The status a session holds while this action's external call runs.
    pub fn in_flight_status(&self) -> SessionStatus {
        match self {
            TerminalAction::EndCall => SessionStatus::Ending,
            TerminalAction::TransferCall => SessionStatus::Transferring,
        }
    }
}

impl std::fmt::Display for TerminalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The correlation unit tying one physical call to its metadata.
///
/// Created on the first event seen for a call (webhook or socket open,
/// order unspecified) and enriched as the other stream arrives. The id is
/// the store key and never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// Identifier assigned by the telephony layer; absent until the
    /// incoming-call webhook fires.
    pub call_connection_id: Option<String>,
    /// Caller's number, E.164-like. The SMS destination.
    pub phone_number: Option<String>,
    /// The number the caller dialed. Routing key for knowledge base, agent
    /// transfer target and system prompt.
    pub service_number: Option<String>,
    pub status: SessionStatus,
    pub pending_action: Option<TerminalAction>,
    /// Whether a live audio/control socket is bound to this session.
    pub socket_attached: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id,
            call_connection_id: None,
            phone_number: None,
            service_number: None,
            status: SessionStatus::Pending,
            pending_action: None,
            socket_attached: false,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// Both event streams have arrived: telephony identity and a live socket.
    pub fn is_correlated(&self) -> bool {
        self.call_connection_id.is_some() && self.phone_number.is_some() && self.socket_attached
    }

    /// Identity fields are frozen once the session leaves `Pending`/`Active`.
    pub fn identity_frozen(&self) -> bool {
        !matches!(self.status, SessionStatus::Pending | SessionStatus::Active)
    }

    /// Merge telephony identity delivered by the incoming-call webhook.
    /// Idempotent for re-delivery of the same event; a conflicting
    /// `call_connection_id` is an invariant violation.
    pub fn merge_identity(
        &mut self,
        call_connection_id: &str,
        phone_number: &str,
        service_number: &str,
    ) -> Result<(), SwitchboardError> {
        if self.identity_frozen() {
            return Err(SwitchboardError::InvariantViolation(format!(
                "identity merge on {} session {}",
                self.status.as_str(),
                self.id
            )));
        }
        match &self.call_connection_id {
            Some(existing) if existing != call_connection_id => {
                return Err(SwitchboardError::InvariantViolation(format!(
                    "session {} already bound to call connection {}",
                    self.id, existing
                )));
            }
            Some(_) => return Ok(()),
            None => {}
        }
        self.call_connection_id = Some(call_connection_id.to_string());
        self.phone_number = Some(phone_number.to_string());
        self.service_number = Some(service_number.to_string());
        self.touch();
        Ok(())
    }

    /// Bind the live socket. Fails if one is already bound, which keeps at
    /// most one socket per call connection.
    pub fn attach_socket(&mut self) -> Result<(), SwitchboardError> {
        if self.socket_attached {
            return Err(SwitchboardError::InvariantViolation(format!(
                "session {} already has a socket attached",
                self.id
            )));
        }
        if self.identity_frozen() {
            return Err(SwitchboardError::InvariantViolation(format!(
                "socket attach on {} session {}",
                self.status.as_str(),
                self.id
            )));
        }
        self.socket_attached = true;
        self.touch();
        Ok(())
    }

    /// The only backward-compatible transition: `Pending -> Active`, taken
    /// once both streams are present.
    pub fn activate_if_correlated(&mut self) {
        if self.status == SessionStatus::Pending && self.is_correlated() {
            self.status = SessionStatus::Active;
            self.touch();
        }
    }

    /// Conditional `Active -> {Ending|Transferring}` step. Rejects with
    /// `ActionConflict` when the session is not `Active` or another terminal
    /// action is pending.
    pub fn begin_terminal(&mut self, action: TerminalAction) -> Result<(), SwitchboardError> {
        if let Some(pending) = self.pending_action {
            return Err(SwitchboardError::ActionConflict(pending));
        }
        if self.status != SessionStatus::Active {
            return Err(SwitchboardError::ActionConflict(action));
        }
        self.status = action.in_flight_status();
        self.pending_action = Some(action);
        self.touch();
        Ok(())
    }

    /// External call failed: return to `Active` so another attempt can be
    /// made.
    pub fn revert_terminal(&mut self) {
        if self.pending_action.take().is_some() && self.status != SessionStatus::Closed {
            self.status = SessionStatus::Active;
        }
        self.touch();
    }

    /// External call succeeded: the session is done.
    pub fn complete_terminal(&mut self) {
        self.pending_action = None;
        self.status = SessionStatus::Closed;
        self.touch();
    }

    /// Unconditional close, used for cancellation and timeout discard. Any
    /// in-flight action marker is dropped with the session.
    pub fn close(&mut self) {
        self.pending_action = None;
        self.status = SessionStatus::Closed;
        self.socket_attached = false;
        self.touch();
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}
