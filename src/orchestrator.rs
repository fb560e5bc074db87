use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::correlator::EventCorrelator;
use crate::dispatcher::ToolDispatcher;
use crate::engine::{AiEngine, EngineConversation, EngineTurn, GREETING_INSTRUCTION, ToolResultMsg, build_system_prompt};
use crate::error::SwitchboardError;
use crate::kb_router::KnowledgeBaseRouter;
use crate::media::{SpeechPipeline, SpeechSession, SttEvent};
use crate::store::SessionStore;
use crate::tools::ToolCall;

/// Engine follow-up turns allowed after tool results before the
/// orchestrator gives up on the round and apologizes.
const MAX_TOOL_ROUNDS: usize = 4;

const APOLOGY: &str = "I'm sorry, I'm having trouble with that right now.";

/// Inbound audio/control frame from the telephony stream. The stream opens
/// anonymously; frames carry no caller identity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind")]
pub enum InboundFrame {
    AudioData {
        #[serde(rename = "audioData")]
        audio_data: InboundAudio,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundAudio {
    /// Base64 PCM chunk.
    pub data: String,
}

/// Outbound frame to the telephony stream. The telephony side expects
/// PascalCase keys, unlike what it sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundFrame {
    pub kind: &'static str,
    pub audio_data: Option<OutboundAudio>,
    pub stop_audio: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutboundAudio {
    pub data: String,
}

impl OutboundFrame {
    pub fn audio(b64: String) -> Self {
        Self {
            kind: "AudioData",
            audio_data: Some(OutboundAudio { data: b64 }),
            stop_audio: None,
        }
    }

    /// Barge-in: tell the telephony side to stop playing queued audio.
    pub fn stop_audio() -> Self {
        Self {
            kind: "StopAudio",
            audio_data: None,
            stop_audio: Some(serde_json::json!({})),
        }
    }
}

enum Flow {
    Continue,
    Closed,
}

/// Release a session unconditionally: mark it closed (dropping any pending
/// action marker) and remove it from the store. Safe to call on sessions
/// that are already gone, so the socket handler can run it after aborting a
/// call task mid-turn.
pub async fn finalize_session(store: &dyn SessionStore, id: Uuid) {
    match store
        .update(id, &|s| {
            s.close();
            Ok(())
        })
        .await
    {
        Ok(_) | Err(SwitchboardError::NotFound(_)) => {}
        Err(e) => warn!(session = %id, "failed to close session: {e}"),
    }
    match store.delete(id).await {
        Ok(_) => {}
        Err(e) => warn!(session = %id, "failed to delete session: {e}"),
    }
}

/// Drives one call end to end: waits out correlation, opens the engine
/// conversation and speech session, then loops
/// listening -> thinking -> acting until a terminal tool succeeds or the
/// transport closes. Turns are strictly sequential per session; sessions
/// only ever share the store.
pub struct CallOrchestrator {
    store: Arc<dyn SessionStore>,
    correlator: Arc<EventCorrelator>,
    dispatcher: Arc<ToolDispatcher>,
    engine: Arc<dyn AiEngine>,
    speech: Arc<dyn SpeechPipeline>,
    router: Arc<KnowledgeBaseRouter>,
    engine_turn_timeout: Duration,
}

impl CallOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        correlator: Arc<EventCorrelator>,
        dispatcher: Arc<ToolDispatcher>,
        engine: Arc<dyn AiEngine>,
        speech: Arc<dyn SpeechPipeline>,
        router: Arc<KnowledgeBaseRouter>,
        engine_turn_timeout: Duration,
    ) -> Self {
        Self {
            store,
            correlator,
            dispatcher,
            engine,
            speech,
            router,
            engine_turn_timeout,
        }
    }

    pub async fn run_call(
        &self,
        session_id: Uuid,
        mut frames: mpsc::Receiver<InboundFrame>,
        out: mpsc::Sender<OutboundFrame>,
    ) -> Result<(), SwitchboardError> {
        // CONNECTING: the webhook may not have arrived yet
        let session = match self.correlator.wait_for_activation(session_id).await {
            Ok(s) => s,
            Err(e) => {
                info!(session = %session_id, "call never correlated: {e}");
                finalize_session(self.store.as_ref(), session_id).await;
                return Err(e);
            }
        };
        // activation requires a merged identity, so a missing dialed number
        // here is corrupt state, not a routing fallback
        let Some(service_number) = session.service_number.clone() else {
            warn!(session = %session_id, "active session has no dialed number");
            finalize_session(self.store.as_ref(), session_id).await;
            return Err(SwitchboardError::InvariantViolation(format!(
                "active session {session_id} has no dialed number"
            )));
        };
        info!(
            session = %session_id,
            service_number = %service_number,
            "call active, starting conversation"
        );

        let prompt = build_system_prompt(self.router.system_blurb(&service_number));
        let mut convo = match self.engine.begin(&prompt).await {
            Ok(c) => c,
            Err(e) => {
                finalize_session(self.store.as_ref(), session_id).await;
                return Err(e);
            }
        };
        let mut speech = match self.speech.open().await {
            Ok(s) => s,
            Err(e) => {
                finalize_session(self.store.as_ref(), session_id).await;
                return Err(e);
            }
        };

        // greeting happens before the caller says anything
        let greeting = self.timed(convo.instruct(GREETING_INSTRUCTION)).await;
        match self
            .drive_turn(session_id, greeting, &mut convo, &mut speech, &out)
            .await
        {
            Ok(Flow::Continue) => {}
            Ok(Flow::Closed) => {
                finalize_session(self.store.as_ref(), session_id).await;
                return Ok(());
            }
            Err(e) => {
                finalize_session(self.store.as_ref(), session_id).await;
                return Err(e);
            }
        }

        while let Some(frame) = frames.recv().await {
            let InboundFrame::AudioData { audio_data } = frame;
            let chunk = match BASE64.decode(&audio_data.data) {
                Ok(c) => c,
                Err(e) => {
                    debug!(session = %session_id, "dropping undecodable audio frame: {e}");
                    continue;
                }
            };
            let events = match speech.push_audio(&chunk).await {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(session = %session_id, "transcription failed: {e}");
                    continue;
                }
            };
            for event in events {
                match event {
                    SttEvent::SpeechStarted => {
                        debug!(session = %session_id, "caller speech started, cutting playback");
                        let _ = out.send(OutboundFrame::stop_audio()).await;
                    }
                    SttEvent::Utterance(text) => {
                        debug!(session = %session_id, transcript = %text, "utterance boundary, thinking");
                        let turn = self.timed(convo.user_turn(&text)).await;
                        match self
                            .drive_turn(session_id, turn, &mut convo, &mut speech, &out)
                            .await
                        {
                            Ok(Flow::Continue) => {
                                debug!(session = %session_id, "turn settled, listening");
                            }
                            Ok(Flow::Closed) => {
                                finalize_session(self.store.as_ref(), session_id).await;
                                return Ok(());
                            }
                            Err(e) => {
                                finalize_session(self.store.as_ref(), session_id).await;
                                return Err(e);
                            }
                        }
                    }
                }
            }
        }

        // transport closed (caller hung up or tunnel dropped)
        info!(session = %session_id, "transport closed, releasing session");
        finalize_session(self.store.as_ref(), session_id).await;
        Ok(())
    }

    /// Resolve one engine turn, dispatching tool calls and feeding results
    /// back until the engine settles on dialogue. Recoverable failures
    /// degrade to an apology instead of dropping the call.
    async fn drive_turn(
        &self,
        session_id: Uuid,
        first: Result<EngineTurn, SwitchboardError>,
        convo: &mut Box<dyn EngineConversation>,
        speech: &mut Box<dyn SpeechSession>,
        out: &mpsc::Sender<OutboundFrame>,
    ) -> Result<Flow, SwitchboardError> {
        let mut turn = first;
        for _ in 0..MAX_TOOL_ROUNDS {
            match turn {
                Err(e @ SwitchboardError::InvariantViolation(_)) => return Err(e),
                Err(SwitchboardError::NotFound(_)) => return Ok(Flow::Closed),
                Err(e) => {
                    warn!(session = %session_id, "engine turn failed: {e}");
                    self.speak(speech, out, session_id, APOLOGY).await;
                    return Ok(Flow::Continue);
                }
                Ok(EngineTurn::Dialogue(text)) => {
                    self.speak(speech, out, session_id, &text).await;
                    return Ok(Flow::Continue);
                }
                Ok(EngineTurn::ToolCalls(calls)) => {
                    let mut results = Vec::with_capacity(calls.len());
                    for call in &calls {
                        match self.dispatcher.dispatch(session_id, call).await {
                            Ok(outcome) => {
                                let output = outcome.engine_output();
                                if call.is_terminal() {
                                    self.speak(speech, out, session_id, &output).await;
                                    return Ok(Flow::Closed);
                                }
                                results.push(ToolResultMsg {
                                    tool: call.name(),
                                    output,
                                });
                            }
                            Err(e @ SwitchboardError::InvariantViolation(_)) => return Err(e),
                            Err(SwitchboardError::NotFound(_)) => return Ok(Flow::Closed),
                            Err(e) => {
                                warn!(
                                    session = %session_id,
                                    tool = call.name(),
                                    "tool call failed: {e}"
                                );
                                results.push(ToolResultMsg {
                                    tool: call.name(),
                                    output: degraded_output(call, &e),
                                });
                            }
                        }
                    }
                    turn = self.timed(convo.tool_turn(&results)).await;
                }
            }
        }
        warn!(session = %session_id, "engine would not settle after {MAX_TOOL_ROUNDS} tool rounds");
        self.speak(speech, out, session_id, APOLOGY).await;
        Ok(Flow::Continue)
    }

    async fn speak(
        &self,
        speech: &mut Box<dyn SpeechSession>,
        out: &mpsc::Sender<OutboundFrame>,
        session_id: Uuid,
        text: &str,
    ) {
        let frames = match speech.synthesize(text).await {
            Ok(f) => f,
            Err(e) => {
                warn!(session = %session_id, "synthesis failed, caller hears nothing: {e}");
                return;
            }
        };
        for frame in frames {
            if out
                .send(OutboundFrame::audio(BASE64.encode(frame)))
                .await
                .is_err()
            {
                // writer gone; the transport close is handled by the main loop
                return;
            }
        }
    }

    async fn timed(
        &self,
        fut: impl Future<Output = Result<EngineTurn, SwitchboardError>> + Send,
    ) -> Result<EngineTurn, SwitchboardError> {
        match tokio::time::timeout(self.engine_turn_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(SwitchboardError::collaborator("engine", "turn timed out")),
        }
    }
}

/// Tool-failure text handed back to the engine so it can adjust its next
/// turn instead of stalling the dialogue.
fn degraded_output(call: &ToolCall, err: &SwitchboardError) -> String {
    match err {
        SwitchboardError::NotConfigured(_) => match call {
            ToolCall::TransferCall => {
                "No human agent is configured for this line; apologize and continue.".to_string()
            }
            _ => "The knowledge base is not configured for this line; say you cannot look that up."
                .to_string(),
        },
        SwitchboardError::ActionConflict(pending) => {
            format!("A {pending} action is already in progress; do not retry.")
        }
        _ => format!(
            "The {} action failed; apologize briefly and offer to try again.",
            call.name()
        ),
    }
}
