use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::correlator::{EventCorrelator, run_sweeper};
use crate::orchestrator::{CallOrchestrator, InboundFrame, OutboundFrame, finalize_session};
use crate::store::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub correlator: Arc<EventCorrelator>,
    pub orchestrator: Arc<CallOrchestrator>,
}

/// One entry of the webhook batch. Events arrive at least once; anything
/// other than validation and incoming-call is acknowledged and dropped.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingCallData {
    call_connection_id: String,
    from: PartyRef,
    to: PartyRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartyRef {
    phone_number: Option<PhoneNumberRef>,
    raw_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhoneNumberRef {
    value: String,
}

impl PartyRef {
    fn number(&self) -> Option<&str> {
        self.phone_number
            .as_ref()
            .map(|p| p.value.as_str())
            .or(self.raw_id.as_deref())
    }
}

/// Call-control webhook. Carries the caller's identity; never a socket.
pub async fn incoming_call_webhook(
    State(state): State<AppState>,
    Json(events): Json<Vec<WebhookEvent>>,
) -> Json<Value> {
    for event in events {
        if event.event_type.contains("SubscriptionValidation") {
            if let Some(code) = event.data.get("validationCode").and_then(Value::as_str) {
                return Json(json!({ "validationResponse": code }));
            }
            warn!("validation event without a validationCode");
            continue;
        }
        if !event.event_type.contains("IncomingCall") {
            debug!(event_type = %event.event_type, "ignoring webhook event");
            continue;
        }
        let data: IncomingCallData = match serde_json::from_value(event.data) {
            Ok(d) => d,
            Err(e) => {
                warn!("malformed incoming-call event: {e}");
                continue;
            }
        };
        let (Some(caller), Some(dialed)) = (data.from.number(), data.to.number()) else {
            warn!(
                call_connection_id = %data.call_connection_id,
                "incoming-call event without usable party numbers"
            );
            continue;
        };
        match state
            .correlator
            .incoming_call(&data.call_connection_id, caller, dialed)
            .await
        {
            Ok(session) => info!(
                session = %session.id,
                call_connection_id = %data.call_connection_id,
                status = %session.status,
                "webhook correlated"
            ),
            Err(e) => warn!(
                call_connection_id = %data.call_connection_id,
                "webhook correlation failed: {e}"
            ),
        }
    }
    Json(json!({}))
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The media stream opens anonymously; the correlator ties it to a webhook
/// session (or opens a fresh pending one). The conversation runs in its
/// own task so a socket close can cut it off mid-turn.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let session = match state.correlator.socket_opened().await {
        Ok(s) => s,
        Err(e) => {
            warn!("rejecting media stream, no session: {e}");
            return;
        }
    };
    let id = session.id;
    info!(session = %id, status = %session.status, "media stream attached");

    let (mut sender, mut receiver) = socket.split();
    // bounded so a slow telephony leg cannot grow memory without limit
    let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(256);
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(256);

    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    warn!("unencodable outbound frame: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let orchestrator = state.orchestrator.clone();
    let call_task = tokio::spawn(async move {
        if let Err(e) = orchestrator.run_call(id, in_rx, out_tx).await {
            warn!(session = %id, "call ended with error: {e}");
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<InboundFrame>(&text) {
                Ok(frame) => {
                    if in_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!(session = %id, "ignoring unrecognized frame: {e}"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Socket is gone. The call task may be blocked in an engine turn;
    // cancel it and release the session on its behalf.
    call_task.abort();
    let _ = call_task.await;
    finalize_session(state.store.as_ref(), id).await;
    send_task.abort();
    info!(session = %id, "media stream detached, session released");
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/incoming-call", post(incoming_call_webhook))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    tokio::spawn(run_sweeper(state.correlator.clone()));
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "switchboard listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use crate::store::tests::temp_store;
    use std::time::Duration;

    async fn webhook_state() -> (AppState, tempfile::TempDir) {
        let (store, dir) = temp_store().await;
        let store: Arc<dyn SessionStore> = Arc::new(store);
        let correlator = Arc::new(EventCorrelator::new(store.clone(), Duration::from_secs(30)));
        // webhook tests never reach the orchestrator; wire a minimal one
        let router = crate::dispatcher::tests::test_router();
        let dispatcher = Arc::new(crate::dispatcher::ToolDispatcher::new(
            store.clone(),
            router.clone(),
            Arc::new(crate::dispatcher::tests::MockSms::new(vec![])),
            Arc::new(crate::dispatcher::tests::MockSearch {
                hits: vec![],
                queried: std::sync::Mutex::new(Vec::new()),
            }),
            Arc::new(crate::dispatcher::tests::MockCallControl::ok()),
            None,
        ));
        let engine = Arc::new(crate::engine::ChatCompletionsEngine::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1".into(),
            None,
            "test".into(),
        ));
        let speech = Arc::new(crate::media::HttpSpeechPipeline::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1".into(),
        ));
        let orchestrator = Arc::new(CallOrchestrator::new(
            store.clone(),
            correlator.clone(),
            dispatcher,
            engine,
            speech,
            router,
            Duration::from_secs(2),
        ));
        (
            AppState {
                store,
                correlator,
                orchestrator,
            },
            dir,
        )
    }

    fn incoming_call_event(conn: &str) -> WebhookEvent {
        WebhookEvent {
            event_type: "Microsoft.Communication.IncomingCall".into(),
            data: json!({
                "callConnectionId": conn,
                "from": {"phoneNumber": {"value": "+15550001111"}},
                "to": {"phoneNumber": {"value": "+15559990000"}},
            }),
        }
    }

    #[tokio::test]
    async fn subscription_validation_echoes_the_code() {
        let (state, _dir) = webhook_state().await;
        let Json(body) = incoming_call_webhook(
            State(state),
            Json(vec![WebhookEvent {
                event_type: "Microsoft.EventGrid.SubscriptionValidationEvent".into(),
                data: json!({"validationCode": "abc-123"}),
            }]),
        )
        .await;
        assert_eq!(body["validationResponse"], "abc-123");
    }

    #[tokio::test]
    async fn incoming_call_event_creates_a_pending_session() {
        let (state, _dir) = webhook_state().await;
        incoming_call_webhook(State(state.clone()), Json(vec![incoming_call_event("conn-9")]))
            .await;

        let session = state
            .store
            .find_by_call_connection("conn-9")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.phone_number.as_deref(), Some("+15550001111"));
        assert_eq!(session.service_number.as_deref(), Some("+15559990000"));
    }

    #[tokio::test]
    async fn duplicate_webhook_delivery_is_idempotent() {
        let (state, _dir) = webhook_state().await;
        incoming_call_webhook(State(state.clone()), Json(vec![incoming_call_event("conn-9")]))
            .await;
        incoming_call_webhook(State(state.clone()), Json(vec![incoming_call_event("conn-9")]))
            .await;

        let first = state
            .store
            .find_by_call_connection("conn-9")
            .await
            .unwrap()
            .unwrap();
        // still exactly one pending session for the connection
        assert_eq!(first.status, SessionStatus::Pending);
        assert!(state.store.find_awaiting_socket().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn malformed_and_unknown_events_are_acknowledged() {
        let (state, _dir) = webhook_state().await;
        let Json(body) = incoming_call_webhook(
            State(state.clone()),
            Json(vec![
                WebhookEvent {
                    event_type: "Microsoft.Communication.CallDisconnected".into(),
                    data: json!({}),
                },
                WebhookEvent {
                    event_type: "Microsoft.Communication.IncomingCall".into(),
                    data: json!({"nonsense": true}),
                },
            ]),
        )
        .await;
        assert_eq!(body, json!({}));
        assert!(state.store.find_awaiting_socket().await.unwrap().is_none());
    }
}
