use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::SwitchboardError;
use crate::session::{Session, SessionStatus};
use crate::store::SessionStore;

/// How often the orchestrator re-reads the store while waiting for the
/// other half of a call to arrive. The store is the only state shared with
/// the webhook path, so activation is observed, not signalled.
const ACTIVATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Resolves the two identity-less event streams of a call into exactly one
/// session: the call-control webhook (carries telephony identity, no socket)
/// and the WebSocket open (carries a socket, no identity). Whichever arrives
/// first creates a pending session; the other merges into it. Order is not
/// guaranteed and webhooks are delivered at least once.
pub struct EventCorrelator {
    store: Arc<dyn SessionStore>,
    window: Duration,
}

impl EventCorrelator {
    pub fn new(store: Arc<dyn SessionStore>, window: Duration) -> Self {
        Self { store, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// A WebSocket opened with no identity payload. Merge it into the
    /// oldest session still waiting for its socket, or start a fresh
    /// pending session the webhook can complete later.
    pub async fn socket_opened(&self) -> Result<Session, SwitchboardError> {
        if let Some(waiting) = self.store.find_awaiting_socket().await? {
            match self
                .store
                .update(waiting.id, &|s| {
                    s.attach_socket()?;
                    s.activate_if_correlated();
                    Ok(())
                })
                .await
            {
                Ok(session) => {
                    info!(session = %session.id, "socket merged into webhook-first session");
                    return Ok(session);
                }
                // lost the race to another socket or the sweeper; start fresh
                Err(SwitchboardError::InvariantViolation(_))
                | Err(SwitchboardError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut session = Session::new(Uuid::new_v4());
        session.attach_socket()?;
        self.store.create(&session).await?;
        info!(session = %session.id, "socket-first session created, awaiting webhook");
        Ok(session)
    }

    /// An `IncomingCall` webhook event arrived. Idempotent for redelivery:
    /// a session already holding this `call_connection_id` is returned
    /// untouched.
    pub async fn incoming_call(
        &self,
        call_connection_id: &str,
        phone_number: &str,
        service_number: &str,
    ) -> Result<Session, SwitchboardError> {
        if let Some(existing) = self
            .store
            .find_by_call_connection(call_connection_id)
            .await?
        {
            info!(session = %existing.id, call_connection_id, "duplicate webhook delivery ignored");
            return Ok(existing);
        }

        if let Some(waiting) = self.store.find_awaiting_identity().await? {
            match self
                .store
                .update(waiting.id, &|s| {
                    s.merge_identity(call_connection_id, phone_number, service_number)?;
                    s.activate_if_correlated();
                    Ok(())
                })
                .await
            {
                Ok(session) => {
                    info!(session = %session.id, call_connection_id, "webhook merged into socket-first session");
                    return Ok(session);
                }
                Err(SwitchboardError::InvariantViolation(_))
                | Err(SwitchboardError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut session = Session::new(Uuid::new_v4());
        session.merge_identity(call_connection_id, phone_number, service_number)?;
        if self.store.create(&session).await? {
            info!(session = %session.id, call_connection_id, "webhook-first session created, awaiting socket");
            return Ok(session);
        }
        // a concurrent delivery of the same event won the insert
        self.store
            .find_by_call_connection(call_connection_id)
            .await?
            .ok_or_else(|| {
                SwitchboardError::StoreUnavailable(format!(
                    "session for call connection {call_connection_id} vanished during create race"
                ))
            })
    }

    /// Block until the session is fully correlated (`Active`), bounded by
    /// the correlation window. Used by the socket task after
    /// `socket_opened`; expiry is a reported discard, not a retry.
    pub async fn wait_for_activation(&self, id: Uuid) -> Result<Session, SwitchboardError> {
        let deadline = tokio::time::Instant::now() + self.window;
        loop {
            let session = self.store.get(id).await?;
            match session.status {
                SessionStatus::Active => return Ok(session),
                SessionStatus::Pending => {}
                // closed under us (sweeper or remote hangup)
                _ => return Err(SwitchboardError::CorrelationTimeout(id)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SwitchboardError::CorrelationTimeout(id));
            }
            tokio::time::sleep(ACTIVATION_POLL_INTERVAL).await;
        }
    }

    /// Discard pending sessions whose correlation window has elapsed.
    /// Returns the discarded ids.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, SwitchboardError> {
        let cutoff = now
            - chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(30));
        let mut swept = Vec::new();
        for session in self.store.stale_pending(cutoff).await? {
            if self.store.delete(session.id).await? {
                warn!(
                    session = %session.id,
                    "{}",
                    SwitchboardError::CorrelationTimeout(session.id)
                );
                swept.push(session.id);
            }
        }
        Ok(swept)
    }
}

/// Periodic correlation-window sweep; runs for the life of the process.
pub async fn run_sweeper(correlator: Arc<EventCorrelator>) {
    let interval = (correlator.window() / 2).max(Duration::from_secs(1));
    info!(interval_secs = interval.as_secs(), "starting pending-session sweeper");
    loop {
        tokio::time::sleep(interval).await;
        match correlator.sweep_stale(Utc::now()).await {
            Ok(swept) if !swept.is_empty() => {
                info!(count = swept.len(), "discarded uncorrelated sessions");
            }
            Ok(_) => {}
            Err(e) => warn!("pending-session sweep failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::temp_store;

    async fn correlator() -> (EventCorrelator, tempfile::TempDir, Arc<dyn SessionStore>) {
        let (store, dir) = temp_store().await;
        let store: Arc<dyn SessionStore> = Arc::new(store);
        (
            EventCorrelator::new(store.clone(), Duration::from_secs(30)),
            dir,
            store,
        )
    }

    #[tokio::test]
    async fn webhook_then_socket_converges_to_one_active_session() {
        let (corr, _dir, store) = correlator().await;

        let s1 = corr
            .incoming_call("conn-1", "+15550001111", "+15559990000")
            .await
            .unwrap();
        assert_eq!(s1.status, SessionStatus::Pending);

        let s2 = corr.socket_opened().await.unwrap();
        assert_eq!(s2.id, s1.id);
        assert_eq!(s2.status, SessionStatus::Active);
        assert_eq!(s2.call_connection_id.as_deref(), Some("conn-1"));
        assert_eq!(s2.phone_number.as_deref(), Some("+15550001111"));

        let got = store.get(s1.id).await.unwrap();
        assert_eq!(got.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn socket_then_webhook_converges_to_one_active_session() {
        let (corr, _dir, store) = correlator().await;

        let s1 = corr.socket_opened().await.unwrap();
        assert_eq!(s1.status, SessionStatus::Pending);
        assert!(s1.socket_attached);

        let s2 = corr
            .incoming_call("conn-1", "+15550001111", "+15559990000")
            .await
            .unwrap();
        assert_eq!(s2.id, s1.id);
        assert_eq!(s2.status, SessionStatus::Active);

        let got = store.get(s1.id).await.unwrap();
        assert_eq!(got.status, SessionStatus::Active);
        assert_eq!(got.service_number.as_deref(), Some("+15559990000"));
    }

    #[tokio::test]
    async fn duplicate_webhook_never_creates_a_second_session() {
        let (corr, _dir, _store) = correlator().await;

        let first = corr
            .incoming_call("conn-1", "+15550001111", "+15559990000")
            .await
            .unwrap();
        let second = corr
            .incoming_call("conn-1", "+15550001111", "+15559990000")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        // also after activation
        corr.socket_opened().await.unwrap();
        let third = corr
            .incoming_call("conn-1", "+15550001111", "+15559990000")
            .await
            .unwrap();
        assert_eq!(third.id, first.id);
        assert_eq!(third.status, SessionStatus::Active);
        assert_eq!(third.call_connection_id.as_deref(), Some("conn-1"));
    }

    #[tokio::test]
    async fn distinct_calls_get_distinct_sessions() {
        let (corr, _dir, _store) = correlator().await;

        let a = corr
            .incoming_call("conn-1", "+15550001111", "+15559990000")
            .await
            .unwrap();
        let b = corr
            .incoming_call("conn-2", "+15550002222", "+15559990000")
            .await
            .unwrap();
        assert_ne!(a.id, b.id);

        // sockets claim the oldest waiting session first
        let s1 = corr.socket_opened().await.unwrap();
        let s2 = corr.socket_opened().await.unwrap();
        assert_eq!(s1.id, a.id);
        assert_eq!(s2.id, b.id);
    }

    #[tokio::test]
    async fn sweep_discards_only_expired_pending_sessions() {
        let (store, _dir) = temp_store().await;
        let store: Arc<dyn SessionStore> = Arc::new(store);
        let corr = EventCorrelator::new(store.clone(), Duration::from_secs(0));

        let pending = corr
            .incoming_call("conn-1", "+15550001111", "+15559990000")
            .await
            .unwrap();

        let corr_active = EventCorrelator::new(store.clone(), Duration::from_secs(0));
        let active = corr_active.socket_opened().await.unwrap();
        assert_eq!(active.id, pending.id);

        let orphan = corr.socket_opened().await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let swept = corr.sweep_stale(Utc::now()).await.unwrap();
        assert_eq!(swept, vec![orphan.id]);

        assert!(store.get(active.id).await.is_ok());
        assert!(matches!(
            store.get(orphan.id).await,
            Err(SwitchboardError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn late_webhook_after_discard_starts_over() {
        let (store, _dir) = temp_store().await;
        let store: Arc<dyn SessionStore> = Arc::new(store);
        let corr = EventCorrelator::new(store.clone(), Duration::from_secs(0));

        let first = corr.socket_opened().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        corr.sweep_stale(Utc::now()).await.unwrap();

        let replay = corr
            .incoming_call("conn-1", "+15550001111", "+15559990000")
            .await
            .unwrap();
        assert_ne!(replay.id, first.id);
        assert_eq!(replay.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn wait_for_activation_observes_late_webhook() {
        let (store, _dir) = temp_store().await;
        let store: Arc<dyn SessionStore> = Arc::new(store);
        let corr = Arc::new(EventCorrelator::new(store.clone(), Duration::from_secs(5)));

        let session = corr.socket_opened().await.unwrap();

        let corr2 = corr.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            corr2
                .incoming_call("conn-1", "+15550001111", "+15559990000")
                .await
                .unwrap();
        });

        let active = corr.wait_for_activation(session.id).await.unwrap();
        assert_eq!(active.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn wait_for_activation_times_out_without_webhook() {
        let (store, _dir) = temp_store().await;
        let store: Arc<dyn SessionStore> = Arc::new(store);
        let corr = EventCorrelator::new(store, Duration::from_millis(200));

        let session = corr.socket_opened().await.unwrap();
        let err = corr.wait_for_activation(session.id).await.unwrap_err();
        assert!(matches!(err, SwitchboardError::CorrelationTimeout(_)));
    }
}
