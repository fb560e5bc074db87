use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use crate::error::SwitchboardError;
use crate::session::{Session, SessionStatus, TerminalAction};
use crate::settings::RetryPolicy;

/// Mutation applied under the store's compare-and-set discipline. The
/// closure sees the freshest copy of the session on every attempt; an error
/// aborts the update without writing.
pub type Mutator<'a> = &'a (dyn Fn(&mut Session) -> Result<(), SwitchboardError> + Send + Sync);

/// Shared per-call metadata cache. The only mutable state call-handling
/// tasks share; all writes go through `update` so concurrent mutations from
/// the correlator and the dispatcher never interleave.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Returns `false` when another session already
    /// holds this session's `call_connection_id` (at-least-once webhook
    /// delivery racing itself).
    async fn create(&self, session: &Session) -> Result<bool, SwitchboardError>;

    async fn get(&self, id: Uuid) -> Result<Session, SwitchboardError>;

    /// Atomic read-mutate-write. Retried with bounded backoff on write
    /// contention; the mutator's own error is returned unmodified.
    async fn update(&self, id: Uuid, mutate: Mutator<'_>) -> Result<Session, SwitchboardError>;

    async fn delete(&self, id: Uuid) -> Result<bool, SwitchboardError>;

    async fn find_by_call_connection(
        &self,
        call_connection_id: &str,
    ) -> Result<Option<Session>, SwitchboardError>;

    /// Oldest pending session that has a socket but no telephony identity.
    async fn find_awaiting_identity(&self) -> Result<Option<Session>, SwitchboardError>;

    /// Oldest pending session that has telephony identity but no socket.
    async fn find_awaiting_socket(&self) -> Result<Option<Session>, SwitchboardError>;

    /// Pending sessions created before `cutoff`, candidates for discard.
    async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, SwitchboardError>;
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
    retry: RetryPolicy,
}

impl SqliteSessionStore {
    pub async fn initialize(
        database_url: Option<String>,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, retry })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn fetch_with_revision(
        &self,
        id: Uuid,
    ) -> Result<(Session, i64), SwitchboardError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or(SwitchboardError::NotFound(id))?;
        let revision: i64 = row.get("revision");
        Ok((session_from_row(&row)?, revision))
    }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
            PathBuf::from(home).join(".local").join("share")
        });
    let dir = base.join("switchboard");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("switchboard.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Session, SwitchboardError> {
    let id_str: String = row.get("id");
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| SwitchboardError::StoreUnavailable(format!("corrupt session id: {e}")))?;
    let status_str: String = row.get("status");
    let status = SessionStatus::parse(&status_str).ok_or_else(|| {
        SwitchboardError::InvariantViolation(format!("unknown status {status_str} for {id}"))
    })?;
    let pending_action = row
        .try_get::<Option<String>, _>("pending_action")
        .unwrap_or(None)
        .as_deref()
        .and_then(TerminalAction::parse);
    let socket_attached: i64 = row.get("socket_attached");
    Ok(Session {
        id,
        call_connection_id: row.try_get("call_connection_id").unwrap_or(None),
        phone_number: row.try_get("phone_number").unwrap_or(None),
        service_number: row.try_get("service_number").unwrap_or(None),
        status,
        pending_action,
        socket_attached: socket_attached != 0,
        created_at: parse_timestamp(row.get("created_at")),
        last_updated_at: parse_timestamp(row.get("last_updated_at")),
    })
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("UNIQUE constraint failed"),
        _ => false,
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: &Session) -> Result<bool, SwitchboardError> {
        let res = sqlx::query(
            "INSERT INTO sessions (id, call_connection_id, phone_number, service_number, \
             status, pending_action, socket_attached, created_at, last_updated_at, revision) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
        )
        .bind(session.id.to_string())
        .bind(&session.call_connection_id)
        .bind(&session.phone_number)
        .bind(&session.service_number)
        .bind(session.status.as_str())
        .bind(session.pending_action.map(|a| a.as_str()))
        .bind(session.socket_attached as i64)
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;
        match res {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Session, SwitchboardError> {
        let (session, _) = self.fetch_with_revision(id).await?;
        Ok(session)
    }

    async fn update(&self, id: Uuid, mutate: Mutator<'_>) -> Result<Session, SwitchboardError> {
        for attempt in 1..=self.retry.attempts {
            let (mut session, revision) = self.fetch_with_revision(id).await?;
            mutate(&mut session)?;
            let res = sqlx::query(
                "UPDATE sessions SET call_connection_id = ?1, phone_number = ?2, \
                 service_number = ?3, status = ?4, pending_action = ?5, \
                 socket_attached = ?6, last_updated_at = ?7, revision = revision + 1 \
                 WHERE id = ?8 AND revision = ?9",
            )
            .bind(&session.call_connection_id)
            .bind(&session.phone_number)
            .bind(&session.service_number)
            .bind(session.status.as_str())
            .bind(session.pending_action.map(|a| a.as_str()))
            .bind(session.socket_attached as i64)
            .bind(session.last_updated_at.to_rfc3339())
            .bind(id.to_string())
            .bind(revision)
            .execute(&self.pool)
            .await?;
            if res.rows_affected() > 0 {
                return Ok(session);
            }
            // lost the race: another writer bumped the revision first
            tokio::time::sleep(self.retry.delay_for(attempt)).await;
        }
        Err(SwitchboardError::StoreUnavailable(format!(
            "update contention on session {id} after {} attempts",
            self.retry.attempts
        )))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, SwitchboardError> {
        let res = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn find_by_call_connection(
        &self,
        call_connection_id: &str,
    ) -> Result<Option<Session>, SwitchboardError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE call_connection_id = ?1")
            .bind(call_connection_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    async fn find_awaiting_identity(&self) -> Result<Option<Session>, SwitchboardError> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE status = 'pending' AND socket_attached = 1 \
             AND call_connection_id IS NULL ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    async fn find_awaiting_socket(&self) -> Result<Option<Session>, SwitchboardError> {
        let row = sqlx::query(
            "SELECT * FROM sessions WHERE status = 'pending' AND socket_attached = 0 \
             AND call_connection_id IS NOT NULL ORDER BY created_at ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    async fn stale_pending(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Session>, SwitchboardError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE status = 'pending' AND created_at < ?1 \
             ORDER BY created_at ASC",
        )
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    pub(crate) async fn temp_store() -> (SqliteSessionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let url = format!("sqlite://{}", path.to_string_lossy());
        let store = SqliteSessionStore::initialize(Some(url), RetryPolicy::default())
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn create_get_delete_roundtrip() {
        let (store, _dir) = temp_store().await;
        let session = Session::new(Uuid::new_v4());
        assert!(store.create(&session).await.unwrap());

        let got = store.get(session.id).await.unwrap();
        assert_eq!(got.id, session.id);
        assert_eq!(got.status, SessionStatus::Pending);
        assert!(got.call_connection_id.is_none());

        assert!(store.delete(session.id).await.unwrap());
        assert!(matches!(
            store.get(session.id).await,
            Err(SwitchboardError::NotFound(_))
        ));
        assert!(!store.delete(session.id).await.unwrap());
    }

    #[tokio::test]
    async fn create_rejects_duplicate_call_connection() {
        let (store, _dir) = temp_store().await;
        let mut first = Session::new(Uuid::new_v4());
        first.call_connection_id = Some("conn-9".into());
        assert!(store.create(&first).await.unwrap());

        let mut second = Session::new(Uuid::new_v4());
        second.call_connection_id = Some("conn-9".into());
        assert!(!store.create(&second).await.unwrap());

        let found = store.find_by_call_connection("conn-9").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn update_applies_mutation_atomically() {
        let (store, _dir) = temp_store().await;
        let session = Session::new(Uuid::new_v4());
        store.create(&session).await.unwrap();

        let updated = store
            .update(session.id, &|s| {
                s.attach_socket()?;
                s.merge_identity("conn-1", "+15550001111", "+15559990000")?;
                s.activate_if_correlated();
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Active);

        let got = store.get(session.id).await.unwrap();
        assert_eq!(got.status, SessionStatus::Active);
        assert_eq!(got.call_connection_id.as_deref(), Some("conn-1"));
        assert!(got.socket_attached);
    }

    #[tokio::test]
    async fn mutator_error_aborts_without_writing() {
        let (store, _dir) = temp_store().await;
        let session = Session::new(Uuid::new_v4());
        store.create(&session).await.unwrap();

        let err = store
            .update(session.id, &|s| s.begin_terminal(TerminalAction::EndCall))
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::ActionConflict(_)));

        let got = store.get(session.id).await.unwrap();
        assert_eq!(got.status, SessionStatus::Pending);
        assert!(got.pending_action.is_none());
    }

    #[tokio::test]
    async fn concurrent_terminal_attempts_admit_exactly_one() {
        let (store, _dir) = temp_store().await;
        let mut session = Session::new(Uuid::new_v4());
        session.attach_socket().unwrap();
        session
            .merge_identity("conn-1", "+15550001111", "+15559990000")
            .unwrap();
        session.activate_if_correlated();
        store.create(&session).await.unwrap();

        let store = Arc::new(store);
        let mut handles = Vec::new();
        for action in [TerminalAction::EndCall, TerminalAction::TransferCall] {
            let store = store.clone();
            let id = session.id;
            handles.push(tokio::spawn(async move {
                store.update(id, &move |s| s.begin_terminal(action)).await
            }));
        }

        let mut ok = 0;
        let mut conflicts = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(SwitchboardError::ActionConflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((ok, conflicts), (1, 1));

        let got = store.get(session.id).await.unwrap();
        assert!(matches!(
            got.status,
            SessionStatus::Ending | SessionStatus::Transferring
        ));
        assert!(got.pending_action.is_some());
    }

    #[tokio::test]
    async fn awaiting_queries_pick_oldest_half_correlated() {
        let (store, _dir) = temp_store().await;

        let mut socket_only = Session::new(Uuid::new_v4());
        socket_only.attach_socket().unwrap();
        store.create(&socket_only).await.unwrap();

        let mut identity_only = Session::new(Uuid::new_v4());
        identity_only
            .merge_identity("conn-1", "+15550001111", "+15559990000")
            .unwrap();
        store.create(&identity_only).await.unwrap();

        let found = store.find_awaiting_identity().await.unwrap().unwrap();
        assert_eq!(found.id, socket_only.id);
        let found = store.find_awaiting_socket().await.unwrap().unwrap();
        assert_eq!(found.id, identity_only.id);
    }

    #[tokio::test]
    async fn stale_pending_excludes_active_and_fresh() {
        let (store, _dir) = temp_store().await;

        let stale = Session::new(Uuid::new_v4());
        store.create(&stale).await.unwrap();

        let mut active = Session::new(Uuid::new_v4());
        active.attach_socket().unwrap();
        active
            .merge_identity("conn-1", "+15550001111", "+15559990000")
            .unwrap();
        active.activate_if_correlated();
        store.create(&active).await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let found = store.stale_pending(cutoff).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);

        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        assert!(store.stale_pending(cutoff).await.unwrap().is_empty());
    }
}
