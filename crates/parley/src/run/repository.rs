//! Run and run-event persistence.
//!
//! The event log is append-only per run: `append_event` bumps the run's
//! cursor and inserts the event row at the new sequence number in one
//! transaction, so sequence numbers are gap-free and never race even with
//! an accidental concurrent writer (e.g. a cancel-path append).

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use super::models::{GenerationRun, NewGenerationRun, RunEvent, RunStatus};

/// All generation run columns for SELECT queries.
const RUN_COLUMNS: &str = r#"
    id, chat_id, user_id, status, model_id, messages, user_message_id,
    assistant_message_id, personalization, cursor, error,
    created_at, started_at, finished_at
"#;

/// Repository for generation runs and their event logs.
#[derive(Debug, Clone)]
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a run in `queued` status with cursor 0.
    pub async fn create(&self, run: NewGenerationRun) -> Result<GenerationRun> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO generation_runs (
                id, chat_id, user_id, status, model_id, messages,
                user_message_id, assistant_message_id, personalization,
                cursor, error, created_at, started_at, finished_at
            ) VALUES (?, ?, ?, 'queued', ?, ?, ?, ?, ?, 0, NULL, ?, NULL, NULL)
            "#,
        )
        .bind(&run.id)
        .bind(&run.chat_id)
        .bind(&run.user_id)
        .bind(&run.model_id)
        .bind(run.messages.to_string())
        .bind(&run.user_message_id)
        .bind(&run.assistant_message_id)
        .bind(run.personalization.to_string())
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("creating generation run")?;

        self.get_required(&run.id).await
    }

    /// Get a run by ID.
    pub async fn get(&self, run_id: &str) -> Result<Option<GenerationRun>> {
        let query = format!("SELECT {} FROM generation_runs WHERE id = ?", RUN_COLUMNS);
        sqlx::query_as::<_, GenerationRun>(&query)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching generation run")
    }

    /// Get a run that must exist.
    pub async fn get_required(&self, run_id: &str) -> Result<GenerationRun> {
        match self.get(run_id).await? {
            Some(run) => Ok(run),
            None => bail!("generation run not found: {}", run_id),
        }
    }

    /// Transition a run's status, stamping `started_at`/`finished_at`.
    ///
    /// Terminal statuses are immutable: the update is a no-op when the row
    /// is already `succeeded`, `failed`, or `canceled`.
    pub async fn set_status(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let started_at = if status == RunStatus::Running {
            Some(now.clone())
        } else {
            None
        };
        let finished_at = if status.is_terminal() {
            Some(now)
        } else {
            None
        };

        sqlx::query(
            r#"
            UPDATE generation_runs
            SET status = ?,
                error = ?,
                started_at = COALESCE(?, started_at),
                finished_at = COALESCE(?, finished_at)
            WHERE id = ?
              AND status NOT IN ('succeeded', 'failed', 'canceled')
            "#,
        )
        .bind(status.to_string())
        .bind(error)
        .bind(started_at)
        .bind(finished_at)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("updating generation run status")?;

        Ok(())
    }

    /// Append an event chunk, assigning the next sequence number.
    ///
    /// The cursor bump and the event insert commit together; a failed insert
    /// rolls the cursor back, so the stored cursor always equals the highest
    /// assigned sequence number.
    pub async fn append_event(&self, run_id: &str, chunk: &str) -> Result<RunEvent> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("beginning append transaction")?;

        let next_seq: i64 = sqlx::query_scalar(
            "UPDATE generation_runs SET cursor = cursor + 1 WHERE id = ? RETURNING cursor",
        )
        .bind(run_id)
        .fetch_optional(&mut *tx)
        .await
        .context("bumping run cursor")?
        .with_context(|| format!("generation run not found: {}", run_id))?;

        sqlx::query(
            "INSERT INTO run_events (run_id, seq, chunk, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(next_seq)
        .bind(chunk)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .context("inserting run event")?;

        tx.commit().await.context("committing run event")?;

        Ok(RunEvent {
            run_id: run_id.to_string(),
            seq: next_seq,
            chunk: chunk.to_string(),
            created_at: now,
        })
    }

    /// All events with sequence > `after_seq`, ascending.
    pub async fn events_after(&self, run_id: &str, after_seq: i64) -> Result<Vec<RunEvent>> {
        sqlx::query_as::<_, RunEvent>(
            r#"
            SELECT run_id, seq, chunk, created_at
            FROM run_events
            WHERE run_id = ? AND seq > ?
            ORDER BY seq ASC
            "#,
        )
        .bind(run_id)
        .bind(after_seq)
        .fetch_all(&self.pool)
        .await
        .context("fetching run events")
    }

    /// Bulk-fail every `queued` or `running` run. Returns the count affected.
    ///
    /// Used only by the startup recovery sweep.
    pub async fn fail_all_active(&self, error_key: &str) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            UPDATE generation_runs
            SET status = 'failed', error = ?, finished_at = ?
            WHERE status IN ('queued', 'running')
            "#,
        )
        .bind(error_key)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("failing active generation runs")?;

        Ok(result.rows_affected())
    }

    /// The most recent active (`queued` or `running`) run for a chat.
    pub async fn active_by_chat(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Option<GenerationRun>> {
        let query = format!(
            r#"
            SELECT {} FROM generation_runs
            WHERE chat_id = ? AND user_id = ? AND status IN ('queued', 'running')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            RUN_COLUMNS
        );
        sqlx::query_as::<_, GenerationRun>(&query)
            .bind(chat_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching active run for chat")
    }

    /// Distinct chat ids with an active run for a user.
    pub async fn active_chat_ids(&self, user_id: &str) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT chat_id FROM generation_runs
            WHERE user_id = ? AND status IN ('queued', 'running')
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("fetching active run chat ids")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_pool;
    use serde_json::json;

    async fn setup() -> RunRepository {
        let pool = open_memory_pool().await.unwrap();
        RunRepository::new(pool)
    }

    fn new_run(id: &str, chat_id: &str) -> NewGenerationRun {
        NewGenerationRun {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            user_id: "user-1".to_string(),
            model_id: "test-model".to_string(),
            messages: json!([{"role": "user", "content": "hi"}]),
            user_message_id: "m-user".to_string(),
            assistant_message_id: "m-assistant".to_string(),
            personalization: json!({}),
        }
    }

    #[tokio::test]
    async fn creates_queued_run_with_zero_cursor() {
        let repo = setup().await;
        let run = repo.create(new_run("r1", "c1")).await.unwrap();
        assert_eq!(run.status(), RunStatus::Queued);
        assert_eq!(run.cursor, 0);
        assert!(run.started_at.is_none());
    }

    #[tokio::test]
    async fn append_assigns_gapless_increasing_sequences() {
        let repo = setup().await;
        repo.create(new_run("r1", "c1")).await.unwrap();

        for expected_seq in 1..=5 {
            let ev = repo
                .append_event("r1", r#"{"type":"text-delta","delta":"x"}"#)
                .await
                .unwrap();
            assert_eq!(ev.seq, expected_seq);
        }

        let run = repo.get_required("r1").await.unwrap();
        assert_eq!(run.cursor, 5);

        let events = repo.events_after("r1", 0).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn concurrent_appends_never_share_a_sequence() {
        let repo = setup().await;
        repo.create(new_run("r1", "c1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.append_event("r1", r#"{"type":"text-delta","delta":"x"}"#)
                    .await
                    .unwrap()
                    .seq
            }));
        }
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=10).collect::<Vec<i64>>());

        let run = repo.get_required("r1").await.unwrap();
        assert_eq!(run.cursor, 10);
    }

    #[tokio::test]
    async fn events_after_cursor_replays_exact_suffix() {
        let repo = setup().await;
        repo.create(new_run("r1", "c1")).await.unwrap();
        for i in 0..5 {
            repo.append_event("r1", &format!(r#"{{"type":"text-delta","delta":"{}"}}"#, i))
                .await
                .unwrap();
        }

        let events = repo.events_after("r1", 2).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].seq, 3);
        assert_eq!(events[2].seq, 5);
    }

    #[tokio::test]
    async fn status_transitions_stamp_timestamps() {
        let repo = setup().await;
        repo.create(new_run("r1", "c1")).await.unwrap();

        repo.set_status("r1", RunStatus::Running, None).await.unwrap();
        let run = repo.get_required("r1").await.unwrap();
        assert_eq!(run.status(), RunStatus::Running);
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_none());

        repo.set_status("r1", RunStatus::Succeeded, None)
            .await
            .unwrap();
        let run = repo.get_required("r1").await.unwrap();
        assert_eq!(run.status(), RunStatus::Succeeded);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn terminal_status_never_regresses() {
        let repo = setup().await;
        repo.create(new_run("r1", "c1")).await.unwrap();
        repo.set_status("r1", RunStatus::Canceled, None)
            .await
            .unwrap();

        repo.set_status("r1", RunStatus::Failed, Some("run.failed"))
            .await
            .unwrap();
        let run = repo.get_required("r1").await.unwrap();
        assert_eq!(run.status(), RunStatus::Canceled);
        assert!(run.error.is_none());
    }

    #[tokio::test]
    async fn fail_all_active_sweeps_queued_and_running() {
        let repo = setup().await;
        repo.create(new_run("r1", "c1")).await.unwrap();
        repo.create(new_run("r2", "c2")).await.unwrap();
        repo.create(new_run("r3", "c3")).await.unwrap();
        repo.set_status("r2", RunStatus::Running, None).await.unwrap();
        repo.set_status("r3", RunStatus::Succeeded, None)
            .await
            .unwrap();

        let count = repo.fail_all_active("run.failed").await.unwrap();
        assert_eq!(count, 2);

        assert_eq!(repo.get_required("r1").await.unwrap().status(), RunStatus::Failed);
        assert_eq!(repo.get_required("r2").await.unwrap().status(), RunStatus::Failed);
        assert_eq!(
            repo.get_required("r3").await.unwrap().status(),
            RunStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn active_lookups() {
        let repo = setup().await;
        repo.create(new_run("r1", "c1")).await.unwrap();
        repo.create(new_run("r2", "c2")).await.unwrap();
        repo.set_status("r2", RunStatus::Succeeded, None)
            .await
            .unwrap();

        let active = repo.active_by_chat("c1", "user-1").await.unwrap();
        assert_eq!(active.unwrap().id, "r1");
        assert!(repo.active_by_chat("c2", "user-1").await.unwrap().is_none());

        let chats = repo.active_chat_ids("user-1").await.unwrap();
        assert_eq!(chats, vec!["c1".to_string()]);
    }
}
