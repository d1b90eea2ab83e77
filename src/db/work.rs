//! Work item operations on SQLite: submit with dedup, atomic claim,
//! claim-conditional recording, stale reclaim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::claim::ClaimStrategy;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::*;

const COLUMNS: &str = "seq, id, queue, dedup_key, payload, priority, status, failure_kind, attempts, max_attempts, claim_token, claimed_at, available_at, created_at, updated_at, completed_at, last_error, output";

#[async_trait]
impl WorkStore for super::Db {
    async fn submit(&self, new: NewWorkItem) -> Result<SubmitResult> {
        let item = new.into_item(Utc::now());

        // The unique index on (queue, dedup_key) makes a duplicate insert a no-op.
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO work_items (id, queue, dedup_key, payload, priority, status, attempts, max_attempts, available_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)",
        )
        .bind(item.id.0.to_string())
        .bind(&item.queue)
        .bind(&item.dedup_key)
        .bind(serde_json::to_string(&item.payload)?)
        .bind(item.priority)
        .bind(item.max_attempts.map(i64::from))
        .bind(to_ms(item.available_at))
        .bind(to_ms(item.created_at))
        .bind(to_ms(item.updated_at))
        .execute(self.pool())
        .await?
        .rows_affected();

        if inserted == 0 {
            let existing: String =
                sqlx::query_scalar("SELECT id FROM work_items WHERE queue = ? AND dedup_key = ?")
                    .bind(&item.queue)
                    .bind(&item.dedup_key)
                    .fetch_one(self.pool())
                    .await?;
            return Ok(SubmitResult::Duplicate {
                existing: parse_id(&existing)?,
            });
        }

        let created = self.get(item.id).await?;
        Ok(SubmitResult::Created(Box::new(created)))
    }

    async fn get(&self, id: WorkId) -> Result<WorkItem> {
        let sql = format!("SELECT {COLUMNS} FROM work_items WHERE id = ?");
        let row: Option<WorkItemRow> = sqlx::query_as(&sql)
            .bind(id.0.to_string())
            .fetch_optional(self.pool())
            .await?;

        row.ok_or_else(|| Error::NotFound(format!("work item {id}")))?
            .try_into_work_item()
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<WorkItem>> {
        let status = query.status.map(StatusName::as_str);
        let sql = format!(
            "SELECT {COLUMNS} FROM work_items
             WHERE (? IS NULL OR status = ?) AND (? IS NULL OR queue = ?)
             ORDER BY seq ASC
             LIMIT ?"
        );
        let rows: Vec<WorkItemRow> = sqlx::query_as(&sql)
            .bind(status)
            .bind(status)
            .bind(&query.queue)
            .bind(&query.queue)
            .bind(query.limit)
            .fetch_all(self.pool())
            .await?;

        rows.into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }

    async fn counts(&self, queue: &str) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM work_items WHERE queue = ? GROUP BY status",
        )
        .bind(queue)
        .fetch_all(self.pool())
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, n as u64);
        }
        Ok(counts)
    }

    async fn artifacts(&self, id: WorkId) -> Result<Vec<Artifact>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT kind, key, data FROM work_artifacts WHERE work_id = ? ORDER BY key ASC",
        )
        .bind(id.0.to_string())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(kind, key, data)| {
                Ok(Artifact {
                    kind,
                    key,
                    data: serde_json::from_str(&data)?,
                })
            })
            .collect()
    }

    async fn claim_next(
        &self,
        strategy: &ClaimStrategy,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let token = Uuid::new_v4();
        let now_ms = to_ms(now);
        let order = match strategy.order {
            ClaimOrder::OldestFirst => "seq ASC",
            ClaimOrder::Priority => "priority DESC, seq ASC",
        };

        // Select and mark in one statement: SQLite serializes writers, so no
        // other claim can observe these rows as pending in between.
        let sql = format!(
            "UPDATE work_items
             SET status = 'claimed', claim_token = ?, claimed_at = ?, attempts = attempts + 1, updated_at = ?
             WHERE id IN (
                 SELECT id FROM work_items
                 WHERE queue = ? AND status = 'pending' AND available_at <= ?{filter}
                 ORDER BY {order}
                 LIMIT ?
             )
             RETURNING {COLUMNS}",
            filter = filter_clause(&strategy.filter),
        );

        let mut query = sqlx::query_as::<_, WorkItemRow>(&sql)
            .bind(token.to_string())
            .bind(now_ms)
            .bind(now_ms)
            .bind(&strategy.queue)
            .bind(now_ms);
        for path in filter_paths(&strategy.filter) {
            query = query.bind(path);
        }
        let mut rows = query
            .bind(i64::from(strategy.limit))
            .fetch_all(self.pool())
            .await?;

        // RETURNING order is unspecified.
        match strategy.order {
            ClaimOrder::OldestFirst => rows.sort_by_key(|row| row.seq),
            ClaimOrder::Priority => rows.sort_by_key(|row| (-row.priority, row.seq)),
        }

        rows.into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }

    async fn record_result(&self, item: &WorkItem, resolution: &Resolution) -> Result<WorkItem> {
        let now_ms = to_ms(Utc::now());
        let status = resolution.status();

        let (completed_at, available_at, last_error, output) = match resolution {
            Resolution::Done { output, .. } => {
                (Some(now_ms), None, None, Some(serde_json::to_string(output)?))
            }
            Resolution::Requeue {
                available_at,
                error,
            } => (None, Some(to_ms(*available_at)), Some(error.clone()), None),
            Resolution::Failed { error, .. } => (Some(now_ms), None, Some(error.clone()), None),
            Resolution::Skipped { reason } => (Some(now_ms), None, Some(reason.clone()), None),
        };

        let mut tx = self.pool().begin().await?;

        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET status = ?, failure_kind = ?, claim_token = NULL, claimed_at = NULL, updated_at = ?,
                 completed_at = COALESCE(?, completed_at), available_at = COALESCE(?, available_at),
                 last_error = ?, output = COALESCE(?, output)
             WHERE id = ? AND status = 'claimed' AND claim_token = ?",
        )
        .bind(status.name().as_str())
        .bind(status.failure_kind().map(FailureKind::as_str))
        .bind(now_ms)
        .bind(completed_at)
        .bind(available_at)
        .bind(last_error)
        .bind(output)
        .bind(item.id.0.to_string())
        .bind(item.claim_token.map(|t| t.to_string()))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Dropping the transaction rolls it back.
            return Err(Error::ClaimLost(item.id));
        }

        if let Resolution::Done { artifacts, .. } = resolution {
            // Delete before insert: stale rows from an earlier partial attempt go away.
            sqlx::query("DELETE FROM work_artifacts WHERE work_id = ?")
                .bind(item.id.0.to_string())
                .execute(&mut *tx)
                .await?;
            for artifact in artifacts {
                sqlx::query(
                    "INSERT OR REPLACE INTO work_artifacts (work_id, kind, key, data, created_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(item.id.0.to_string())
                .bind(&artifact.kind)
                .bind(&artifact.key)
                .bind(serde_json::to_string(&artifact.data)?)
                .bind(now_ms)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        self.get(item.id).await
    }

    async fn release(&self, item: &WorkItem) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE work_items
             SET status = 'pending', claim_token = NULL, claimed_at = NULL,
                 attempts = MAX(attempts - 1, 0), updated_at = ?
             WHERE id = ? AND status = 'claimed' AND claim_token = ?",
        )
        .bind(to_ms(Utc::now()))
        .bind(item.id.0.to_string())
        .bind(item.claim_token.map(|t| t.to_string()))
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::ClaimLost(item.id));
        }
        Ok(())
    }

    async fn touch(&self, item: &WorkItem) -> Result<()> {
        let now = to_ms(Utc::now());
        let rows_affected = sqlx::query(
            "UPDATE work_items SET claimed_at = ?, updated_at = ?
             WHERE id = ? AND status = 'claimed' AND claim_token = ?",
        )
        .bind(now)
        .bind(now)
        .bind(item.id.0.to_string())
        .bind(item.claim_token.map(|t| t.to_string()))
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::ClaimLost(item.id));
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        queue: Option<&str>,
        older_than: DateTime<Utc>,
        default_max_attempts: u32,
    ) -> Result<Reclaimed> {
        let now_ms = to_ms(Utc::now());
        let cutoff = to_ms(older_than);
        let mut tx = self.pool().begin().await?;

        let exhausted = sqlx::query(
            "UPDATE work_items
             SET status = 'failed', failure_kind = 'retries_exhausted', claim_token = NULL,
                 claimed_at = NULL, last_error = 'claim went stale on the final attempt',
                 completed_at = ?, updated_at = ?
             WHERE status = 'claimed' AND claimed_at < ? AND (? IS NULL OR queue = ?)
               AND attempts >= COALESCE(max_attempts, ?)",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(cutoff)
        .bind(queue)
        .bind(queue)
        .bind(i64::from(default_max_attempts))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let requeued = sqlx::query(
            "UPDATE work_items
             SET status = 'pending', claim_token = NULL, claimed_at = NULL,
                 available_at = ?, updated_at = ?
             WHERE status = 'claimed' AND claimed_at < ? AND (? IS NULL OR queue = ?)",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(cutoff)
        .bind(queue)
        .bind(queue)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(Reclaimed {
            requeued,
            exhausted,
        })
    }

    async fn next_available_at(
        &self,
        strategy: &ClaimStrategy,
    ) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT MIN(available_at) FROM work_items
             WHERE queue = ? AND status = 'pending'{}",
            filter_clause(&strategy.filter)
        );
        let mut query = sqlx::query_scalar::<_, Option<i64>>(&sql).bind(&strategy.queue);
        for path in filter_paths(&strategy.filter) {
            query = query.bind(path);
        }
        let earliest = query.fetch_one(self.pool()).await?;
        earliest.map(from_ms).transpose()
    }
}

/// One `json_extract` condition per required payload field.
fn filter_clause(filter: &ClaimFilter) -> String {
    filter
        .required_fields
        .iter()
        .map(|_| " AND json_extract(payload, ?) IS NOT NULL")
        .collect()
}

fn filter_paths(filter: &ClaimFilter) -> Vec<String> {
    filter
        .required_fields
        .iter()
        .map(|field| format!("$.\"{}\"", field.replace('"', "")))
        .collect()
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| Error::Other(format!("bad timestamp: {ms}")))
}

fn parse_id(s: &str) -> Result<WorkId> {
    Uuid::parse_str(s)
        .map(WorkId)
        .map_err(|e| Error::Other(format!("bad work item id {s}: {e}")))
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    seq: i64,
    id: String,
    queue: String,
    dedup_key: Option<String>,
    payload: String,
    priority: i64,
    status: String,
    failure_kind: Option<String>,
    attempts: i64,
    max_attempts: Option<i64>,
    claim_token: Option<String>,
    claimed_at: Option<i64>,
    available_at: i64,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
    last_error: Option<String>,
    output: Option<String>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: parse_id(&self.id)?,
            queue: self.queue,
            dedup_key: self.dedup_key,
            payload: serde_json::from_str(&self.payload)?,
            priority: self.priority as i32,
            status: Status::from_parts(&self.status, self.failure_kind.as_deref())?,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts.map(|n| n as u32),
            claim_token: self
                .claim_token
                .map(|t| Uuid::parse_str(&t))
                .transpose()
                .map_err(|e| Error::Other(format!("bad claim token: {e}")))?,
            claimed_at: self.claimed_at.map(from_ms).transpose()?,
            available_at: from_ms(self.available_at)?,
            created_at: from_ms(self.created_at)?,
            updated_at: from_ms(self.updated_at)?,
            completed_at: self.completed_at.map(from_ms).transpose()?,
            last_error: self.last_error,
            output: self.output.map(|o| serde_json::from_str(&o)).transpose()?,
        })
    }
}
