//! Assignment protocol over Postgres: claim, complete, release, reads.

use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, info};
use uuid::Uuid;

use crate::asset::PageAsset;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{self, AssignmentStore, EventStream};
use crate::telemetry::metrics;

/// `make_interval` takes fractional seconds.
fn ttl_secs(ttl: chrono::Duration) -> f64 {
    ttl.num_milliseconds() as f64 / 1000.0
}

fn record_duration(operation: &'static str, started: Instant) {
    metrics::operation_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[KeyValue::new("operation", operation)],
    );
}

impl super::PgStore {
    /// Insert or replace a catalog entry.
    pub async fn upsert_page_asset(&self, asset: &PageAsset) -> Result<()> {
        sqlx::query(
            "INSERT INTO quran_pages (page_number, mushaf_url, render_type)
             VALUES ($1, $2, $3)
             ON CONFLICT (page_number) DO UPDATE
             SET mushaf_url = EXCLUDED.mushaf_url, render_type = EXCLUDED.render_type",
        )
        .bind(asset.page_number.get() as i16)
        .bind(&asset.asset_url)
        .bind(&asset.render_type)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn completed_count(&self, session_id: SessionId) -> Result<u32> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT completed_count FROM hatym_sessions WHERE id = $1")
                .bind(session_id.0)
                .fetch_optional(self.pool())
                .await?;
        row.map(|(n,)| n as u32)
            .ok_or(Error::SessionNotFound(session_id))
    }
}

#[async_trait]
impl AssignmentStore for super::PgStore {
    async fn create_session(&self) -> Result<SessionId> {
        let id = SessionId::new();
        let mut tx = self.pool().begin().await?;

        sqlx::query("UPDATE hatym_sessions SET active = FALSE WHERE active")
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO hatym_sessions (id, total_pages) VALUES ($1, $2)")
            .bind(id.0)
            .bind(TOTAL_PAGES as i16)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO hatym_pages (session_id, page_number)
             SELECT $1, n FROM generate_series(1, $2::int) AS n",
        )
        .bind(id.0)
        .bind(i32::from(TOTAL_PAGES))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        metrics::sessions_created().add(1, &[]);
        info!(session_id = %id, pages = TOTAL_PAGES, "session created");
        Ok(id)
    }

    async fn claim_pages(
        &self,
        session_id: SessionId,
        participant: &ParticipantId,
        ttl: chrono::Duration,
        limits: ClaimLimits,
    ) -> Result<Vec<ClaimRow>> {
        let started = Instant::now();
        let mut tx = self.pool().begin().await?;

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM hatym_sessions WHERE id = $1")
            .bind(session_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(Error::SessionNotFound(session_id));
        }

        // One claim at a time per participant and session, so two devices
        // sharing an id cannot both pass the cap check.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{session_id}:{participant}"))
            .execute(&mut *tx)
            .await?;

        // The caller's own lapsed leases go back to the pool first.
        let surrendered = sqlx::query(
            "UPDATE hatym_pages
             SET status = 'available', assigned_to = NULL, assigned_at = NULL, claim_token = NULL
             WHERE session_id = $1 AND assigned_to = $2 AND status = 'assigned'
               AND assigned_at < now() - make_interval(secs => $3)",
        )
        .bind(session_id.0)
        .bind(participant.as_str())
        .bind(ttl_secs(ttl))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if surrendered > 0 {
            debug!(session_id = %session_id, surrendered, "surrendered lapsed leases");
        }

        let held: Vec<(i16, String, Option<String>)> = sqlx::query_as(
            "SELECT page_number, status, claim_token FROM hatym_pages
             WHERE session_id = $1 AND assigned_to = $2 AND status IN ('assigned', 'completed')
             ORDER BY page_number
             FOR UPDATE",
        )
        .bind(session_id.0)
        .bind(participant.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut assigned = Vec::new();
        let mut completed = Vec::new();
        for (page_number, status, token) in held {
            let page_number = PageNumber::new(i64::from(page_number))?;
            match status.parse()? {
                PageStatus::Assigned => {
                    let token = token.ok_or_else(|| {
                        Error::Invariant(format!("assigned page {page_number} has no token"))
                    })?;
                    assigned.push(ClaimRow::assigned(page_number, LeaseToken::from_string(token)));
                }
                PageStatus::Completed => completed.push(ClaimRow::completed(page_number)),
                PageStatus::Available => {}
            }
        }
        let resumed = assigned.len();
        let held_count = (assigned.len() + completed.len()) as u32;

        let want = limits.new_pages(held_count, resumed as u32);

        let rows = if held_count >= limits.max_per_user {
            if assigned.is_empty() {
                vec![ClaimRow::limit_reached()]
            } else {
                assigned.extend(completed);
                assigned
            }
        } else if want == 0 && !assigned.is_empty() {
            assigned.extend(completed);
            assigned
        } else {
            let fresh: Vec<(i16, String)> = sqlx::query_as(
                "WITH picked AS (
                     SELECT page_number FROM hatym_pages
                     WHERE session_id = $1 AND status = 'available'
                     ORDER BY page_number
                     LIMIT $3
                     FOR UPDATE SKIP LOCKED
                 )
                 UPDATE hatym_pages p
                 SET status = 'assigned', assigned_to = $2, assigned_at = now(),
                     claim_token = replace(gen_random_uuid()::text, '-', '')
                 FROM picked
                 WHERE p.session_id = $1 AND p.page_number = picked.page_number
                 RETURNING p.page_number, p.claim_token",
            )
            .bind(session_id.0)
            .bind(participant.as_str())
            .bind(i64::from(want))
            .fetch_all(&mut *tx)
            .await?;

            for (page_number, token) in fresh {
                let page_number = PageNumber::new(i64::from(page_number))?;
                assigned.push(ClaimRow::assigned(page_number, LeaseToken::from_string(token)));
            }

            if assigned.is_empty() {
                vec![ClaimRow::finished()]
            } else {
                assigned.sort_by_key(|row| row.page_number);
                assigned.extend(completed);
                assigned
            }
        };

        tx.commit().await?;

        store::observe_claim(&rows, resumed);
        record_duration("claim", started);
        Ok(rows)
    }

    async fn complete_page(
        &self,
        session_id: SessionId,
        page_number: PageNumber,
        participant: &ParticipantId,
        lease_token: &LeaseToken,
    ) -> Result<CompleteResult> {
        let started = Instant::now();
        let mut tx = self.pool().begin().await?;

        let updated = sqlx::query(
            "UPDATE hatym_pages
             SET status = 'completed', completed_at = now(), claim_token = NULL
             WHERE session_id = $1 AND page_number = $2 AND status = 'assigned'
               AND assigned_to = $3 AND claim_token = $4",
        )
        .bind(session_id.0)
        .bind(page_number.get() as i16)
        .bind(participant.as_str())
        .bind(lease_token.expose())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            let completed_count = self.completed_count(session_id).await?;
            store::observe_completion(CompleteStatus::Rejected);
            record_duration("complete", started);
            return Ok(CompleteResult {
                status: CompleteStatus::Rejected,
                completed_count,
                finished: completed_count >= u32::from(TOTAL_PAGES),
            });
        }

        // Each successful transition bumps the counter exactly once; the
        // session row lock orders concurrent completions.
        let (completed_count, total): (i32, i16) = sqlx::query_as(
            "UPDATE hatym_sessions
             SET completed_count = completed_count + 1,
                 active = active AND completed_count + 1 < total_pages
             WHERE id = $1
             RETURNING completed_count, total_pages",
        )
        .bind(session_id.0)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let finished = completed_count >= i32::from(total);
        if finished {
            info!(session_id = %session_id, "hatym finished");
        }
        store::observe_completion(CompleteStatus::Completed);
        record_duration("complete", started);
        Ok(CompleteResult {
            status: CompleteStatus::Completed,
            completed_count: completed_count as u32,
            finished,
        })
    }

    async fn release_expired_assignments(
        &self,
        session_id: SessionId,
        ttl: chrono::Duration,
    ) -> Result<u64> {
        let started = Instant::now();
        let released = sqlx::query(
            "UPDATE hatym_pages
             SET status = 'available', assigned_to = NULL, assigned_at = NULL, claim_token = NULL
             WHERE session_id = $1 AND status = 'assigned'
               AND assigned_at < now() - make_interval(secs => $2)",
        )
        .bind(session_id.0)
        .bind(ttl_secs(ttl))
        .execute(self.pool())
        .await?
        .rows_affected();

        if released > 0 {
            metrics::pages_released().add(released, &[]);
        }
        record_duration("release_expired", started);
        Ok(released)
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Session> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, created_at, active, completed_count, total_pages
             FROM hatym_sessions WHERE id = $1",
        )
        .bind(session_id.0)
        .fetch_optional(self.pool())
        .await?;

        row.map(Session::from)
            .ok_or(Error::SessionNotFound(session_id))
    }

    async fn latest_active_session(&self) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(
            "SELECT id, created_at, active, completed_count, total_pages
             FROM hatym_sessions WHERE active
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(Session::from))
    }

    async fn get_page(&self, session_id: SessionId, page_number: PageNumber) -> Result<Page> {
        let row: Option<PageRow> = sqlx::query_as(
            "SELECT session_id, page_number, status, assigned_to, assigned_at, completed_at, claim_token
             FROM hatym_pages WHERE session_id = $1 AND page_number = $2",
        )
        .bind(session_id.0)
        .bind(page_number.get() as i16)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or(Error::SessionNotFound(session_id))?
            .try_into_page()
    }

    async fn list_pages(&self, session_id: SessionId) -> Result<Vec<PageView>> {
        let rows: Vec<PageRow> = sqlx::query_as(
            "SELECT session_id, page_number, status, assigned_to, assigned_at, completed_at,
                    NULL::text AS claim_token
             FROM hatym_pages WHERE session_id = $1
             ORDER BY page_number",
        )
        .bind(session_id.0)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|row| row.try_into_view())
            .collect()
    }

    async fn page_asset(&self, page_number: PageNumber) -> Result<Option<PageAsset>> {
        let row: Option<(i16, String, String)> = sqlx::query_as(
            "SELECT page_number, mushaf_url, render_type FROM quran_pages WHERE page_number = $1",
        )
        .bind(page_number.get() as i16)
        .fetch_optional(self.pool())
        .await?;

        row.map(|(n, asset_url, render_type)| {
            Ok(PageAsset {
                page_number: PageNumber::new(i64::from(n))?,
                asset_url,
                render_type,
            })
        })
        .transpose()
    }

    async fn subscribe(&self, session_id: SessionId) -> Result<EventStream> {
        self.get_session(session_id).await?;
        super::feed::listen(self.pool(), session_id).await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    created_at: chrono::DateTime<chrono::Utc>,
    active: bool,
    completed_count: i32,
    total_pages: i16,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self {
            id: SessionId(row.id),
            created_at: row.created_at,
            active: row.active,
            completed_count: row.completed_count as u32,
            total_pages: row.total_pages as u16,
        }
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct PageRow {
    session_id: Uuid,
    page_number: i16,
    status: String,
    assigned_to: Option<String>,
    assigned_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    claim_token: Option<String>,
}

impl PageRow {
    fn try_into_page(self) -> Result<Page> {
        Ok(Page {
            session_id: SessionId(self.session_id),
            page_number: PageNumber::new(i64::from(self.page_number))?,
            status: self.status.parse()?,
            holder: self.assigned_to.map(ParticipantId::new).transpose()?,
            assigned_at: self.assigned_at,
            completed_at: self.completed_at,
            lease_token: self.claim_token.map(LeaseToken::from_string),
        })
    }

    fn try_into_view(self) -> Result<PageView> {
        Ok(self.try_into_page()?.view())
    }
}
