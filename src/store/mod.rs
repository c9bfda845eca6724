//! The assignment store contract.
//!
//! Every mutating operation is one atomic round trip: it either applies in
//! full or leaves nothing behind. Conflicts serialize per page row; claims
//! and completions on different pages never wait on each other.
//!
//! Two implementations: [`MemoryStore`] (in-process, used by tests and the
//! simulator) and [`PgStore`](crate::db::PgStore) (Postgres).

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::mpsc;

use crate::asset::PageAsset;
use crate::error::Result;
use crate::event::Event;
use crate::model::*;
use crate::telemetry::metrics;

/// Receiving half of a session's change stream.
pub type EventStream = mpsc::Receiver<Event>;

/// Buffer between the store's feed task and a subscriber.
pub(crate) const EVENT_BUFFER: usize = 1024;

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Create a session with every page available. Any previously active
    /// session stops being active.
    async fn create_session(&self) -> Result<SessionId>;

    /// Resume the participant's live leases and claim new pages up to
    /// `max_per_user`, lowest page number first.
    ///
    /// Rows come back as: assigned pages ascending, then pages this
    /// participant already completed. A lone `limit_reached` row means the
    /// cap is used up with nothing left to resume; a lone `finished` row
    /// means there was nothing to hand out.
    async fn claim_next_page(
        &self,
        session_id: SessionId,
        participant: &ParticipantId,
        ttl: chrono::Duration,
        max_per_user: u32,
    ) -> Result<Vec<ClaimRow>> {
        self.claim_pages(
            session_id,
            participant,
            ttl,
            ClaimLimits::per_user(max_per_user),
        )
        .await
    }

    /// [`claim_next_page`](Self::claim_next_page) with a separate bound on
    /// how many leases the participant may hold at once.
    async fn claim_pages(
        &self,
        session_id: SessionId,
        participant: &ParticipantId,
        ttl: chrono::Duration,
        limits: ClaimLimits,
    ) -> Result<Vec<ClaimRow>>;

    /// Complete a page. Only the current holder with the exact current token
    /// succeeds; anything else is `Rejected` and changes nothing.
    async fn complete_page(
        &self,
        session_id: SessionId,
        page_number: PageNumber,
        participant: &ParticipantId,
        lease_token: &LeaseToken,
    ) -> Result<CompleteResult>;

    /// Return every page whose lease is strictly older than `ttl` to the
    /// pool. Returns how many were released.
    async fn release_expired_assignments(
        &self,
        session_id: SessionId,
        ttl: chrono::Duration,
    ) -> Result<u64>;

    async fn get_session(&self, session_id: SessionId) -> Result<Session>;

    /// Newest session that is still active, if any.
    async fn latest_active_session(&self) -> Result<Option<Session>>;

    /// Live state of one page, lease token included.
    async fn get_page(&self, session_id: SessionId, page_number: PageNumber) -> Result<Page>;

    /// All pages of a session, ascending, without tokens.
    async fn list_pages(&self, session_id: SessionId) -> Result<Vec<PageView>>;

    /// Catalog entry describing where a page's content lives.
    async fn page_asset(&self, page_number: PageNumber) -> Result<Option<PageAsset>>;

    /// Subscribe to page transitions of one session.
    ///
    /// Delivery is best-effort: events can be dropped if the subscriber falls
    /// behind or the underlying channel drops. Consumers must resync.
    async fn subscribe(&self, session_id: SessionId) -> Result<EventStream>;
}

/// Count claim rows by outcome. Shared by both store implementations.
pub(crate) fn observe_claim(rows: &[ClaimRow], resumed: usize) {
    let claims = metrics::claims();
    let assigned = rows
        .iter()
        .filter(|r| r.status == ClaimStatus::Assigned)
        .count();
    if assigned > resumed {
        claims.add(
            (assigned - resumed) as u64,
            &[KeyValue::new("result", "assigned")],
        );
    }
    if resumed > 0 {
        claims.add(resumed as u64, &[KeyValue::new("result", "resumed")]);
    }
    for row in rows
        .iter()
        .filter(|r| matches!(r.status, ClaimStatus::LimitReached | ClaimStatus::Finished))
    {
        claims.add(1, &[KeyValue::new("result", row.status.to_string())]);
    }
}

pub(crate) fn observe_completion(status: CompleteStatus) {
    let result = match status {
        CompleteStatus::Completed => "completed",
        CompleteStatus::Rejected => "rejected",
    };
    metrics::completions().add(1, &[KeyValue::new("result", result)]);
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for lease timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
