//! In-process assignment store.
//!
//! Each session sits behind its own mutex, so operations on one session are
//! serialized and sessions never contend with each other. Nothing is held
//! across an await point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::{AssignmentStore, Clock, EVENT_BUFFER, EventStream, SystemClock};
use crate::asset::PageAsset;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::*;
use crate::telemetry::metrics;

struct SessionState {
    session: Session,
    /// Index `n - 1` holds page `n`.
    pages: Vec<Page>,
}

impl SessionState {
    fn seed(session: Session) -> Self {
        let pages = PageNumber::all()
            .map(|n| Page::available(session.id, n))
            .collect();
        Self { session, pages }
    }

    fn page_mut(&mut self, page_number: PageNumber) -> &mut Page {
        &mut self.pages[usize::from(page_number.get()) - 1]
    }

    fn completed_count(&self) -> u32 {
        self.pages
            .iter()
            .filter(|p| p.status == PageStatus::Completed)
            .count() as u32
    }
}

/// In-memory store backed by plain maps.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<SessionState>>>>,
    catalog: RwLock<HashMap<PageNumber, PageAsset>>,
    events: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            clock,
            sessions: RwLock::new(HashMap::new()),
            catalog: RwLock::new(HashMap::new()),
            events,
            seq: AtomicU64::new(0),
        }
    }

    /// Register where a page's content lives.
    pub fn insert_asset(&self, asset: PageAsset) -> Result<()> {
        self.catalog
            .write()
            .map_err(|_| poisoned())?
            .insert(asset.page_number, asset);
        Ok(())
    }

    fn session(&self, session_id: SessionId) -> Result<Arc<Mutex<SessionState>>> {
        self.sessions
            .read()
            .map_err(|_| poisoned())?
            .get(&session_id)
            .cloned()
            .ok_or(Error::SessionNotFound(session_id))
    }

    fn emit(&self, session_id: SessionId, kind: EventKind) {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: self.clock.now(),
            session_id,
            kind,
        };
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Reset a lapsed lease. Caller has checked it is assigned.
    fn release(&self, page: &mut Page) {
        page.status = PageStatus::Available;
        page.holder = None;
        page.assigned_at = None;
        page.lease_token = None;
        self.emit(
            page.session_id,
            EventKind::PageReleased {
                page_number: page.page_number,
            },
        );
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> Error {
    Error::Other("memory store lock poisoned".to_string())
}

fn lock(state: &Mutex<SessionState>) -> Result<MutexGuard<'_, SessionState>> {
    state.lock().map_err(|_| poisoned())
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn create_session(&self) -> Result<SessionId> {
        let session = Session::new(SessionId::new(), self.clock.now());
        let id = session.id;

        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        for other in sessions.values() {
            lock(other)?.session.active = false;
        }
        sessions.insert(id, Arc::new(Mutex::new(SessionState::seed(session))));
        drop(sessions);

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
        let state = self.session(session_id)?;
        let mut state = lock(&state)?;
        let now = self.clock.now();

        // The caller's own lapsed leases go back to the pool first, so they
        // are neither resumed nor counted against the cap.
        for page in state.pages.iter_mut() {
            if page.holder.as_ref() == Some(participant) && page.lease_expired(now, ttl) {
                debug!(session_id = %session_id, page = %page.page_number, "surrendering lapsed lease");
                self.release(page);
            }
        }

        let mut assigned: Vec<ClaimRow> = Vec::new();
        let mut completed: Vec<ClaimRow> = Vec::new();
        for page in state.pages.iter().filter(|p| p.holder.as_ref() == Some(participant)) {
            match (page.status, &page.lease_token) {
                (PageStatus::Assigned, Some(token)) => {
                    assigned.push(ClaimRow::assigned(page.page_number, token.clone()))
                }
                (PageStatus::Completed, _) => completed.push(ClaimRow::completed(page.page_number)),
                _ => {}
            }
        }
        let resumed = assigned.len();
        let held = (assigned.len() + completed.len()) as u32;

        if held >= limits.max_per_user {
            if assigned.is_empty() {
                let rows = vec![ClaimRow::limit_reached()];
                super::observe_claim(&rows, 0);
                return Ok(rows);
            }
            assigned.extend(completed);
            super::observe_claim(&assigned, resumed);
            return Ok(assigned);
        }

        let mut want = limits.new_pages(held, resumed as u32) as usize;
        for page in state.pages.iter_mut() {
            if want == 0 {
                break;
            }
            if page.status != PageStatus::Available {
                continue;
            }
            let token = LeaseToken::generate();
            page.status = PageStatus::Assigned;
            page.holder = Some(participant.clone());
            page.assigned_at = Some(now);
            page.lease_token = Some(token.clone());
            self.emit(
                session_id,
                EventKind::PageClaimed {
                    page_number: page.page_number,
                    holder: participant.clone(),
                    assigned_at: now,
                },
            );
            assigned.push(ClaimRow::assigned(page.page_number, token));
            want -= 1;
        }

        if assigned.is_empty() {
            let rows = vec![ClaimRow::finished()];
            super::observe_claim(&rows, 0);
            return Ok(rows);
        }

        assigned.sort_by_key(|row| row.page_number);
        assigned.extend(completed);
        super::observe_claim(&assigned, resumed);
        Ok(assigned)
    }

    async fn complete_page(
        &self,
        session_id: SessionId,
        page_number: PageNumber,
        participant: &ParticipantId,
        lease_token: &LeaseToken,
    ) -> Result<CompleteResult> {
        let state = self.session(session_id)?;
        let mut state = lock(&state)?;
        let now = self.clock.now();

        let page = state.page_mut(page_number);
        if !page.is_held_by(participant, lease_token) {
            let completed_count = state.completed_count();
            super::observe_completion(CompleteStatus::Rejected);
            return Ok(CompleteResult {
                status: CompleteStatus::Rejected,
                completed_count,
                finished: completed_count >= u32::from(TOTAL_PAGES),
            });
        }

        page.status = PageStatus::Completed;
        page.completed_at = Some(now);
        page.lease_token = None;
        let holder = page.holder.clone();
        self.emit(
            session_id,
            EventKind::PageCompleted {
                page_number,
                holder,
                completed_at: now,
            },
        );

        let completed_count = state.completed_count();
        let finished = completed_count == u32::from(TOTAL_PAGES);
        state.session.completed_count = completed_count;
        if finished {
            state.session.active = false;
            info!(session_id = %session_id, "hatym finished");
        }

        super::observe_completion(CompleteStatus::Completed);
        Ok(CompleteResult {
            status: CompleteStatus::Completed,
            completed_count,
            finished,
        })
    }

    async fn release_expired_assignments(
        &self,
        session_id: SessionId,
        ttl: chrono::Duration,
    ) -> Result<u64> {
        let state = self.session(session_id)?;
        let mut state = lock(&state)?;
        let now = self.clock.now();

        let mut released = 0u64;
        for page in state.pages.iter_mut() {
            if page.lease_expired(now, ttl) {
                self.release(page);
                released += 1;
            }
        }

        if released > 0 {
            metrics::pages_released().add(released, &[]);
        }
        Ok(released)
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Session> {
        let state = self.session(session_id)?;
        let state = lock(&state)?;
        Ok(state.session.clone())
    }

    async fn latest_active_session(&self) -> Result<Option<Session>> {
        let sessions = self.sessions.read().map_err(|_| poisoned())?;
        let mut latest: Option<Session> = None;
        for state in sessions.values() {
            let session = lock(state)?.session.clone();
            if session.active && latest.as_ref().is_none_or(|l| session.created_at > l.created_at) {
                latest = Some(session);
            }
        }
        Ok(latest)
    }

    async fn get_page(&self, session_id: SessionId, page_number: PageNumber) -> Result<Page> {
        let state = self.session(session_id)?;
        let mut state = lock(&state)?;
        Ok(state.page_mut(page_number).clone())
    }

    async fn list_pages(&self, session_id: SessionId) -> Result<Vec<PageView>> {
        let state = self.session(session_id)?;
        let state = lock(&state)?;
        Ok(state.pages.iter().map(Page::view).collect())
    }

    async fn page_asset(&self, page_number: PageNumber) -> Result<Option<PageAsset>> {
        Ok(self
            .catalog
            .read()
            .map_err(|_| poisoned())?
            .get(&page_number)
            .cloned())
    }

    async fn subscribe(&self, session_id: SessionId) -> Result<EventStream> {
        // Unknown sessions fail here rather than yielding a silent stream.
        self.session(session_id)?;

        let mut rx = self.events.subscribe();
        let (tx, stream) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = tx.closed() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) if event.session_id == session_id => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(session_id = %session_id, missed, "change stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_stream_stops_forwarding_without_further_events() {
        let store = MemoryStore::new();
        let session_id = store.create_session().await.unwrap();

        let stream = store.subscribe(session_id).await.unwrap();
        assert_eq!(store.events.receiver_count(), 1);
        drop(stream);

        // Nothing is emitted, so only the closed stream can end the task.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while store.events.receiver_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
