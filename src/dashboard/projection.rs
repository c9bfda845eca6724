//! Local mirror of a session's pages.
//!
//! Fed by two independent inputs: full loads from the store and single-page
//! events from the change feed. Either one alone keeps it correct; the feed
//! only makes it faster.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::{Event, EventKind};
use crate::model::*;

/// Point-in-time aggregate of the mirror.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub session_id: SessionId,
    pub counts: PageCounts,
    pub completion_ratio: f64,
    pub complete: bool,
    pub loaded_pages: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Projection {
    session_id: SessionId,
    pages: BTreeMap<PageNumber, PageView>,
}

impl Projection {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            pages: BTreeMap::new(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Replace the mirror with a full listing.
    pub fn load(&mut self, pages: Vec<PageView>) {
        self.pages = pages.into_iter().map(|p| (p.page_number, p)).collect();
    }

    /// Apply one change event by page number. Returns whether anything changed.
    ///
    /// Events for other sessions, for pages not loaded yet, or that would move
    /// a completed page are ignored.
    pub fn apply(&mut self, event: &Event) -> bool {
        if event.session_id != self.session_id {
            return false;
        }
        let Some(page) = self.pages.get_mut(&event.kind.page_number()) else {
            return false;
        };
        if page.status.is_terminal() {
            return false;
        }

        match &event.kind {
            EventKind::PageClaimed {
                holder,
                assigned_at,
                ..
            } => {
                page.status = PageStatus::Assigned;
                page.holder = Some(holder.clone());
                page.assigned_at = Some(*assigned_at);
            }
            EventKind::PageCompleted {
                holder,
                completed_at,
                ..
            } => {
                page.status = PageStatus::Completed;
                if holder.is_some() {
                    page.holder = holder.clone();
                }
                page.completed_at = Some(*completed_at);
            }
            EventKind::PageReleased { .. } => {
                page.status = PageStatus::Available;
                page.holder = None;
                page.assigned_at = None;
            }
        }
        true
    }

    pub fn page(&self, page_number: PageNumber) -> Option<&PageView> {
        self.pages.get(&page_number)
    }

    pub fn pages(&self) -> impl Iterator<Item = &PageView> {
        self.pages.values()
    }

    pub fn is_loaded(&self) -> bool {
        !self.pages.is_empty()
    }

    pub fn counts(&self) -> PageCounts {
        PageCounts::tally(self.pages.values().map(|p| &p.status))
    }

    pub fn completion_ratio(&self) -> f64 {
        self.counts().completion_ratio()
    }

    /// Every page completed. An empty mirror is never complete.
    pub fn is_complete(&self) -> bool {
        self.is_loaded() && self.counts().completed >= u32::from(TOTAL_PAGES)
    }

    pub fn snapshot(&self) -> Snapshot {
        let counts = self.counts();
        Snapshot {
            session_id: self.session_id,
            counts,
            completion_ratio: counts.completion_ratio(),
            complete: self.is_loaded() && counts.completed >= u32::from(TOTAL_PAGES),
            loaded_pages: self.pages.len(),
            updated_at: Utc::now(),
        }
    }
}
