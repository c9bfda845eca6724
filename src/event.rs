//! Structured events emitted by the store on every page transition.
//!
//! The dashboard subscribes to this stream to keep its mirror current
//! without refetching. Events carry no lease tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{PageNumber, PageStatus, ParticipantId, SessionId};

/// A structured event emitted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Store-wide sequence number, increasing in commit order.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    PageClaimed {
        page_number: PageNumber,
        holder: ParticipantId,
        assigned_at: DateTime<Utc>,
    },
    PageCompleted {
        page_number: PageNumber,
        holder: Option<ParticipantId>,
        completed_at: DateTime<Utc>,
    },
    PageReleased {
        page_number: PageNumber,
    },
}

impl EventKind {
    pub fn page_number(&self) -> PageNumber {
        match self {
            EventKind::PageClaimed { page_number, .. }
            | EventKind::PageCompleted { page_number, .. }
            | EventKind::PageReleased { page_number } => *page_number,
        }
    }

    /// Status the page has after this event.
    pub fn status(&self) -> PageStatus {
        match self {
            EventKind::PageClaimed { .. } => PageStatus::Assigned,
            EventKind::PageCompleted { .. } => PageStatus::Completed,
            EventKind::PageReleased { .. } => PageStatus::Available,
        }
    }
}
