//! Participants, lease tokens, and the rows the claim/complete operations return.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::page::PageNumber;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// Anonymous, device-scoped participant identifier. Opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::Other("participant id must not be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Fresh random identifier for a new device.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Lease token
// ---------------------------------------------------------------------------

/// Bearer capability for completing one claimed page.
///
/// Debug output is redacted so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    /// 122 random bits from a v4 UUID, hex without dashes.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LeaseToken([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Claim rows
// ---------------------------------------------------------------------------

/// Per-row status returned by a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    /// Leased to the caller; the row carries page and token.
    Assigned,
    /// Already completed by the caller in this session.
    Completed,
    /// Caller is at the per-participant cap with nothing left to resume.
    LimitReached,
    /// No page left to hand out and the caller holds none.
    Finished,
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClaimStatus::Assigned => "assigned",
            ClaimStatus::Completed => "completed",
            ClaimStatus::LimitReached => "limit_reached",
            ClaimStatus::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// One row of a claim result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRow {
    pub page_number: Option<PageNumber>,
    pub lease_token: Option<LeaseToken>,
    pub status: ClaimStatus,
}

impl ClaimRow {
    pub fn assigned(page_number: PageNumber, lease_token: LeaseToken) -> Self {
        Self {
            page_number: Some(page_number),
            lease_token: Some(lease_token),
            status: ClaimStatus::Assigned,
        }
    }

    pub fn completed(page_number: PageNumber) -> Self {
        Self {
            page_number: Some(page_number),
            lease_token: None,
            status: ClaimStatus::Completed,
        }
    }

    pub fn limit_reached() -> Self {
        Self {
            page_number: None,
            lease_token: None,
            status: ClaimStatus::LimitReached,
        }
    }

    pub fn finished() -> Self {
        Self {
            page_number: None,
            lease_token: None,
            status: ClaimStatus::Finished,
        }
    }
}

/// Bounds for one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimLimits {
    /// Cap on assigned plus completed pages over the whole session.
    pub max_per_user: u32,
    /// Cap on leases held at the same time.
    pub max_live: u32,
}

impl ClaimLimits {
    /// Take as many pages as the cap allows.
    pub fn per_user(max_per_user: u32) -> Self {
        Self {
            max_per_user,
            max_live: max_per_user,
        }
    }

    /// Read one page at a time within the session cap.
    pub fn one_at_a_time(max_per_user: u32) -> Self {
        Self {
            max_per_user,
            max_live: 1,
        }
    }

    /// New pages to hand out to someone holding `live` leases and `held`
    /// pages in total.
    pub fn new_pages(&self, held: u32, live: u32) -> u32 {
        self.max_per_user
            .saturating_sub(held)
            .min(self.max_live.saturating_sub(live))
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteStatus {
    Completed,
    Rejected,
}

/// Outcome of a completion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteResult {
    pub status: CompleteStatus,
    /// Completed pages in the session after this call.
    pub completed_count: u32,
    /// This session has every page completed.
    pub finished: bool,
}

impl CompleteResult {
    pub fn is_completed(&self) -> bool {
        self.status == CompleteStatus::Completed
    }
}
