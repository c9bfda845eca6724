//! Pages: the unit of work inside a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lease::{LeaseToken, ParticipantId};
use super::session::SessionId;
use super::TOTAL_PAGES;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Page number
// ---------------------------------------------------------------------------

/// A page number in `1..=TOTAL_PAGES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u16")]
pub struct PageNumber(u16);

impl PageNumber {
    pub const FIRST: PageNumber = PageNumber(1);
    pub const LAST: PageNumber = PageNumber(TOTAL_PAGES);

    pub fn new(n: i64) -> Result<Self> {
        if (1..=i64::from(TOTAL_PAGES)).contains(&n) {
            Ok(Self(n as u16))
        } else {
            Err(Error::InvalidPage(n))
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }

    /// Every page of a session, ascending.
    pub fn all() -> impl Iterator<Item = PageNumber> {
        (1..=TOTAL_PAGES).map(PageNumber)
    }
}

impl TryFrom<i64> for PageNumber {
    type Error = Error;

    fn try_from(n: i64) -> Result<Self> {
        Self::new(n)
    }
}

impl From<PageNumber> for u16 {
    fn from(page: PageNumber) -> Self {
        page.0
    }
}

impl From<PageNumber> for i32 {
    fn from(page: PageNumber) -> Self {
        i32::from(page.0)
    }
}

impl std::fmt::Display for PageNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0.to_string())
    }
}

impl std::str::FromStr for PageNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let n: i64 = s
            .trim()
            .parse()
            .map_err(|_| Error::Other(format!("not a page number: {s:?}")))?;
        Self::new(n)
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    /// Nobody holds it; next in line for a claim.
    Available,
    /// Leased to one participant until completion or expiry.
    Assigned,
    /// Read. Terminal.
    Completed,
}

impl PageStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: PageStatus) -> bool {
        use PageStatus::*;
        matches!(
            (self, to),
            (Available, Assigned)
                | (Assigned, Completed)
                | (Assigned, Available) // lease expired
        )
    }

    pub fn is_terminal(self) -> bool {
        self == PageStatus::Completed
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PageStatus::Available => "available",
            PageStatus::Assigned => "assigned",
            PageStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for PageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(PageStatus::Available),
            "assigned" => Ok(PageStatus::Assigned),
            "completed" => Ok(PageStatus::Completed),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Page
// ---------------------------------------------------------------------------

/// Full page row as the store keeps it, lease token included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub session_id: SessionId,
    pub page_number: PageNumber,
    pub status: PageStatus,
    /// Current holder while assigned; kept after completion for audit.
    pub holder: Option<ParticipantId>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lease_token: Option<LeaseToken>,
}

impl Page {
    /// A freshly seeded page.
    pub fn available(session_id: SessionId, page_number: PageNumber) -> Self {
        Self {
            session_id,
            page_number,
            status: PageStatus::Available,
            holder: None,
            assigned_at: None,
            completed_at: None,
            lease_token: None,
        }
    }

    /// Is this page leased to `participant` under `token` right now?
    pub fn is_held_by(&self, participant: &ParticipantId, token: &LeaseToken) -> bool {
        self.status == PageStatus::Assigned
            && self.holder.as_ref() == Some(participant)
            && self.lease_token.as_ref() == Some(token)
    }

    /// Has the lease lapsed? Strictly older than `ttl`.
    pub fn lease_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        self.status == PageStatus::Assigned
            && self.assigned_at.is_some_and(|at| at < now - ttl)
    }

    /// Check the per-status field invariants.
    pub fn check_invariants(&self) -> Result<()> {
        let ok = match self.status {
            PageStatus::Available => {
                self.holder.is_none() && self.assigned_at.is_none() && self.lease_token.is_none()
            }
            PageStatus::Assigned => {
                self.holder.is_some() && self.assigned_at.is_some() && self.lease_token.is_some()
            }
            PageStatus::Completed => self.completed_at.is_some() && self.lease_token.is_none(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Invariant(format!(
                "page {} of session {} is {} with inconsistent fields",
                self.page_number, self.session_id, self.status
            )))
        }
    }

    /// Token-free projection of this page.
    pub fn view(&self) -> PageView {
        PageView {
            page_number: self.page_number,
            status: self.status,
            holder: self.holder.clone(),
            assigned_at: self.assigned_at,
            completed_at: self.completed_at,
        }
    }
}

/// What the dashboard sees of a page. Never carries the lease token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageView {
    pub page_number: PageNumber,
    pub status: PageStatus,
    pub holder: Option<ParticipantId>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Aggregate page counts for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCounts {
    pub available: u32,
    pub assigned: u32,
    pub completed: u32,
}

impl PageCounts {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a PageStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.add(*status);
        }
        counts
    }

    pub fn add(&mut self, status: PageStatus) {
        match status {
            PageStatus::Available => self.available += 1,
            PageStatus::Assigned => self.assigned += 1,
            PageStatus::Completed => self.completed += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.available + self.assigned + self.completed
    }

    /// Completed share of the full hatym, in `0.0..=1.0`.
    pub fn completion_ratio(&self) -> f64 {
        (f64::from(self.completed) / f64::from(TOTAL_PAGES)).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_number_bounds() {
        assert!(PageNumber::new(0).is_err());
        assert!(PageNumber::new(605).is_err());
        assert_eq!(PageNumber::new(1).unwrap(), PageNumber::FIRST);
        assert_eq!(PageNumber::new(604).unwrap(), PageNumber::LAST);
        assert_eq!(PageNumber::all().count(), TOTAL_PAGES as usize);
        assert!("abc".parse::<PageNumber>().is_err());
        assert_eq!(" 17 ".parse::<PageNumber>().unwrap().get(), 17);
    }

    #[test]
    fn completed_is_terminal() {
        for to in [PageStatus::Available, PageStatus::Assigned, PageStatus::Completed] {
            assert!(!PageStatus::Completed.can_transition_to(to));
        }
        assert!(PageStatus::Assigned.can_transition_to(PageStatus::Available));
        assert!(!PageStatus::Available.can_transition_to(PageStatus::Completed));
    }

    #[test]
    fn invariants_reject_token_on_available_page() {
        let mut page = Page::available(SessionId::new(), PageNumber::FIRST);
        assert!(page.check_invariants().is_ok());
        page.lease_token = Some(LeaseToken::generate());
        assert!(page.check_invariants().is_err());
    }

    #[test]
    fn expiry_is_strict() {
        let now = Utc::now();
        let ttl = chrono::Duration::minutes(30);
        let mut page = Page::available(SessionId::new(), PageNumber::FIRST);
        page.status = PageStatus::Assigned;
        page.assigned_at = Some(now - ttl);
        assert!(!page.lease_expired(now, ttl));
        page.assigned_at = Some(now - ttl - chrono::Duration::seconds(1));
        assert!(page.lease_expired(now, ttl));
    }
}
