//! Core data model.
//!
//! A session is one complete hatym: a fixed pool of [`TOTAL_PAGES`] pages that
//! participants claim, read, and mark completed. Pages are leased, never owned:
//! a claim hands out a [`LeaseToken`] that is the only proof a participant may
//! complete the page.

pub mod lease;
pub mod page;
pub mod session;

pub use lease::{
    ClaimLimits, ClaimRow, ClaimStatus, CompleteResult, CompleteStatus, LeaseToken, ParticipantId,
};
pub use page::{Page, PageCounts, PageNumber, PageStatus, PageView};
pub use session::{Session, SessionId};

/// Number of pages in one hatym.
pub const TOTAL_PAGES: u16 = 604;
