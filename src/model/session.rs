//! Sessions: one complete distribution run over the page pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::TOTAL_PAGES;
use crate::error::{Error, Result};

/// Newtype for session IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 chars of the UUID, for log lines and tables.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| Error::Other(format!("invalid session id {s:?}: {e}")))
    }
}

/// A hatym session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    /// Only the newest unfinished session is active.
    pub active: bool,
    pub completed_count: u32,
    pub total_pages: u16,
}

impl Session {
    pub fn new(id: SessionId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            active: true,
            completed_count: 0,
            total_pages: TOTAL_PAGES,
        }
    }

    /// Every page has been completed.
    pub fn is_finished(&self) -> bool {
        self.completed_count >= u32::from(self.total_pages)
    }
}
