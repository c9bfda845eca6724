//! Device-local state: the participant id and cached lease tokens.
//!
//! Persisted as one small JSON file so a participant keeps the same id for
//! the lifetime of the device and can come back to a claimed page without
//! asking the store for the token again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{LeaseToken, PageNumber, ParticipantId, SessionId};

const STATE_FILE: &str = "device.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeviceState {
    participant_id: Option<ParticipantId>,
    /// Keyed by `"{session_id}:{page_number}"`.
    #[serde(default)]
    lease_tokens: BTreeMap<String, LeaseToken>,
}

fn token_key(session_id: SessionId, page_number: PageNumber) -> String {
    format!("{session_id}:{page_number}")
}

pub struct DeviceStore {
    path: Option<PathBuf>,
    state: Mutex<DeviceState>,
}

impl DeviceStore {
    /// Open (or start) the device state under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(STATE_FILE);
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DeviceState::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Volatile state that disappears with the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// This device's participant id, generated and persisted on first use.
    pub fn participant_id(&self) -> Result<ParticipantId> {
        let mut state = self.lock()?;
        if let Some(id) = &state.participant_id {
            return Ok(id.clone());
        }
        let id = ParticipantId::generate();
        state.participant_id = Some(id.clone());
        self.persist(&state)?;
        debug!(participant = %id, "generated participant id");
        Ok(id)
    }

    pub fn store_lease_token(
        &self,
        session_id: SessionId,
        page_number: PageNumber,
        token: &LeaseToken,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let key = token_key(session_id, page_number);
        if state.lease_tokens.get(&key) == Some(token) {
            return Ok(());
        }
        state.lease_tokens.insert(key, token.clone());
        self.persist(&state)
    }

    pub fn lease_token(
        &self,
        session_id: SessionId,
        page_number: PageNumber,
    ) -> Result<Option<LeaseToken>> {
        Ok(self
            .lock()?
            .lease_tokens
            .get(&token_key(session_id, page_number))
            .cloned())
    }

    pub fn clear_lease_token(&self, session_id: SessionId, page_number: PageNumber) -> Result<()> {
        let mut state = self.lock()?;
        if state
            .lease_tokens
            .remove(&token_key(session_id, page_number))
            .is_some()
        {
            self.persist(&state)?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, DeviceState>> {
        self.state
            .lock()
            .map_err(|_| Error::Other("device state lock poisoned".to_string()))
    }

    /// Write-then-rename so a crash never leaves a torn file.
    fn persist(&self, state: &DeviceState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
