//! Claim coordinator: one participant's side of the lease protocol.
//!
//! Claims pages, caches the lease tokens on the device, and completes pages
//! after checking the live lease. A rejected capability is reported, never
//! retried: the only recovery is dropping the cached token and claiming again.

pub mod device;

pub use device::DeviceStore;

use std::sync::Arc;

use tracing::{Instrument, info, warn};

use crate::asset::{AssetResolver, DirectUrlResolver};
use crate::config::ProtocolSettings;
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::AssignmentStore;
use crate::telemetry::lease::{record_status_transition, start_lease_span};

/// How many pages a visit asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// One live page at a time, opened directly. Another can be claimed
    /// once it is completed, up to the configured cap.
    Single,
    /// Up to the configured per-participant cap, listed together.
    Multi,
}

/// A page the participant holds, as shown to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldPage {
    pub page_number: PageNumber,
    /// `Assigned` or `Completed`.
    pub status: PageStatus,
    pub lease_token: Option<LeaseToken>,
    /// Deep link into the reader.
    pub reader_path: String,
    /// Where the page content can be fetched from, best first.
    pub asset_candidates: Vec<String>,
}

/// What entering a session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assignment {
    /// Live leases first (ascending), then pages already completed.
    Assigned(Vec<HeldPage>),
    /// The per-participant cap is used up.
    LimitReached,
    /// Nothing left to hand out: the hatym is done.
    Finished,
}

impl Assignment {
    /// The page a single-unit visit should open.
    pub fn primary(&self) -> Option<&HeldPage> {
        match self {
            Assignment::Assigned(pages) => {
                pages.iter().find(|p| p.status == PageStatus::Assigned)
            }
            _ => None,
        }
    }
}

/// Reader deep link for a page.
pub fn reader_path(session_id: SessionId, page_number: PageNumber) -> String {
    format!("/read/{session_id}/{page_number}")
}

/// Link participants scan to join a session.
pub fn claim_path(session_id: SessionId) -> String {
    format!("/s/{session_id}/claim")
}

pub struct Coordinator {
    store: Arc<dyn AssignmentStore>,
    device: Arc<DeviceStore>,
    resolver: Arc<dyn AssetResolver>,
    settings: ProtocolSettings,
    participant: ParticipantId,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn AssignmentStore>,
        device: Arc<DeviceStore>,
        settings: ProtocolSettings,
    ) -> Result<Self> {
        let participant = device.participant_id()?;
        Ok(Self {
            store,
            device,
            resolver: Arc::new(DirectUrlResolver),
            settings,
            participant,
        })
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AssetResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Claim (or resume) pages in a session and cache their tokens.
    pub async fn enter(&self, session_id: SessionId, mode: ClaimMode) -> Result<Assignment> {
        let cap = self.settings.max_pages_per_user;
        let limits = match mode {
            ClaimMode::Single => ClaimLimits::one_at_a_time(cap),
            ClaimMode::Multi => ClaimLimits::per_user(cap),
        };
        let span = start_lease_span("claim", session_id, None);

        async {
            let rows = self
                .store
                .claim_pages(
                    session_id,
                    &self.participant,
                    self.settings.assignment_ttl(),
                    limits,
                )
                .await?;

            let mut held = Vec::new();
            for row in rows {
                match (row.status, row.page_number) {
                    (ClaimStatus::LimitReached, _) => {
                        info!(participant = %self.participant, "page limit reached");
                        return Ok(Assignment::LimitReached);
                    }
                    (ClaimStatus::Finished, _) => {
                        info!("no pages left, hatym finished");
                        return Ok(Assignment::Finished);
                    }
                    (ClaimStatus::Assigned, Some(page_number)) => {
                        let token = row.lease_token.ok_or_else(|| {
                            Error::Invariant(format!("claim row for page {page_number} has no token"))
                        })?;
                        self.device
                            .store_lease_token(session_id, page_number, &token)?;
                        held.push(HeldPage {
                            page_number,
                            status: PageStatus::Assigned,
                            lease_token: Some(token),
                            reader_path: reader_path(session_id, page_number),
                            asset_candidates: self.asset_candidates(page_number).await?,
                        });
                    }
                    (ClaimStatus::Completed, Some(page_number)) => held.push(HeldPage {
                        page_number,
                        status: PageStatus::Completed,
                        lease_token: None,
                        reader_path: reader_path(session_id, page_number),
                        asset_candidates: Vec::new(),
                    }),
                    (status, None) => {
                        return Err(Error::Invariant(format!(
                            "claim row with status {status} has no page number"
                        )));
                    }
                }
            }

            if held.is_empty() {
                return Ok(Assignment::Finished);
            }
            let pages: Vec<u16> = held.iter().map(|p| p.page_number.get()).collect();
            info!(participant = %self.participant, ?pages, "pages held");
            Ok(Assignment::Assigned(held))
        }
        .instrument(span)
        .await
    }

    /// Check the live lease and return the token to complete with.
    ///
    /// Refreshes the cached token when the store's differs. If the page is
    /// no longer assigned to this participant, the cached token is dropped
    /// and `CapabilityRejected` is returned.
    pub async fn verify_lease(
        &self,
        session_id: SessionId,
        page_number: PageNumber,
    ) -> Result<LeaseToken> {
        let cached = self.device.lease_token(session_id, page_number)?;
        let live = self.store.get_page(session_id, page_number).await?;

        let live_token = match (&live.status, &live.holder, live.lease_token) {
            (PageStatus::Assigned, Some(holder), Some(token)) if *holder == self.participant => {
                token
            }
            _ => {
                warn!(
                    session_id = %session_id,
                    page = %page_number,
                    status = %live.status,
                    "page no longer assigned to this participant"
                );
                self.device.clear_lease_token(session_id, page_number)?;
                return Err(Error::CapabilityRejected {
                    session: session_id,
                    page: page_number,
                });
            }
        };

        if cached.as_ref() != Some(&live_token) {
            info!(session_id = %session_id, page = %page_number, "refreshed cached lease token");
            self.device
                .store_lease_token(session_id, page_number, &live_token)?;
        }
        Ok(live_token)
    }

    /// Mark a held page completed.
    pub async fn complete(
        &self,
        session_id: SessionId,
        page_number: PageNumber,
    ) -> Result<CompleteResult> {
        let span = start_lease_span("complete", session_id, Some(page_number));

        async {
            let token = self.verify_lease(session_id, page_number).await?;
            let result = self
                .store
                .complete_page(session_id, page_number, &self.participant, &token)
                .await?;

            self.device.clear_lease_token(session_id, page_number)?;
            if !result.is_completed() {
                warn!(page = %page_number, "completion rejected by store");
                return Err(Error::CapabilityRejected {
                    session: session_id,
                    page: page_number,
                });
            }

            record_status_transition(&tracing::Span::current(), "assigned", "completed");
            info!(
                page = %page_number,
                completed_count = result.completed_count,
                finished = result.finished,
                "page completed"
            );
            Ok(result)
        }
        .instrument(span)
        .await
    }

    async fn asset_candidates(&self, page_number: PageNumber) -> Result<Vec<String>> {
        Ok(match self.store.page_asset(page_number).await? {
            Some(asset) if asset.is_renderable() => {
                self.resolver.resolve(&asset.asset_url, page_number)
            }
            _ => Vec::new(),
        })
    }
}
