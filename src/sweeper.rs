//! Expiry sweeper: returns lapsed leases to the pool.
//!
//! Stateless. The dashboard calls [`Sweeper::sweep_once`] before each full
//! refresh, and [`Sweeper::run`] keeps sweeping on a fixed interval so
//! abandoned pages come back even when nobody watches the dashboard and the
//! change feed is down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info};

use crate::config::ProtocolSettings;
use crate::error::Result;
use crate::model::SessionId;
use crate::store::AssignmentStore;
use crate::telemetry::lease::start_lease_span;

/// Which session a sweep loop looks after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepTarget {
    Session(SessionId),
    /// Whatever session is active at each tick.
    LatestActive,
}

#[derive(Clone)]
pub struct Sweeper {
    store: Arc<dyn AssignmentStore>,
    ttl: chrono::Duration,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl Sweeper {
    pub fn new(store: Arc<dyn AssignmentStore>, settings: &ProtocolSettings) -> Self {
        Self {
            store,
            ttl: settings.assignment_ttl(),
            interval: settings.sweep_interval(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the sweep loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Release every expired lease in one session.
    pub async fn sweep_once(&self, session_id: SessionId) -> Result<u64> {
        let span = start_lease_span("sweep", session_id, None);
        async {
            let released = self
                .store
                .release_expired_assignments(session_id, self.ttl)
                .await?;
            if released > 0 {
                info!(released, "released expired leases");
            } else {
                debug!("no expired leases");
            }
            Ok(released)
        }
        .instrument(span)
        .await
    }

    /// Sweep on the configured interval until shutdown.
    pub async fn run(&self, target: SweepTarget) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), ?target, "sweeper started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("sweeper shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            if let Err(e) = self.tick(target).await {
                error!("sweep error: {e}");
            }
        }
    }

    async fn tick(&self, target: SweepTarget) -> Result<()> {
        let session_id = match target {
            SweepTarget::Session(id) => id,
            SweepTarget::LatestActive => match self.store.latest_active_session().await? {
                Some(session) => session.id,
                None => return Ok(()),
            },
        };
        self.sweep_once(session_id).await?;
        Ok(())
    }
}
