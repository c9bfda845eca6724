//! Kiosk dashboard: live aggregate progress of one session.
//!
//! Loads the session once, then listens to the change feed and, on a fixed
//! interval, sweeps expired leases and reloads everything. Each new state is
//! published on a `watch` channel.

pub mod projection;

pub use projection::{Projection, Snapshot};

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ProtocolSettings;
use crate::error::Result;
use crate::event::Event;
use crate::model::SessionId;
use crate::store::{AssignmentStore, EventStream};
use crate::sweeper::Sweeper;
use crate::telemetry::metrics;

/// Open the active session, or start one if there is none.
pub async fn current_or_new_session(store: &dyn AssignmentStore) -> Result<SessionId> {
    match store.latest_active_session().await? {
        Some(session) => Ok(session.id),
        None => store.create_session().await,
    }
}

/// One wake-up of the dashboard loop.
enum Wake {
    Shutdown,
    Event(Event),
    FeedClosed,
    Resync,
}

pub struct Dashboard {
    store: Arc<dyn AssignmentStore>,
    sweeper: Sweeper,
    session_id: SessionId,
    resync_interval: Duration,
    shutdown: Arc<Notify>,
    snapshots: watch::Sender<Snapshot>,
}

impl Dashboard {
    pub fn new(
        store: Arc<dyn AssignmentStore>,
        settings: &ProtocolSettings,
        session_id: SessionId,
    ) -> Self {
        let (snapshots, _) = watch::channel(Projection::new(session_id).snapshot());
        Self {
            sweeper: Sweeper::new(Arc::clone(&store), settings),
            store,
            session_id,
            resync_interval: settings.resync_interval(),
            shutdown: Arc::new(Notify::new()),
            snapshots,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Receive every published snapshot.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.subscribe()
    }

    /// Signal the dashboard loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Start a fresh session. The current one is left exactly as it is.
    pub async fn start_new_session(&self) -> Result<SessionId> {
        let id = self.store.create_session().await?;
        info!(previous = %self.session_id, session_id = %id, "started new session");
        Ok(id)
    }

    /// Sweep expired leases, then reload every page.
    pub async fn resync(&self, projection: &mut Projection) -> Result<()> {
        self.sweeper.sweep_once(self.session_id).await?;
        let pages = self.store.list_pages(self.session_id).await?;
        let loaded = pages.len() as u64;
        projection.load(pages);
        metrics::projection_events().add(loaded, &[KeyValue::new("source", "resync")]);
        debug!(session_id = %self.session_id, loaded, "dashboard resynced");
        self.publish(projection);
        Ok(())
    }

    /// Run until shutdown. The initial load must succeed; later failures
    /// are logged and the next tick tries again.
    pub async fn run(&self) -> Result<()> {
        let mut projection = Projection::new(self.session_id);
        self.resync(&mut projection).await?;

        let mut feed = match self.store.subscribe(self.session_id).await {
            Ok(feed) => Some(feed),
            Err(e) => {
                warn!("change feed unavailable, polling only: {e}");
                None
            }
        };

        let mut ticker = tokio::time::interval(self.resync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(session_id = %self.session_id, "dashboard started");

        loop {
            let wake = tokio::select! {
                _ = self.shutdown.notified() => Wake::Shutdown,
                event = next_event(&mut feed) => match event {
                    Some(event) => Wake::Event(event),
                    None => Wake::FeedClosed,
                },
                _ = ticker.tick() => Wake::Resync,
            };

            match wake {
                Wake::Shutdown => {
                    info!("dashboard shutting down");
                    return Ok(());
                }
                Wake::Event(event) => {
                    if projection.apply(&event) {
                        metrics::projection_events().add(1, &[KeyValue::new("source", "push")]);
                        self.publish(&projection);
                    }
                }
                Wake::FeedClosed => {
                    warn!("change feed closed, polling only");
                    feed = None;
                }
                Wake::Resync => {
                    if let Err(e) = self.resync(&mut projection).await {
                        error!("dashboard resync error: {e}");
                    }
                }
            }
        }
    }

    fn publish(&self, projection: &Projection) {
        let snapshot = projection.snapshot();
        if snapshot.complete && !self.snapshots.borrow().complete {
            info!(session_id = %self.session_id, "hatym complete");
        }
        self.snapshots.send_replace(snapshot);
    }
}

async fn next_event(feed: &mut Option<EventStream>) -> Option<Event> {
    match feed {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}
