//! Page change feed over `LISTEN hatym_pages`.
//!
//! The migration's trigger publishes one JSON [`Event`] per page transition
//! with `pg_notify`, which Postgres delivers only on commit. A background
//! task filters them down to one session and forwards them to the
//! subscriber until it hangs up.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::Event;
use crate::model::SessionId;
use crate::store::{EVENT_BUFFER, EventStream};

pub(crate) const CHANNEL: &str = "hatym_pages";

const RETRY_DELAY: Duration = Duration::from_secs(1);

pub(crate) async fn listen(pool: &PgPool, session_id: SessionId) -> Result<EventStream> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANNEL).await?;

    let (tx, stream) = mpsc::channel(EVENT_BUFFER);
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = tx.closed() => break,
                received = listener.recv() => received,
            };
            let notification = match received {
                Ok(n) => n,
                Err(e) => {
                    // The listener reconnects on its own; events sent while
                    // it was away are lost and the dashboard resync covers them.
                    warn!("PgListener error: {e}");
                    tokio::time::sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let event: Event = match serde_json::from_str(notification.payload()) {
                Ok(event) => event,
                Err(e) => {
                    warn!(payload = notification.payload(), "bad page event: {e}");
                    continue;
                }
            };
            if event.session_id != session_id {
                continue;
            }
            if tx.send(event).await.is_err() {
                debug!(session_id = %session_id, "subscriber gone, closing feed");
                break;
            }
        }
    });

    Ok(stream)
}
