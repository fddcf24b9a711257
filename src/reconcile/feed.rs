//! Change feed listener for a session
//!
//! Each stage update only triggers an extra tick; the update's value is
//! never trusted on its own. A failed or dropped subscription leaves the
//! re-check schedule untouched and is retried with exponential backoff
//! (unless reconnection is disabled, in which case the session polls only).

use super::events::TickTrigger;
use super::session::Session;
use crate::backend::{Subscription, SubscriptionError};
use std::sync::Arc;
use tracing::{debug, info, warn};

enum ListenEnd {
    /// Session settled; stop listening for good
    Settled,
    /// Backend closed the stream
    Closed,
}

pub(crate) async fn run_feed_listener(session: Arc<Session>) {
    let feed = session.config.feed.clone();
    if !feed.enabled {
        debug!(project = %session.project, session = %session.id, "Change feed disabled; polling only");
        return;
    }

    let mut failures: u32 = 0;
    loop {
        let subscribed = tokio::select! {
            _ = session.settled() => return,
            result = session.collaborators.feed.subscribe(&session.project) => result,
        };

        let error = match subscribed {
            Ok(subscription) => {
                debug!(project = %session.project, session = %session.id, "Subscribed to change feed");
                match listen(&session, subscription, &mut failures).await {
                    ListenEnd::Settled => return,
                    ListenEnd::Closed => SubscriptionError::Closed,
                }
            }
            Err(err) => err,
        };

        failures = failures.saturating_add(1);
        if !feed.reconnect {
            warn!(
                project = %session.project,
                session = %session.id,
                error = %error,
                "Change feed unavailable; continuing with polling only"
            );
            return;
        }

        let delay = feed.reconnect_delay(failures);
        warn!(
            project = %session.project,
            session = %session.id,
            error = %error,
            attempt = failures,
            retry_in_ms = delay.as_millis() as u64,
            "Change feed unavailable; will resubscribe"
        );
        tokio::select! {
            _ = session.settled() => return,
            _ = session.clock.sleep(delay) => {}
        }
    }
}

async fn listen(session: &Arc<Session>, mut subscription: Subscription, failures: &mut u32) -> ListenEnd {
    loop {
        let next = tokio::select! {
            _ = session.settled() => None,
            update = subscription.next() => Some(update),
        };

        let Some(update) = next else {
            subscription.unsubscribe();
            return ListenEnd::Settled;
        };
        let Some(update) = update else {
            return ListenEnd::Closed;
        };
        if *failures > 0 {
            info!(project = %session.project, session = %session.id, "Change feed recovered");
            *failures = 0;
        }
        debug!(
            project = %session.project,
            session = %session.id,
            stage = %update.stage,
            "Stage update received"
        );

        if session.tick(TickTrigger::ChangeFeed).await.is_final() {
            subscription.unsubscribe();
            return ListenEnd::Settled;
        }
    }
}
