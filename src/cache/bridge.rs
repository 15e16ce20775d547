//! Realtime invalidation bridge.
//!
//! Keeps one change-feed subscription alive for a collection scope and calls
//! back whenever a relevant row changes. A failed or dropped subscription is
//! retried on an interval; after each successful re-subscription one
//! catch-up invalidation is fired because events may have been missed.
//!
//! While the feed is down the bridge can still fall back to expiry: on every
//! retry tick it asks an [`ExpiryCheck`] whether the caller's snapshot has
//! outlived its TTL and, if so, fires an invalidation so it is read again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::repos::ChangeFeed;

use super::error::SubscriptionError;
use super::events::ChangeFilter;

const METRIC_EVENTS: &str = "kasirpro_realtime_events_total";
const METRIC_IGNORED: &str = "kasirpro_realtime_ignored_total";
const METRIC_RECONNECTS: &str = "kasirpro_realtime_reconnects_total";

/// How long a mounting view holds its first read back for the subscription.
pub const CONNECT_WAIT: Duration = Duration::from_secs(2);

pub type InvalidateFn = Arc<dyn Fn() + Send + Sync>;

/// Answers whether the caller's snapshot has expired and should be re-read.
pub type ExpiryCheck = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct InvalidationBridge;

impl InvalidationBridge {
    /// Start listening for changes matching `filter`. Must be called inside a
    /// Tokio runtime.
    pub fn open(
        feed: Arc<dyn ChangeFeed>,
        filter: ChangeFilter,
        reconnect_interval: Duration,
        on_invalidate: InvalidateFn,
    ) -> BridgeHandle {
        Self::start(feed, filter, reconnect_interval, on_invalidate, None)
    }

    /// Like [`open`](Self::open), but while the subscription is down every
    /// retry tick consults `expired` and invalidates when it returns true.
    pub fn open_with_fallback(
        feed: Arc<dyn ChangeFeed>,
        filter: ChangeFilter,
        reconnect_interval: Duration,
        on_invalidate: InvalidateFn,
        expired: ExpiryCheck,
    ) -> BridgeHandle {
        Self::start(feed, filter, reconnect_interval, on_invalidate, Some(expired))
    }

    fn start(
        feed: Arc<dyn ChangeFeed>,
        filter: ChangeFilter,
        reconnect_interval: Duration,
        on_invalidate: InvalidateFn,
        expired: Option<ExpiryCheck>,
    ) -> BridgeHandle {
        let closed = Arc::new(AtomicBool::new(false));
        let catch_up = Arc::new(AtomicBool::new(false));
        let (attempted_tx, attempted) = watch::channel(false);
        let task = tokio::spawn(supervise(Supervisor {
            feed,
            filter,
            reconnect_interval,
            on_invalidate,
            expired,
            closed: Arc::clone(&closed),
            catch_up: Arc::clone(&catch_up),
            attempted: attempted_tx,
        }));
        info!(
            table = filter.table(),
            owner = %filter.owner,
            partition = ?filter.partition,
            "Realtime subscription opened"
        );
        BridgeHandle {
            filter,
            closed,
            connecting: Connecting {
                attempted,
                catch_up,
            },
            task,
        }
    }
}

/// Lets the owner of a new bridge hold its first read back until the
/// subscription is in place, so no change can fall between the two.
#[derive(Clone)]
pub struct Connecting {
    attempted: watch::Receiver<bool>,
    catch_up: Arc<AtomicBool>,
}

impl Connecting {
    /// Wait at most `limit` for the first subscribe attempt to finish, with
    /// either outcome. On timeout the bridge fires one catch-up invalidation
    /// once it does subscribe, and this returns false.
    pub async fn wait(mut self, limit: Duration) -> bool {
        let finished = matches!(
            tokio::time::timeout(limit, self.attempted.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        if !finished {
            self.catch_up.store(true, Ordering::SeqCst);
        }
        finished
    }
}

/// Owns a running subscription. Closing is idempotent and also happens on drop.
pub struct BridgeHandle {
    filter: ChangeFilter,
    closed: Arc<AtomicBool>,
    connecting: Connecting,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    pub fn connecting(&self) -> Connecting {
        self.connecting.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop delivering invalidations. A callback that was already starting
    /// when this ran may still complete once; callbacks that must not act
    /// after a close check their own state too.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.abort();
        info!(
            table = self.filter.table(),
            owner = %self.filter.owner,
            partition = ?self.filter.partition,
            "Realtime subscription closed"
        );
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct Supervisor {
    feed: Arc<dyn ChangeFeed>,
    filter: ChangeFilter,
    reconnect_interval: Duration,
    on_invalidate: InvalidateFn,
    expired: Option<ExpiryCheck>,
    closed: Arc<AtomicBool>,
    catch_up: Arc<AtomicBool>,
    attempted: watch::Sender<bool>,
}

async fn supervise(supervisor: Supervisor) {
    let Supervisor {
        feed,
        filter,
        reconnect_interval,
        on_invalidate,
        expired,
        closed,
        catch_up,
        attempted,
    } = supervisor;

    let fire = |reason: &'static str| {
        if closed.load(Ordering::SeqCst) {
            return false;
        }
        debug!(table = filter.table(), reason, "Invalidating after change");
        on_invalidate();
        true
    };

    // Set once the first attempt is over; any later subscription may have
    // missed changes and catches up with one invalidation.
    let mut retrying = false;
    let mut failures = 0u32;
    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        match feed.subscribe(&filter).await {
            Ok(mut stream) => {
                failures = 0;
                if retrying {
                    counter!(METRIC_RECONNECTS).increment(1);
                    info!(table = filter.table(), "Realtime subscription re-established");
                    if !fire("resubscribed") {
                        return;
                    }
                } else if catch_up.load(Ordering::SeqCst) && !fire("late_subscription") {
                    return;
                }
                attempted.send_replace(true);

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            counter!(METRIC_EVENTS).increment(1);
                            if event.is_relevant(&filter) {
                                if !fire("change") {
                                    return;
                                }
                            } else {
                                counter!(METRIC_IGNORED).increment(1);
                                debug!(
                                    table = filter.table(),
                                    kind = ?event.kind(),
                                    "Ignoring change outside subscribed scope"
                                );
                            }
                        }
                        Err(SubscriptionError::Lagged(skipped)) => {
                            warn!(table = filter.table(), skipped, "Change feed lagged");
                            if !fire("lagged") {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(table = filter.table(), error = %err, "Dropping malformed change");
                        }
                    }
                }
                warn!(table = filter.table(), "Change feed ended; will resubscribe");
            }
            Err(err) => {
                attempted.send_replace(true);
                failures = failures.saturating_add(1);
                if failures == 1 {
                    warn!(
                        table = filter.table(),
                        error = %err,
                        retry_in_ms = reconnect_interval.as_millis() as u64,
                        "Realtime subscription failed; relying on TTL until it recovers"
                    );
                } else {
                    debug!(
                        table = filter.table(),
                        error = %err,
                        failures,
                        "Realtime subscription still failing"
                    );
                }
            }
        }

        retrying = true;
        tokio::time::sleep(reconnect_interval).await;

        // Only while the feed is down; a working feed reports changes itself.
        if failures > 0
            && expired.as_ref().is_some_and(|expired| expired())
            && !fire("ttl_fallback")
        {
            return;
        }
    }
}
