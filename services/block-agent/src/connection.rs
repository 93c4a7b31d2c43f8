//! Connection manager for the hardware control service's real-time feed.
//!
//! The manager:
//! - Subscribes to block events only
//! - Retries the connection every [`RETRY_INTERVAL`] until it succeeds or
//!   shutdown is signalled
//! - Pumps events into the [`EventListener`], re-subscribing after the feed
//!   drops
//! - Replays deferred events between feed events, on the same task

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bgwatch_events::{BlockStateChanged, EventError, EventFilter};
use bgwatch_reconcile::RETRY_INTERVAL;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::listener::EventListener;

/// Errors from an event source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The control service could not be reached or refused the subscription.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The feed dropped.
    #[error("event feed disconnected")]
    Disconnected,

    /// The feed sent something undecodable.
    #[error("protocol error: {0}")]
    Protocol(#[from] EventError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not connected")]
    NotConnected,
}

/// A subscription to block state changes.
#[async_trait]
pub trait EventSource: Send {
    /// Connect and subscribe with `filter`.
    async fn connect(&mut self, filter: EventFilter) -> Result<(), SourceError>;

    /// Start delivery on the current subscription.
    async fn request_updates(&mut self) -> Result<(), SourceError>;

    /// Wait for the next event. `Ok(None)` means the feed ended.
    ///
    /// Must be cancel safe: the manager races it against shutdown.
    async fn next_event(&mut self) -> Result<Option<BlockStateChanged>, SourceError>;

    async fn disconnect(&mut self);
}

/// Connectivity of the current session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSession {
    pub connected: bool,

    /// Set by the receive path when the feed drops; cleared on reconnect.
    pub failed: bool,
}

/// Default interval between replays of deferred events.
pub const DEFAULT_REPLAY_INTERVAL: Duration = Duration::from_secs(1);

/// Connection manager.
pub struct ConnectionManager<S> {
    source: S,
    listener: Arc<EventListener>,
    filter: EventFilter,
    session: ConnectionSession,
    replay_interval: Duration,
}

impl<S: EventSource> ConnectionManager<S> {
    pub fn new(source: S, listener: Arc<EventListener>) -> Self {
        Self {
            source,
            listener,
            filter: EventFilter::blocks_only(),
            session: ConnectionSession::default(),
            replay_interval: DEFAULT_REPLAY_INTERVAL,
        }
    }

    /// Set how often deferred events are replayed while no feed event
    /// arrives.
    pub fn with_replay_interval(mut self, interval: Duration) -> Self {
        self.replay_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn session(&self) -> ConnectionSession {
        self.session
    }

    pub fn listener(&self) -> &Arc<EventListener> {
        &self.listener
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Connect, retrying until success or shutdown. Returns true once
    /// connected.
    pub async fn connect_with_retry(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut attempt = 0u32;

        loop {
            if stopping(shutdown) {
                return false;
            }

            match self.source.connect(self.filter).await {
                Ok(()) => {
                    self.session = ConnectionSession {
                        connected: true,
                        failed: false,
                    };
                    info!(attempts = attempt + 1, "Connected to real-time event server");
                    return true;
                }
                Err(e) => {
                    attempt += 1;
                    let trying_secs = RETRY_INTERVAL.as_secs() * u64::from(attempt);
                    if attempt <= 3 {
                        warn!(
                            error = %e,
                            attempt,
                            "Failed to connect to real-time event server, trying for {trying_secs} seconds"
                        );
                    } else {
                        error!(
                            error = %e,
                            attempt,
                            "Failed to connect to real-time event server, trying for {trying_secs} seconds"
                        );
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }

    /// Run until shutdown, then disconnect and hand the manager back.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        info!("Starting real-time event connection");

        if self.connect_with_retry(&mut shutdown).await {
            while !stopping(&shutdown) {
                if self.session.failed {
                    self.session.connected = false;
                    self.source.disconnect().await;
                    if !self.connect_with_retry(&mut shutdown).await {
                        break;
                    }
                }

                if let Err(e) = self.source.request_updates().await {
                    warn!(error = %e, "Failed to request block updates");
                    self.session.failed = true;
                    continue;
                }
                debug!("Requested block updates");

                self.pump(&mut shutdown).await;
            }
        }

        self.source.disconnect().await;
        self.session.connected = false;
        info!("Real-time event connection stopped");
        self
    }

    /// Feed events to the listener until the feed drops or shutdown.
    async fn pump(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let mut replay =
            tokio::time::interval_at(Instant::now() + self.replay_interval, self.replay_interval);
        replay.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = replay.tick() => {
                    let replayed = self.listener.replay_deferred().await;
                    if replayed > 0 {
                        debug!(replayed, "Replayed deferred block events");
                    }
                }
                next = self.source.next_event() => {
                    match next {
                        Ok(Some(event)) => {
                            self.listener.handle(event).await;
                        }
                        Ok(None) => {
                            warn!("Real-time event feed closed");
                            self.session.failed = true;
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "Real-time event feed failed");
                            self.session.failed = true;
                            return;
                        }
                    }
                }
            }
        }
    }
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}
