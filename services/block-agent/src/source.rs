//! Event source implementations.
//!
//! - [`TcpEventSource`]: the control service's line-delimited JSON feed
//! - [`ChannelEventSource`]: an in-process feed for tests and development

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bgwatch_events::{BlockStateChanged, ClientFrame, EventError, EventFilter, ServerFrame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{EventSource, SourceError};

// =============================================================================
// TCP
// =============================================================================

struct TcpConnection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TcpConnection {
    async fn send(&mut self, frame: &ClientFrame) -> Result<(), SourceError> {
        let mut line = frame.encode()?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Event source reading the control service's TCP feed.
pub struct TcpEventSource {
    addr: String,
    timeout: Duration,
    conn: Option<TcpConnection>,
}

impl TcpEventSource {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(10),
            conn: None,
        }
    }

    /// Bound on connecting and on waiting for the subscription ack.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn subscribe(&self, filter: EventFilter) -> Result<TcpConnection, SourceError> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut conn = TcpConnection {
            lines: BufReader::new(reader).lines(),
            writer,
        };

        conn.send(&ClientFrame::Subscribe { filter }).await?;

        let line = conn
            .lines
            .next_line()
            .await?
            .ok_or(SourceError::Disconnected)?;
        match ServerFrame::decode(&line)? {
            ServerFrame::Subscribed { filter: granted } => {
                if granted != filter {
                    warn!(requested = ?filter, granted = ?granted, "Server narrowed the subscription");
                }
                Ok(conn)
            }
            ServerFrame::BlockStateChanged(_) => Err(SourceError::Protocol(
                EventError::InvalidFrame("event received before subscription ack".to_string()),
            )),
        }
    }
}

#[async_trait]
impl EventSource for TcpEventSource {
    async fn connect(&mut self, filter: EventFilter) -> Result<(), SourceError> {
        self.disconnect().await;

        let conn = tokio::time::timeout(self.timeout, self.subscribe(filter))
            .await
            .map_err(|_| SourceError::Connect(format!("timed out subscribing to {}", self.addr)))?
            .map_err(|e| SourceError::Connect(format!("{}: {e}", self.addr)))?;

        debug!(addr = %self.addr, "Subscribed to real-time event server");
        self.conn = Some(conn);
        Ok(())
    }

    async fn request_updates(&mut self) -> Result<(), SourceError> {
        let conn = self.conn.as_mut().ok_or(SourceError::NotConnected)?;
        conn.send(&ClientFrame::RequestUpdates).await
    }

    async fn next_event(&mut self) -> Result<Option<BlockStateChanged>, SourceError> {
        let conn = self.conn.as_mut().ok_or(SourceError::NotConnected)?;

        loop {
            let Some(line) = conn.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }

            match ServerFrame::decode(&line) {
                Ok(ServerFrame::BlockStateChanged(event)) => return Ok(Some(event)),
                Ok(ServerFrame::Subscribed { .. }) => {
                    debug!("Ignoring repeated subscription ack");
                }
                Err(EventError::InvalidBlockName(block)) => {
                    info!(block = %block, "Event for unknown block, discarding");
                }
                Err(e) => {
                    warn!(error = %e, "Skipping undecodable frame");
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.writer.shutdown().await {
                debug!(error = %e, "Error closing event feed connection");
            }
        }
    }
}

// =============================================================================
// Channel
// =============================================================================

#[derive(Debug)]
enum FeedItem {
    Event(BlockStateChanged),
    Drop,
}

#[derive(Debug, Default)]
struct FeedState {
    refuse_connects: AtomicU32,
    connect_attempts: AtomicU32,
    update_requests: AtomicU32,
    last_filter: Mutex<Option<EventFilter>>,
}

/// Producer side of a [`ChannelEventSource`].
#[derive(Debug, Clone)]
pub struct ChannelFeed {
    tx: mpsc::UnboundedSender<FeedItem>,
    state: Arc<FeedState>,
}

/// Event source fed from a [`ChannelFeed`].
///
/// Events sent while disconnected are buffered and delivered after the next
/// connect.
#[derive(Debug)]
pub struct ChannelEventSource {
    rx: mpsc::UnboundedReceiver<FeedItem>,
    state: Arc<FeedState>,
    connected: bool,
}

/// Create a connected feed/source pair.
pub fn channel_source() -> (ChannelFeed, ChannelEventSource) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(FeedState::default());
    (
        ChannelFeed {
            tx,
            state: state.clone(),
        },
        ChannelEventSource {
            rx,
            state,
            connected: false,
        },
    )
}

impl ChannelFeed {
    pub fn send(&self, event: BlockStateChanged) {
        if self.tx.send(FeedItem::Event(event)).is_err() {
            warn!("Channel event source is gone, dropping event");
        }
    }

    /// Make the source report a disconnect at this point in the stream.
    pub fn drop_connection(&self) {
        if self.tx.send(FeedItem::Drop).is_err() {
            warn!("Channel event source is gone");
        }
    }

    /// Refuse the next `count` connect attempts.
    pub fn refuse_next_connects(&self, count: u32) {
        self.state.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Connect attempts so far, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn update_requests(&self) -> u32 {
        self.state.update_requests.load(Ordering::SeqCst)
    }

    pub fn last_filter(&self) -> Option<EventFilter> {
        *self
            .state
            .last_filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn connect(&mut self, filter: EventFilter) -> Result<(), SourceError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        *self
            .state
            .last_filter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(filter);

        let refused = self
            .state
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(SourceError::Connect("connection refused".to_string()));
        }

        self.connected = true;
        Ok(())
    }

    async fn request_updates(&mut self) -> Result<(), SourceError> {
        if !self.connected {
            return Err(SourceError::NotConnected);
        }
        self.state.update_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<BlockStateChanged>, SourceError> {
        if !self.connected {
            return Err(SourceError::NotConnected);
        }

        match self.rx.recv().await {
            Some(FeedItem::Event(event)) => Ok(Some(event)),
            Some(FeedItem::Drop) => {
                self.connected = false;
                Err(SourceError::Disconnected)
            }
            // Every feed handle is gone: nothing more will arrive.
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}
