//! Bidirectional message channel between peer processes
//!
//! One link per peer. Each link has a single writer task fed by an unbounded
//! queue and a single reader feeding the shared inbound event queue, so frames
//! from one sender arrive in send order. Sending never waits: a peer that is
//! not `Reachable` fails immediately with `Unreachable`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::transport::{MAX_FRAME_BYTES, decode_frame, frame_error, write_frame};
use super::types::{ChannelEvent, Hello, LinkState, PROTOCOL_VERSION, PeerId, PeerMessage};
use crate::{Error, Result};

/// How long a new link may take to deliver its `Hello`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Link {
    state: LinkState,
    wake_capable: bool,
    session: u64,
    outbound: Option<mpsc::UnboundedSender<PeerMessage>>,
    close: Option<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct Shared {
    local: Hello,
    links: Mutex<HashMap<PeerId, Link>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    next_session: AtomicU64,
}

impl Shared {
    fn emit(&self, event: ChannelEvent) {
        // Nobody listening is not an error for the sender
        let _ = self.events.send(event);
    }

    fn transition(&self, peer: &PeerId, link: &mut Link, next: LinkState) {
        if link.state == next {
            return;
        }
        let previous = std::mem::replace(&mut link.state, next);
        tracing::debug!(peer = %peer, from = %previous, to = %next, "peer link state changed");
        self.emit(ChannelEvent::StateChanged {
            peer: peer.clone(),
            previous,
            current: next,
        });
    }
}

/// Handle to the peer channel; clones share the same links
#[derive(Debug, Clone)]
pub struct PeerChannel {
    inner: Arc<Shared>,
}

/// Inbound side of the channel
#[derive(Debug)]
pub struct ChannelEvents {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelEvents {
    /// Next inbound event, `None` once every channel handle is gone
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    /// Register a handler invoked for every inbound event in arrival order
    ///
    /// The handler runs on one task; a slow handler delays later events but
    /// never reorders them.
    pub fn on_receive<F>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(ChannelEvent) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.rx.recv().await {
                handler(event);
            }
        })
    }
}

impl PeerChannel {
    /// Create a channel announcing `local` to every peer it links with
    #[must_use]
    pub fn new(local: Hello) -> (Self, ChannelEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(Shared {
                local,
                links: Mutex::new(HashMap::new()),
                events: tx,
                next_session: AtomicU64::new(1),
            }),
        };
        (channel, ChannelEvents { rx })
    }

    /// Our own peer ID
    #[must_use]
    pub fn local_id(&self) -> &PeerId {
        &self.inner.local.peer_id
    }

    fn links(&self) -> MutexGuard<'_, HashMap<PeerId, Link>> {
        self.inner
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state of the link to a peer
    #[must_use]
    pub fn state(&self, peer: &PeerId) -> LinkState {
        self.links().get(peer).map_or(LinkState::Disconnected, |l| l.state)
    }

    /// Peers with an active session, sorted by ID
    #[must_use]
    pub fn reachable_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links()
            .iter()
            .filter(|(_, l)| l.state == LinkState::Reachable)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Every peer seen so far with its state and wake capability
    #[must_use]
    pub fn peers(&self) -> Vec<(PeerId, LinkState, bool)> {
        let mut peers: Vec<(PeerId, LinkState, bool)> = self
            .links()
            .iter()
            .map(|(p, l)| (p.clone(), l.state, l.wake_capable))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }

    /// First reachable peer that can send magic packets
    #[must_use]
    pub fn wake_capable_peer(&self) -> Option<PeerId> {
        self.links()
            .iter()
            .filter(|(_, l)| l.state == LinkState::Reachable && l.wake_capable)
            .map(|(p, _)| p.clone())
            .min()
    }

    /// Queue a message for one peer
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if there is no active session with the peer
    pub fn send(&self, peer: &PeerId, message: PeerMessage) -> Result<()> {
        let links = self.links();
        let outbound = links
            .get(peer)
            .filter(|l| l.state == LinkState::Reachable)
            .and_then(|l| l.outbound.as_ref())
            .ok_or_else(|| Error::Unreachable(peer.clone()))?;

        let kind = message.kind();
        outbound
            .send(message)
            .map_err(|_| Error::Unreachable(peer.clone()))?;
        tracing::trace!(peer = %peer, kind, "queued frame");
        Ok(())
    }

    /// Send to every reachable peer except `except`; returns the peers reached
    pub fn broadcast(&self, message: &PeerMessage, except: Option<&PeerId>) -> Vec<PeerId> {
        let links = self.links();
        let mut reached: Vec<PeerId> = links
            .iter()
            .filter(|(p, l)| l.state == LinkState::Reachable && Some(*p) != except)
            .filter_map(|(p, l)| {
                let outbound = l.outbound.as_ref()?;
                outbound.send(message.clone()).ok().map(|()| p.clone())
            })
            .collect();
        reached.sort();
        reached
    }

    /// Close the link to a peer from our side
    pub fn disconnect(&self, peer: &PeerId) {
        let mut links = self.links();
        let Some(link) = links.get_mut(peer) else {
            return;
        };
        if let Some(close) = link.close.take() {
            let _ = close.send(());
        }
        link.outbound = None;
        self.inner.transition(peer, link, LinkState::Disconnected);
        tracing::info!(peer = %peer, "peer disconnected locally");
    }

    /// Run a session over `stream` until either side closes it
    ///
    /// Performs the `Hello` handshake, marks the peer `Reachable`, then
    /// forwards inbound frames to the event queue. Frames that fail to
    /// decode are dropped with a diagnostic; a line longer than
    /// `MAX_FRAME_BYTES` drops the link. The peer behind an inbound stream is
    /// unknown until its `Hello`, so it only passes through `Connecting` once
    /// the handshake completes; see [`Self::attach_to`].
    ///
    /// # Errors
    ///
    /// Returns error if the handshake fails or times out
    pub async fn attach<S>(&self, stream: S) -> Result<PeerId>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.run_session(stream, None).await
    }

    /// Run a session over a stream expected to lead to `peer`
    ///
    /// `peer` is `Connecting` for the whole handshake and falls back to
    /// `Disconnected` if it fails.
    ///
    /// # Errors
    ///
    /// Returns error if the handshake fails or times out
    pub async fn attach_to<S>(&self, peer: &PeerId, stream: S) -> Result<PeerId>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.run_session(stream, Some(peer)).await
    }

    /// Mark a known peer as being connected to
    pub(crate) fn begin_connect(&self, peer: &PeerId) {
        let mut links = self.links();
        let link = links.entry(peer.clone()).or_default();
        if link.state == LinkState::Disconnected {
            self.inner.transition(peer, link, LinkState::Connecting);
        }
    }

    /// Undo [`Self::begin_connect`] after a failed attempt
    pub(crate) fn abandon_connect(&self, peer: &PeerId) {
        let mut links = self.links();
        if let Some(link) = links
            .get_mut(peer)
            .filter(|l| l.state == LinkState::Connecting)
        {
            self.inner.transition(peer, link, LinkState::Disconnected);
        }
    }

    async fn run_session<S>(&self, stream: S, expected: Option<&PeerId>) -> Result<PeerId>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Some(peer) = expected {
            self.begin_connect(peer);
        }

        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut frames =
            FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));

        let hello = match self.handshake(&mut frames, &mut write_half).await {
            Ok(hello) => hello,
            Err(e) => {
                if let Some(peer) = expected {
                    self.abandon_connect(peer);
                }
                return Err(e);
            }
        };
        if let Some(peer) = expected.filter(|p| **p != hello.peer_id) {
            tracing::warn!(expected = %peer, actual = %hello.peer_id, "peer answered under another id");
            self.abandon_connect(peer);
        }

        let peer = hello.peer_id.clone();
        let (session, mut close_rx) = self.open_link(&hello, write_half);
        tracing::info!(peer = %peer, wake_capable = hello.wake_capable, "peer session established");

        loop {
            tokio::select! {
                _ = &mut close_rx => break,
                frame = frames.next() => match frame {
                    Some(Ok(line)) => match decode_frame(&line) {
                        Ok(PeerMessage::Hello(_)) => {
                            tracing::warn!(peer = %peer, "ignoring repeated hello");
                        }
                        Ok(message) => self.inner.emit(ChannelEvent::Message {
                            from: peer.clone(),
                            message,
                        }),
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "dropping malformed frame");
                        }
                    },
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        tracing::warn!(peer = %peer, limit = MAX_FRAME_BYTES, "oversized frame, dropping link");
                        break;
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        tracing::warn!(peer = %peer, error = %e, "peer read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        self.close_link(&peer, session);
        Ok(peer)
    }

    async fn handshake<R, W>(
        &self,
        frames: &mut FramedRead<R, LinesCodec>,
        writer: &mut W,
    ) -> Result<Hello>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        write_frame(writer, &PeerMessage::Hello(self.inner.local.clone())).await?;

        let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, frames.next()).await {
            Err(_) => return Err(Error::TimedOut("peer handshake".to_string())),
            Ok(None) => {
                return Err(Error::Protocol("peer closed before handshake".to_string()));
            }
            Ok(Some(Err(e))) => return Err(frame_error(e)),
            Ok(Some(Ok(line))) => match decode_frame(&line)? {
                PeerMessage::Hello(hello) => hello,
                other => {
                    return Err(Error::Protocol(format!(
                        "expected hello, got {}",
                        other.kind()
                    )));
                }
            },
        };

        if hello.protocol != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "peer {} speaks protocol {}, expected {PROTOCOL_VERSION}",
                hello.peer_id, hello.protocol
            )));
        }
        if hello.peer_id == self.inner.local.peer_id {
            return Err(Error::Protocol("connected to ourselves".to_string()));
        }
        Ok(hello)
    }

    fn open_link<W>(&self, hello: &Hello, writer: W) -> (u64, oneshot::Receiver<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = hello.peer_id.clone();
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();

        {
            let mut links = self.links();
            let link = links.entry(peer.clone()).or_default();

            // A newer session replaces whatever was there
            if let Some(old) = link.close.take() {
                let _ = old.send(());
            }
            link.outbound = None;

            // No-op when `attach_to` already marked the peer
            self.inner.transition(&peer, link, LinkState::Connecting);
            link.session = session;
            link.wake_capable = hello.wake_capable;
            link.outbound = Some(tx);
            link.close = Some(close_tx);
            self.inner.transition(&peer, link, LinkState::Reachable);
        }

        tokio::spawn(write_loop(peer, rx, writer));
        (session, close_rx)
    }

    fn close_link(&self, peer: &PeerId, session: u64) {
        let mut links = self.links();
        let Some(link) = links.get_mut(peer) else {
            return;
        };
        if link.session != session || link.state == LinkState::Disconnected {
            return;
        }
        link.outbound = None;
        link.close = None;
        self.inner.transition(peer, link, LinkState::Disconnected);
        tracing::info!(peer = %peer, "peer session closed");
    }
}

async fn write_loop<W>(peer: PeerId, mut rx: mpsc::UnboundedReceiver<PeerMessage>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &message).await {
            tracing::warn!(peer = %peer, kind = message.kind(), error = %e, "peer write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
