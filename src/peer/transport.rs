//! Stream transport for peer links
//!
//! Frames are single-line JSON documents terminated by `\n`. Any
//! `AsyncRead + AsyncWrite` stream carries them; TCP is what the binary uses.

use std::net::SocketAddr;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::LinesCodecError;

use super::backoff::{BackoffPolicy, Redial};
use super::channel::PeerChannel;
use super::types::{PeerId, PeerMessage};
use crate::{Error, Result};

/// Largest frame we accept from a peer
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Encode one frame, newline included
///
/// # Errors
///
/// Returns error if the message cannot be serialized
pub fn encode_frame(message: &PeerMessage) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(message)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Decode one frame (without its newline)
///
/// # Errors
///
/// Returns error for oversized frames and anything that is not a known message
pub fn decode_frame(line: &str) -> Result<PeerMessage> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds {MAX_FRAME_BYTES}",
            line.len()
        )));
    }
    Ok(serde_json::from_str(line)?)
}

pub(crate) fn frame_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Protocol(format!("frame exceeds {MAX_FRAME_BYTES} bytes"))
        }
        LinesCodecError::Io(e) => Error::Io(e),
    }
}

pub(crate) async fn write_frame<W>(writer: &mut W, message: &PeerMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Bind the peer listener
///
/// # Errors
///
/// Returns error if the address cannot be bound
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening for peers");
    Ok(listener)
}

/// Accept peers forever, one session task per connection
pub async fn serve(listener: TcpListener, channel: PeerChannel) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let _ = stream.set_nodelay(true);
                let channel = channel.clone();
                tokio::spawn(async move {
                    match channel.attach(stream).await {
                        Ok(peer) => tracing::debug!(peer = %peer, %remote, "inbound session ended"),
                        Err(e) => tracing::warn!(%remote, error = %e, "inbound handshake failed"),
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Connect once and run the session until it ends
///
/// When the peer behind `addr` is already known it shows as `Connecting`
/// from the moment the dial starts.
///
/// # Errors
///
/// Returns error if the connection or handshake fails
pub async fn dial(addr: &str, channel: &PeerChannel, expected: Option<&PeerId>) -> Result<PeerId> {
    let Some(peer) = expected else {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        return channel.attach(stream).await;
    };

    channel.begin_connect(peer);
    match TcpStream::connect(addr).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            channel.attach_to(peer, stream).await
        }
        Err(e) => {
            channel.abandon_connect(peer);
            Err(e.into())
        }
    }
}

/// Keep a session with `addr` alive, redialing with backoff
///
/// Backoff starts over once a session was established, so a peer that
/// drops after a long session is redialed quickly.
pub async fn dial_forever(addr: String, channel: PeerChannel, policy: BackoffPolicy) {
    let mut redial = Redial::new(policy);
    let mut known: Option<PeerId> = None;
    loop {
        match dial(&addr, &channel, known.as_ref()).await {
            Ok(peer) => {
                tracing::info!(peer = %peer, addr = %addr, "outbound session ended, redialing");
                redial.session_established();
                known = Some(peer);
            }
            Err(e) => {
                tracing::debug!(addr = %addr, attempt = redial.attempt(), error = %e, "dial failed");
            }
        }
        tokio::time::sleep(redial.next_delay()).await;
    }
}
