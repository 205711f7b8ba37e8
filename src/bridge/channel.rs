//! Decision process channel (unix datagram socket)
//!
//! The bridge binds a well-known path. Replies go to the configured peer
//! path, or to whichever named socket last sent the bridge a datagram.
//!
//! Sends never wait: a peer that stops reading surfaces as `WouldBlock`, and
//! the dispatcher holds the frame until `send_ready` says to try again.

use crate::config::ChannelConfig;
use crate::{Error, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UnixDatagram;
use tracing::{debug, info};

/// Readiness only tracks a connected peer's queue; unconnected sends re-poll
const UNCONNECTED_RETRY: Duration = Duration::from_millis(10);

/// Datagram transport between the dispatcher and the decision process
pub trait Transport: Send + Sync {
    /// Send one whole frame without waiting
    fn try_send(&self, frame: &[u8]) -> Result<()>;

    /// Resolves when a frame refused with `WouldBlock` is worth retrying
    fn send_ready(&self) -> impl Future<Output = Result<()>> + Send;

    /// Receive one datagram
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send;
}

#[derive(Debug)]
enum Peer {
    /// Socket is connected; plain send/recv
    Connected,
    /// Peer learned from incoming datagrams
    Learned(Mutex<Option<PathBuf>>),
}

#[derive(Debug)]
pub struct DecisionChannel {
    socket: UnixDatagram,
    peer: Peer,
    /// Unlinked on drop
    bound_path: Option<PathBuf>,
}

impl DecisionChannel {
    /// Bind the rendezvous path, replacing a stale socket file.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &ChannelConfig) -> Result<Self> {
        let path = &config.socket_path;
        remove_stale(path)?;

        let socket = UnixDatagram::bind(path).map_err(Error::Io)?;
        info!("decision channel bound to {}", path.display());

        let peer = match &config.peer_path {
            Some(peer_path) => {
                socket.connect(peer_path).map_err(Error::Io)?;
                info!("decision channel connected to {}", peer_path.display());
                Peer::Connected
            }
            None => Peer::Learned(Mutex::new(None)),
        };

        Ok(Self {
            socket,
            peer,
            bound_path: Some(path.clone()),
        })
    }

    /// Wrap a socket that is already connected to the decision process
    pub fn from_connected(socket: UnixDatagram) -> Self {
        Self {
            socket,
            peer: Peer::Connected,
            bound_path: None,
        }
    }

    /// Send one whole frame, failing with `WouldBlock` instead of waiting
    pub fn try_send(&self, frame: &[u8]) -> Result<()> {
        let written = match &self.peer {
            Peer::Connected => self.socket.try_send(frame)?,
            Peer::Learned(learned) => {
                let learned = learned.lock().unwrap_or_else(PoisonError::into_inner);
                match learned.as_deref() {
                    Some(path) => self.socket.try_send_to(frame, path)?,
                    None => return Err(Error::NoPeer),
                }
            }
        };

        if written != frame.len() {
            return Err(Error::Protocol(format!(
                "short write: {} of {} bytes",
                written,
                frame.len()
            )));
        }
        Ok(())
    }

    /// Wait until a refused send may succeed
    pub async fn send_ready(&self) -> Result<()> {
        self.socket.writable().await?;
        if !matches!(self.peer, Peer::Connected) {
            tokio::time::sleep(UNCONNECTED_RETRY).await;
        }
        Ok(())
    }

    /// Receive one datagram, remembering its sender when the peer is learned
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        match &self.peer {
            Peer::Connected => Ok(self.socket.recv(buf).await?),
            Peer::Learned(learned) => {
                let (len, addr) = self.socket.recv_from(buf).await?;
                if let Some(path) = addr.as_pathname() {
                    let mut current = learned.lock().unwrap_or_else(PoisonError::into_inner);
                    if current.as_deref() != Some(path) {
                        info!("decision process is now {}", path.display());
                        *current = Some(path.to_path_buf());
                    }
                }
                Ok(len)
            }
        }
    }

    pub fn has_peer(&self) -> bool {
        match &self.peer {
            Peer::Connected => true,
            Peer::Learned(learned) => learned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
        }
    }
}

impl Transport for DecisionChannel {
    fn try_send(&self, frame: &[u8]) -> Result<()> {
        DecisionChannel::try_send(self, frame)
    }

    fn send_ready(&self) -> impl Future<Output = Result<()>> + Send {
        DecisionChannel::send_ready(self)
    }

    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = Result<usize>> + Send {
        DecisionChannel::recv(self, buf)
    }
}

impl Drop for DecisionChannel {
    fn drop(&mut self) {
        if let Some(path) = &self.bound_path {
            if std::fs::remove_file(path).is_ok() {
                debug!("removed {}", path.display());
            }
        }
    }
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed stale socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}
