//! # Link abstraction
//!
//! The session core does not implement any transport. It talks to the vehicle through the [Link] trait: a
//! message-oriented, possibly lossy and reordering transport to exactly one remote endpoint. Connection setup,
//! addressing and discovery belong to the link implementation.
//!
//! [loopback()] creates an in-process link together with the [RemoteEndpoint] that plays the vehicle side. It is
//! used by the tests and the demos to simulate a flight controller.

use crate::error::LinkError;
use crate::frame::Frame;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::Arc;
use std::time::Duration;

/// Transport to one remote endpoint
#[async_trait]
pub trait Link: Send + Sync {
    /// Send one message
    async fn send(&self, bytes: Vec<u8>) -> std::result::Result<(), LinkError>;

    /// Receive the next message
    ///
    /// Returns `None` once the link is closed. A closed link cannot be reopened.
    async fn recv(&self) -> Option<Vec<u8>>;

    /// True while the link can carry traffic
    fn is_open(&self) -> bool;

    /// Close the link
    async fn close(&self) {}
}

/// Create an in-process link and the endpoint acting as the remote vehicle
pub fn loopback() -> (LoopbackLink, RemoteEndpoint) {
    let (to_remote, from_local) = flume::unbounded();
    let (to_local, from_remote) = flume::unbounded();

    let link = LoopbackLink {
        tx: to_remote,
        rx: from_remote,
        open: AtomicBool::new(true),
    };
    let remote = RemoteEndpoint {
        tx: to_local,
        rx: from_local,
    };

    (link, remote)
}

/// Local side of a [loopback()] link
#[derive(Debug)]
pub struct LoopbackLink {
    tx: flume::Sender<Vec<u8>>,
    rx: flume::Receiver<Vec<u8>>,
    open: AtomicBool,
}

#[async_trait]
impl Link for LoopbackLink {
    async fn send(&self, bytes: Vec<u8>) -> std::result::Result<(), LinkError> {
        if !self.is_open() {
            return Err(LinkError::Fatal("link closed".to_owned()));
        }
        self.tx
            .send_async(bytes)
            .await
            .map_err(|_| LinkError::Fatal("remote endpoint dropped".to_owned()))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        if !self.is_open() {
            return None;
        }
        self.rx.recv_async().await.ok()
    }

    fn is_open(&self) -> bool {
        self.open.load(Relaxed) && !self.tx.is_disconnected()
    }

    async fn close(&self) {
        self.open.store(false, Relaxed);
    }
}

/// Vehicle side of a [loopback()] link
#[derive(Debug)]
pub struct RemoteEndpoint {
    tx: flume::Sender<Vec<u8>>,
    rx: flume::Receiver<Vec<u8>>,
}

impl RemoteEndpoint {
    /// Send a frame to the local side
    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.tx
            .send_async(frame.to_bytes())
            .await
            .map_err(|_| Error::Disconnected)
    }

    /// Wait for the next frame sent by the local side
    ///
    /// Messages that do not parse as a frame are skipped.
    pub async fn recv_frame(&self) -> Result<Frame> {
        loop {
            let bytes = self.rx.recv_async().await?;
            if let Ok(frame) = Frame::from_bytes(&bytes) {
                return Ok(frame);
            }
        }
    }

    /// Same as [RemoteEndpoint::recv_frame()] with a time limit
    pub async fn recv_frame_timeout(&self, timeout: Duration) -> Result<Frame> {
        tokio::time::timeout(timeout, self.recv_frame())
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Frames already queued by the local side, without waiting
    pub fn drain_frames(&self) -> Vec<Frame> {
        self.rx
            .drain()
            .filter_map(|bytes| Frame::from_bytes(&bytes).ok())
            .collect()
    }
}

/// Shared sending half of a link
///
/// All subsystems send through the uplink. The setpoint traffic additionally requires the [LinkLease], which only
/// one offboard session can hold at a time.
#[derive(Clone)]
pub struct Uplink {
    link: Arc<dyn Link>,
    leased: Arc<AtomicBool>,
}

impl Uplink {
    pub(crate) fn new(link: Arc<dyn Link>) -> Self {
        Self {
            link,
            leased: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Send a frame over the link
    pub async fn send_frame(&self, frame: &Frame) -> std::result::Result<(), LinkError> {
        self.link.send(frame.to_bytes()).await
    }

    /// True while the underlying link is open
    pub fn is_open(&self) -> bool {
        self.link.is_open()
    }

    /// Take the exclusive setpoint transmission lease
    ///
    /// Fails with [Error::LinkBusy] if the lease is already held. The lease is released when dropped.
    pub fn acquire_lease(&self) -> Result<LinkLease> {
        self.leased
            .compare_exchange(false, true, AcqRel, Acquire)
            .map_err(|_| Error::LinkBusy)?;

        Ok(LinkLease {
            leased: self.leased.clone(),
        })
    }

    /// True if an offboard session currently holds the lease
    pub fn is_leased(&self) -> bool {
        self.leased.load(Acquire)
    }
}

impl std::fmt::Debug for Uplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uplink")
            .field("open", &self.is_open())
            .field("leased", &self.is_leased())
            .finish()
    }
}

/// Exclusive right to stream setpoints over one link
#[derive(Debug)]
pub struct LinkLease {
    leased: Arc<AtomicBool>,
}

impl Drop for LinkLease {
    fn drop(&mut self) {
        self.leased.store(false, Release);
    }
}
