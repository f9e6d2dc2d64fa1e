//! Bounded in-process channel transport
//!
//! Backs the socket traits with `tokio::sync::mpsc` so a full bus topology
//! can run inside one process: the hub binary wires the scheduler into the
//! router this way, and every test uses it in place of a broker. The
//! channel capacity is the socket's high-water-mark.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::Envelope;
use crate::transport::{ControlSocket, MessageSocket, TransportError, TransportResult};

/// One endpoint of a bidirectional channel socket pair.
///
/// Sends go to the peer endpoint's receive queue and vice versa. One-way
/// (push/pull style) links simply never use the reverse direction.
pub struct ChannelSocket {
    name: String,
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
    closed: AtomicBool,
}

impl ChannelSocket {
    fn new(name: String, tx: mpsc::Sender<Envelope>, rx: mpsc::Receiver<Envelope>) -> Self {
        Self {
            name,
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed {
                socket: self.name.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for ChannelSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSocket")
            .field("name", &self.name)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl MessageSocket for ChannelSocket {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_recv(&self) -> TransportResult<Option<Envelope>> {
        self.ensure_open()?;

        // The lock is only contended if a second task polls the same
        // endpoint, which the single-threaded router loop never does.
        let mut rx = self.rx.lock().expect("channel receiver lock poisoned");
        match rx.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            // A hung-up peer with a drained queue reads as quiet, not as an
            // error the poll loop should count every sweep.
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    fn try_send(&self, envelope: Envelope) -> TransportResult<()> {
        self.ensure_open()?;

        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(TransportError::Saturated {
                socket: self.name.clone(),
            }),
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed {
                socket: self.name.clone(),
            }),
        }
    }

    async fn send(&self, envelope: Envelope) -> TransportResult<()> {
        self.ensure_open()?;

        self.tx
            .send(envelope)
            .await
            .map_err(|_| TransportError::Closed {
                socket: self.name.clone(),
            })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Build a connected socket pair with the given high-water-mark.
///
/// The endpoints are named `<name>` and `<name>.peer` so both sides stay
/// distinguishable in logs and route dumps.
pub fn channel_pair(name: &str, capacity: usize) -> (ChannelSocket, ChannelSocket) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    let near = ChannelSocket::new(name.to_string(), a_tx, a_rx);
    let far = ChannelSocket::new(format!("{name}.peer"), b_tx, b_rx);

    (near, far)
}

/// Server end of the in-process control channel; handed to the router.
pub struct ChannelControlSocket {
    request_rx: Mutex<mpsc::Receiver<String>>,
    reply_tx: mpsc::Sender<String>,
}

impl fmt::Debug for ChannelControlSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelControlSocket").finish_non_exhaustive()
    }
}

#[async_trait]
impl ControlSocket for ChannelControlSocket {
    fn try_recv(&self) -> TransportResult<Option<String>> {
        let mut rx = self
            .request_rx
            .lock()
            .expect("control receiver lock poisoned");
        match rx.try_recv() {
            Ok(request) => Ok(Some(request)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => Ok(None),
        }
    }

    async fn send(&self, reply: String) -> TransportResult<()> {
        self.reply_tx
            .send(reply)
            .await
            .map_err(|_| TransportError::Closed {
                socket: "control".to_string(),
            })
    }
}

/// Client end of the in-process control channel.
///
/// Requests and replies alternate strictly, enforced by holding the
/// client's internal lock across the full round trip.
pub struct ControlClient {
    inner: tokio::sync::Mutex<(mpsc::Sender<String>, mpsc::Receiver<String>)>,
}

impl ControlClient {
    /// Send one request and wait for its reply.
    pub async fn request(&self, body: impl Into<String>) -> TransportResult<String> {
        let mut inner = self.inner.lock().await;

        inner
            .0
            .send(body.into())
            .await
            .map_err(|_| TransportError::Closed {
                socket: "control".to_string(),
            })?;

        inner.1.recv().await.ok_or(TransportError::Closed {
            socket: "control".to_string(),
        })
    }

    /// Send a request without waiting for a reply.
    ///
    /// Unparsable requests are dropped by the router without an answer, so
    /// a round-trip `request` would wait forever on them.
    pub async fn send_raw(&self, body: impl Into<String>) -> TransportResult<()> {
        let inner = self.inner.lock().await;

        inner
            .0
            .send(body.into())
            .await
            .map_err(|_| TransportError::Closed {
                socket: "control".to_string(),
            })
    }
}

impl fmt::Debug for ControlClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlClient").finish_non_exhaustive()
    }
}

/// Build a connected control client/server pair.
pub fn control_channel(capacity: usize) -> (ControlClient, ChannelControlSocket) {
    let (request_tx, request_rx) = mpsc::channel(capacity);
    let (reply_tx, reply_rx) = mpsc::channel(capacity);

    let client = ControlClient {
        inner: tokio::sync::Mutex::new((request_tx, reply_rx)),
    };

    let server = ChannelControlSocket {
        request_rx: Mutex::new(request_rx),
        reply_tx,
    };

    (client, server)
}
