//! TCP bridge between one bus client and the simulated engine.
//!
//! Frames travel as JSON objects separated by whitespace, usually one per
//! CRLF-terminated line. Inbound frames are dispatched
//! into the engine in arrival order; outbound frames queued by the engine are
//! written by a single writer task to whichever client is current.

use crate::dispatch::DispatchTable;
use crate::engine::SimEngine;
use crate::frame::BusFrame;
use crate::packets::{NodeType, Packet, PacketError, PongPacket, SensorDataPacket};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

/// Most inbound bytes that may sit undecoded while a frame is incomplete.
pub const MAX_PENDING_FRAME_SIZE: usize = 512;

const READ_CHUNK_SIZE: usize = 512;

/// Engine-side handle for emitting frames towards the bridge.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<BusFrame>,
}

/// Creates the bounded queue between the engine and the bridge's writer.
pub fn outbound_channel(capacity: usize) -> (FrameSender, mpsc::Receiver<BusFrame>) {
    let (tx, rx) = mpsc::channel(capacity);
    (FrameSender { tx }, rx)
}

impl FrameSender {
    pub fn send_frame(&self, frame: BusFrame) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    pub fn send_sensor_value(&self, sensor_id: u8, value: u32) -> Result<(), SendError> {
        let frame = SensorDataPacket {
            sensor_id,
            sensor_data: value,
        }
        .to_frame()?;
        self.send_frame(frame)
    }

    pub fn send_pong(&self, node_id: u8, node_type: NodeType) -> Result<(), SendError> {
        let frame = PongPacket { node_id, node_type }.to_frame()?;
        self.send_frame(frame)
    }
}

#[derive(Debug)]
struct ClientConnection {
    id: u64,
    peer: SocketAddr,
    // Every outbound write to this client goes through this lock
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    // Stops the read loop once the connection is closed from the write side
    closed: Arc<Notify>,
}

pub struct BusBridge {
    listener: TcpListener,
    local_addr: SocketAddr,
    engine: Arc<SimEngine>,
    dispatch: DispatchTable,
    current: Mutex<Option<Arc<ClientConnection>>>,
    next_connection_id: AtomicU64,
}

impl BusBridge {
    /// Binds the listening socket. Failure here is fatal for the simulator.
    pub async fn bind(addr: &str, engine: Arc<SimEngine>) -> Result<Arc<Self>, BridgeError> {
        Self::bind_with_table(addr, engine, DispatchTable::standard()).await
    }

    pub async fn bind_with_table(
        addr: &str,
        engine: Arc<SimEngine>,
        dispatch: DispatchTable,
    ) -> Result<Arc<Self>, BridgeError> {
        let bind_error = |source| BridgeError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(%local_addr, "bus bridge listening");

        Ok(Arc::new(Self {
            listener,
            local_addr,
            engine,
            dispatch,
            current: Mutex::new(None),
            next_connection_id: AtomicU64::new(1),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &Arc<SimEngine> {
        &self.engine
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<ClientConnection>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_connection(&self) -> Option<Arc<ClientConnection>> {
        self.current().clone()
    }

    /// Address of the client that currently receives outbound frames.
    pub fn current_peer(&self) -> Option<SocketAddr> {
        self.current().as_ref().map(|connection| connection.peer)
    }

    pub fn has_client(&self) -> bool {
        self.current().is_some()
    }

    // Clears the current client only if it is still the connection `id`
    fn release(&self, id: u64) -> bool {
        let mut current = self.current();
        if current.as_ref().is_some_and(|connection| connection.id == id) {
            *current = None;
            true
        } else {
            false
        }
    }

    /// Accepts clients until `shutdown` fires. The newest client replaces the
    /// previous one as the target of outbound frames.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "could not disable nagle");
            }

            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let (reader, writer) = stream.into_split();
            let closed = Arc::new(Notify::new());
            let connection = Arc::new(ClientConnection {
                id,
                peer,
                writer: tokio::sync::Mutex::new(writer),
                closed: Arc::clone(&closed),
            });

            let previous = self.current().replace(connection);
            match previous {
                Some(previous) => info!(%peer, replaced = %previous.peer, "client connected, replacing previous client"),
                None => info!(%peer, "client connected"),
            }

            let bridge = Arc::clone(&self);
            let read_shutdown = shutdown.clone();
            tokio::spawn(async move {
                bridge.read_loop(id, peer, reader, &closed, read_shutdown).await;
            });
        }

        let last = self.current().take();
        if let Some(connection) = last {
            let _ = connection.writer.lock().await.shutdown().await;
        }
        info!("bus bridge stopped accepting clients");
    }

    async fn read_loop(
        &self,
        id: u64,
        peer: SocketAddr,
        reader: OwnedReadHalf,
        closed: &Notify,
        mut shutdown: watch::Receiver<bool>,
    ) {
        match self.read_frames(reader, closed, &mut shutdown).await {
            Ok(()) => debug!(%peer, "client read loop finished"),
            Err(e) => error!(%peer, error = %e, "protocol fault, closing client connection"),
        }

        if self.release(id) {
            info!(%peer, "client disconnected");
        }
    }

    async fn read_frames(
        &self,
        mut reader: OwnedReadHalf,
        closed: &Notify,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), BridgeError> {
        let mut pending = Vec::with_capacity(MAX_PENDING_FRAME_SIZE + READ_CHUNK_SIZE);
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            let read = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                () = closed.notified() => return Ok(()),
                read = reader.read(&mut chunk) => read,
            };

            let len = match read {
                Ok(0) => return Ok(()),
                Ok(len) => len,
                Err(e) if is_disconnect(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            pending.extend_from_slice(&chunk[..len]);
            let consumed = self.dispatch_pending(&pending)?;
            pending.drain(..consumed);

            if pending.len() > MAX_PENDING_FRAME_SIZE {
                return Err(BridgeError::FrameTooLong {
                    limit: MAX_PENDING_FRAME_SIZE,
                });
            }
        }
    }

    // Dispatches every complete frame in `pending` and returns how many bytes
    // were consumed. A frame cut off at the end is left for the next read.
    fn dispatch_pending(&self, pending: &[u8]) -> Result<usize, BridgeError> {
        let mut frames = serde_json::Deserializer::from_slice(pending).into_iter::<BusFrame>();
        loop {
            match frames.next() {
                Some(Ok(frame)) => self.dispatch(&frame),
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        Ok(frames.byte_offset())
    }

    /// Routes one inbound frame into the engine. Frames whose payload does
    /// not decode are logged and dropped.
    pub fn dispatch(&self, frame: &BusFrame) {
        if let Err(e) = self.dispatch.dispatch(&self.engine, frame) {
            warn!(identifier = frame.identifier(), error = %e, "dropping undecodable frame");
        }
    }

    /// Writes `frame` to the current client, if any.
    ///
    /// A failed write drops that client; later sends are no-ops until a new
    /// client connects. Sending without a client is not an error.
    pub async fn send(&self, frame: &BusFrame) -> Result<(), BridgeError> {
        let Some(connection) = self.current_connection() else {
            return Ok(());
        };

        let mut bytes = serde_json::to_vec(frame)?;
        bytes.extend_from_slice(b"\r\n");

        let mut writer = connection.writer.lock().await;
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(peer = %connection.peer, error = %e, "write to client failed, dropping connection");
            let _ = writer.shutdown().await;
            drop(writer);
            connection.closed.notify_one();
            self.release(connection.id);
        }

        Ok(())
    }

    /// Drains frames queued by the engine and writes them out one at a time.
    pub async fn run_outbound(
        self: Arc<Self>,
        mut outbound: mpsc::Receiver<BusFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            if let Err(e) = self.send(&frame).await {
                warn!(identifier = frame.identifier(), error = %e, "failed to send frame");
            }
        }
        debug!("outbound writer stopped");
    }
}

impl core::fmt::Debug for BusBridge {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusBridge")
            .field("local_addr", &self.local_addr)
            .field("current_peer", &self.current_peer())
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("cannot encode frame: {0}")]
    Encode(#[from] PacketError),
    #[error("outbound queue is full")]
    QueueFull,
    #[error("outbound queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("incomplete frame exceeds {limit} bytes")]
    FrameTooLong { limit: usize },
}
