//! One live AudioSocket connection.
//!
//! ## Lifecycle
//!
//! ```text
//! Connection::open(stream)
//!     └─► UUID handshake (first frame MUST be UUID)
//!         └─► background reader task: frames → audio / DTMF queues
//!             └─► HANGUP / ERROR / EOF / malformed frame → closed
//! ```
//!
//! The reader task owns the read half; everything else talks to the
//! connection through the bounded queues and the serialized writer. The
//! reader is aborted when the `Connection` is dropped, so an aborted call
//! handler cannot leak it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::{BoundedQueue, OverflowPolicy};
use super::{write_audio, write_hangup, Frame, MessageType};
use crate::error::{Result, SwitchboardError};

/// ~2 seconds of 20 ms chunks.
pub const AUDIO_QUEUE_CAPACITY: usize = 100;
/// More digits than any number the caller could sensibly dial.
pub const DTMF_QUEUE_CAPACITY: usize = 32;

/// State shared with the background reader task.
struct ConnectionShared {
    call_id: String,
    audio: BoundedQueue<Vec<u8>>,
    dtmf: BoundedQueue<char>,
    active: AtomicBool,
}

impl ConnectionShared {
    fn mark_closed(&self) {
        self.active.store(false, Ordering::Release);
        self.audio.close();
        self.dtmf.close();
    }
}

/// An accepted call after its UUID handshake.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    dialed_extension: Option<String>,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("call_id", &self.shared.call_id)
            .field("dialed_extension", &self.dialed_extension)
            .field("peer", &self.peer)
            .finish()
    }
}

impl Connection {
    /// Perform the UUID handshake on a fresh stream and start the reader.
    ///
    /// # Errors
    /// - `Protocol` when the first frame is anything but UUID, or the UUID
    ///   payload is malformed. No audio is ever emitted on such streams.
    /// - `ConnectionClosed` when the peer disconnects before the handshake.
    pub async fn open<S>(stream: S, peer: SocketAddr) -> Result<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, write_half) = tokio::io::split(stream);

        let first = Frame::read(&mut read_half)
            .await?
            .ok_or(SwitchboardError::ConnectionClosed)?;
        if first.kind != MessageType::Uuid {
            return Err(SwitchboardError::Protocol(format!(
                "expected UUID handshake, got {:?}",
                first.kind
            )));
        }
        let (call_id, dialed_extension) = first.uuid_parts()?;
        info!(call_id = %call_id, extension = ?dialed_extension, %peer, "call started");

        let shared = Arc::new(ConnectionShared {
            call_id,
            audio: BoundedQueue::new(AUDIO_QUEUE_CAPACITY, OverflowPolicy::DropOldest, "audio"),
            dtmf: BoundedQueue::new(DTMF_QUEUE_CAPACITY, OverflowPolicy::DropNewest, "dtmf"),
            active: AtomicBool::new(true),
        });

        let reader_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            reader_loop(reader_shared, read_half).await;
        });

        let connection = Arc::new(Self {
            shared,
            dialed_extension,
            peer,
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            reader_task: parking_lot::Mutex::new(Some(task)),
        });
        Ok(connection)
    }

    pub fn call_id(&self) -> &str {
        &self.shared.call_id
    }

    pub fn dialed_extension(&self) -> Option<&str> {
        self.dialed_extension.as_deref()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Next inbound audio chunk, or `None` on timeout / closed connection.
    pub async fn read_audio(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.shared.audio.get_timeout(timeout).await
    }

    /// Next DTMF digit, or `None` on timeout / closed connection.
    pub async fn read_dtmf(&self, timeout: Duration) -> Option<char> {
        self.shared.dtmf.get_timeout(timeout).await
    }

    pub fn has_dtmf(&self) -> bool {
        self.shared.dtmf.has_items()
    }

    /// Send one AUDIO frame. A write failure closes the connection.
    pub async fn send_audio(&self, audio: &[u8]) -> Result<()> {
        if !self.is_active() {
            return Err(SwitchboardError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        match write_audio(&mut *writer, audio).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.mark_closed();
                Err(e)
            }
        }
    }

    /// Send a HANGUP frame; failures are irrelevant because the connection
    /// is being torn down either way.
    pub async fn send_hangup(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = write_hangup(&mut *writer).await {
            debug!(call_id = %self.shared.call_id, "hangup write failed: {e}");
        }
    }

    /// Stop the reader, wake queue waiters, and shut the socket down.
    pub async fn close(&self) {
        self.shared.mark_closed();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        info!(call_id = %self.shared.call_id, "call ended");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.mark_closed();
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
    }
}

async fn reader_loop<R>(shared: Arc<ConnectionShared>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        if !shared.active.load(Ordering::Acquire) {
            break;
        }
        match Frame::read(&mut reader).await {
            Ok(Some(frame)) => match frame.kind {
                MessageType::Audio => {
                    shared.audio.try_put(frame.payload);
                }
                MessageType::Dtmf => {
                    if let Some(digit) = frame.as_dtmf() {
                        debug!(call_id = %shared.call_id, digit = %digit, "DTMF received");
                        shared.dtmf.try_put(digit);
                    }
                }
                MessageType::Hangup => {
                    info!(call_id = %shared.call_id, "hangup received");
                    break;
                }
                MessageType::Error => {
                    warn!(
                        call_id = %shared.call_id,
                        message = %String::from_utf8_lossy(&frame.payload),
                        "error frame from switch"
                    );
                    break;
                }
                MessageType::Uuid => {
                    debug!(call_id = %shared.call_id, "duplicate UUID frame ignored");
                }
            },
            Ok(None) => {
                debug!(call_id = %shared.call_id, "connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(call_id = %shared.call_id, "read error: {e}");
                break;
            }
        }
    }
    shared.mark_closed();
}
