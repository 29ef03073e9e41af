//! AudioSocket TCP server.
//!
//! Accepts connections from the telephony switch and runs one handler
//! task per call. Handlers are tracked by a generated connection id so
//! shutdown can cancel them all and wait (bounded) for termination.
//! Resource release is structural: the pooled VAD endpointer and the
//! connection reader are freed by drops, so a cancelled handler cannot
//! leak them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Result, SwitchboardError};
use crate::pipeline::VoicePipeline;
use crate::protocol::connection::Connection;
use crate::routing::PhoneRouter;
use crate::session::Session;
use crate::state::{State, StateMachine};
use crate::vad::VadPool;

/// The switch must identify the call promptly after connecting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period for handler tasks during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Consecutive state-handler failures that end a call.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

const TURN_APOLOGY: &str = "I'm sorry, I'm having a little trouble. Let's try that again.";

/// TCP front end for the voice pipeline.
pub struct AudioSocketServer {
    config: Arc<Config>,
    pipeline: VoicePipeline,
    vad_pool: Arc<VadPool>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_conn_id: AtomicU64,
    running: AtomicBool,
    shutdown_signal: Notify,
}

impl AudioSocketServer {
    pub fn new(config: Arc<Config>, pipeline: VoicePipeline, vad_pool: Arc<VadPool>) -> Self {
        Self {
            config,
            pipeline,
            vad_pool,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            shutdown_signal: Notify::new(),
        }
    }

    /// Bind the listener. Separate from `run` so callers can learn the
    /// bound port (tests bind port 0).
    pub async fn bind(&self) -> Result<SocketAddr> {
        let listener =
            TcpListener::bind((self.config.audio.host.as_str(), self.config.audio.port)).await?;
        let addr = listener.local_addr()?;
        *self.listener.lock() = Some(Arc::new(listener));
        *self.local_addr.lock() = Some(addr);
        info!(%addr, "AudioSocket server listening");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Accept until `shutdown` is signalled, then drain handlers.
    pub async fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SwitchboardError::AlreadyRunning);
        }

        let listener = match self.listener.lock().clone() {
            Some(listener) => listener,
            None => {
                self.running.store(false, Ordering::Release);
                return Err(SwitchboardError::NotRunning);
            }
        };

        loop {
            tokio::select! {
                _ = self.shutdown_signal.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "new connection");
                        self.spawn_handler(stream, peer);
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        self.drain_connections().await;
        self.running.store(false, Ordering::Release);
        info!("AudioSocket server stopped");
        Ok(())
    }

    /// Signal `run` to stop accepting and drain. Safe to call from any
    /// task; idempotent.
    pub fn shutdown(&self) {
        self.shutdown_signal.notify_one();
    }

    fn spawn_handler(&self, stream: TcpStream, peer: SocketAddr) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let pipeline = self.pipeline.clone();
        let vad_pool = Arc::clone(&self.vad_pool);
        let config = Arc::clone(&self.config);
        let connections = Arc::clone(&self.connections);

        let handle = tokio::spawn(async move {
            handle_call(stream, peer, pipeline, vad_pool, config).await;
            connections.lock().remove(&conn_id);
        });
        self.connections.lock().insert(conn_id, handle);
    }

    async fn drain_connections(&self) {
        let handles: Vec<(u64, JoinHandle<()>)> = self.connections.lock().drain().collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "cancelling connection handlers");
        for (_, handle) in &handles {
            handle.abort();
        }
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for (conn_id, handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!(conn_id, "connection handler did not terminate gracefully");
            }
        }
    }
}

/// Full lifecycle of one call: handshake, route, session, conversation,
/// release.
async fn handle_call(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: VoicePipeline,
    vad_pool: Arc<VadPool>,
    config: Arc<Config>,
) {
    let connection =
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, Connection::open(stream, peer)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                warn!(%peer, "handshake failed: {e}");
                return;
            }
            Err(_) => {
                warn!(%peer, "handshake timed out");
                return;
            }
        };

    // Dial-plan routing happens before the greeting so direct-dialed
    // callers never hear the operator.
    let route = connection
        .dialed_extension()
        .filter(|ext| !ext.eq_ignore_ascii_case("operator"))
        .map(|ext| PhoneRouter::new().route(ext));

    let session = Arc::new(Session::new(Arc::clone(&connection), Arc::clone(&config)));
    let endpointer = vad_pool.acquire().await;
    session.install_vad(endpointer);

    let mut machine = StateMachine::new(Arc::clone(&session), route);
    run_conversation(&mut machine, &pipeline, &session).await;

    // Explicit on the normal path; drops cover the cancelled one.
    session.release_vad();
    session.hangup().await;
}

async fn run_conversation(
    machine: &mut StateMachine,
    pipeline: &VoicePipeline,
    session: &Arc<Session>,
) {
    let mut consecutive_errors = 0u32;
    let max_duration =
        Duration::from_secs_f64(session.config().timeouts.max_call_duration_secs.max(1.0));

    while session.is_active() && machine.state() != State::Hangup {
        if session.elapsed() >= max_duration {
            info!(call_id = %session.call_id(), "max call duration reached");
            break;
        }

        match machine.process(pipeline).await {
            Ok(()) => consecutive_errors = 0,
            Err(e) => {
                consecutive_errors += 1;
                error!(
                    call_id = %session.call_id(),
                    consecutive_errors,
                    "conversation error: {e}"
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(call_id = %session.call_id(), "too many consecutive errors, ending call");
                    break;
                }
                // Transient backend failure: apologize and keep listening.
                let _ = pipeline.speak(session, TURN_APOLOGY).await;
                machine.recover_to_listening();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{StubLlm, StubStt, StubTts};
    use crate::vad::{EnergyVad, Endpointer};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_server() -> Arc<AudioSocketServer> {
        let mut config = Config::default();
        config.audio.host = "127.0.0.1".into();
        config.audio.port = 0;
        let config = Arc::new(config);

        let pipeline = VoicePipeline::new(
            Arc::new(StubStt::new("hello")),
            Arc::new(StubLlm::new("Certainly, right away.")),
            Arc::new(StubTts::new(24_000, 8)),
            Arc::clone(&config),
        );
        let vad_config = config.vad.clone();
        let pool = Arc::new(VadPool::with_factory(2, move || {
            Endpointer::new(Box::new(EnergyVad::new()), vad_config.clone())
        }));
        Arc::new(AudioSocketServer::new(config, pipeline, pool))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_connection_whose_first_frame_is_not_uuid() {
        let server = test_server();
        let addr = server.bind().await.expect("bind");
        let run = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        // AUDIO frame before the UUID handshake.
        let bad = crate::protocol::Frame::audio(vec![0u8; 320]);
        stream.write_all(&bad.encode().unwrap()).await.unwrap();

        // The server closes without sending anything.
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("server should close promptly")
            .expect("read");
        assert_eq!(read, 0, "no audio may be emitted before a UUID handshake");

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(3), run)
            .await
            .expect("run should stop")
            .expect("join")
            .expect("run result");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_drains_active_handlers() {
        let server = test_server();
        let addr = server.bind().await.expect("bind");
        let run = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        let uuid = crate::protocol::Frame::new(
            crate::protocol::MessageType::Uuid,
            b"550e8400-e29b-41d4-a716-446655440000".to_vec(),
        );
        stream.write_all(&uuid.encode().unwrap()).await.unwrap();

        // Give the handler time to come up, then shut down mid-call.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.active_connections(), 1);

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(6), run)
            .await
            .expect("run should stop within the grace period")
            .expect("join")
            .expect("run result");
        assert_eq!(server.active_connections(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_twice_is_an_error() {
        let server = test_server();
        server.bind().await.expect("bind");
        let run = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = server.run().await;
        assert!(matches!(second, Err(SwitchboardError::AlreadyRunning)));

        server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(3), run).await;
    }
}
