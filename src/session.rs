//! Connection session engine.
//!
//! A [`Session`] owns one terminal connection. [`Session::start`] splits the
//! transport and runs two tasks:
//! 1. Reader: read bytes, decode frames, dispatch messages, join the terminal
//! 2. Writer: default replies, reissue echoes, active commands and their deadlines
//!
//! The returned [`SessionHandle`] stops the session, submits active commands
//! and waits for teardown.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use jt808_gateway::{HandlerRegistry, NoopEvents, Session, SessionConfig, TerminalDirectory};
//!
//! let directory = Arc::new(TerminalDirectory::new());
//! let session = Session::new(
//!     stream,
//!     HandlerRegistry::with_builtins(),
//!     directory.clone(),
//!     Arc::new(NoopEvents),
//!     SessionConfig::default(),
//! )?;
//! let handle = session.start();
//! handle.wait().await;
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};

use crate::active::{ActiveMessage, ActiveSender};
use crate::config::SessionConfig;
use crate::error::{GatewayError, Result};
use crate::handler::{HandlerRegistry, TerminalEvents};
use crate::protocol::{command, FrameBuffer, Message};
use crate::writer::{spawn_writer_task, WriterChannels};

/// Identity management for sessions.
///
/// `join` is attempted with the first dispatched message of a session and
/// retried on later messages until it succeeds. Returning
/// [`GatewayError::KeyExist`] stops the session. `leave` is called once, on
/// stop, and only for sessions that joined.
pub trait SessionHooks: Send + Sync + 'static {
    /// Claim an identity key for the terminal that sent `msg`.
    fn join(&self, msg: &Message, active: ActiveSender) -> Result<String>;

    /// Release a key previously returned by `join`.
    fn leave(&self, key: &str);
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Built, tasks not spawned.
    Created,
    /// Reader and writer are running.
    Running,
    /// Stop requested, tasks tearing down.
    Stopping,
    /// Both tasks exited.
    Stopped,
}

impl SessionState {
    /// True once stop has been requested.
    #[inline]
    pub fn is_stopping(self) -> bool {
        matches!(self, SessionState::Stopping | SessionState::Stopped)
    }
}

/// A terminal connection that has not been started yet.
pub struct Session<S> {
    stream: S,
    registry: HandlerRegistry,
    hooks: Arc<dyn SessionHooks>,
    events: Arc<dyn TerminalEvents>,
    config: SessionConfig,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a session over a connected transport.
    ///
    /// Fails with [`GatewayError::Config`] if `config` does not validate.
    pub fn new(
        stream: S,
        registry: HandlerRegistry,
        hooks: Arc<dyn SessionHooks>,
        events: Arc<dyn TerminalEvents>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            stream,
            registry,
            hooks,
            events,
            config,
        })
    }

    /// State of a session that has not been started.
    pub fn state(&self) -> SessionState {
        SessionState::Created
    }

    /// Spawn the reader and writer tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> SessionHandle {
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity);
        let (active_tx, active_rx) = mpsc::channel(self.config.active_capacity);
        let (reissue_tx, reissue_rx) = mpsc::channel(self.config.reissue_capacity);
        let (state, state_rx) = watch::channel(SessionState::Running);

        let shared = Arc::new(Shared {
            state,
            stopping: AtomicBool::new(false),
            running_tasks: AtomicUsize::new(2),
            key: OnceLock::new(),
            hooks: self.hooks,
            events: self.events.clone(),
            active: active_tx,
        });

        let (read_half, write_half) = tokio::io::split(self.stream);

        let channels = WriterChannels {
            inbound: inbound_rx,
            active: active_rx,
            reissue: reissue_rx,
            shutdown: state_rx.clone(),
        };
        let writer_task = spawn_writer_task(
            write_half,
            self.registry.clone(),
            self.events,
            &self.config,
            channels,
        );
        let writer_shared = shared.clone();
        tokio::spawn(async move {
            if let Err(e) = writer_task.await {
                tracing::error!("Writer task failed: {}", e);
            }
            writer_shared.stop();
            writer_shared.task_exited();
        });

        let reader = ReaderLoop {
            shared: shared.clone(),
            registry: self.registry,
            frames: FrameBuffer::with_mode(self.config.reassembly_mode),
            inbound: inbound_tx,
            reissue: reissue_tx,
            filter_incomplete_events: self.config.filter_incomplete_events,
        };
        let reader_shared = shared.clone();
        let buffer_size = self.config.read_buffer_size;
        tokio::spawn(async move {
            reader.run(read_half, state_rx, buffer_size).await;
            reader_shared.stop();
            reader_shared.task_exited();
        });

        SessionHandle { shared }
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Stop the session. Safe to call any number of times from any task.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Identity key, once the terminal has joined.
    pub fn key(&self) -> Option<&str> {
        self.shared.key.get().map(String::as_str)
    }

    /// Sender for submitting active commands to this session.
    pub fn active_sender(&self) -> ActiveSender {
        self.shared.active.clone()
    }

    /// Submit an active command.
    pub async fn submit(&self, msg: ActiveMessage) -> Result<()> {
        self.shared
            .active
            .send(msg)
            .await
            .map_err(|_| GatewayError::ConnectionClosed)
    }

    /// Wait until both tasks have exited.
    pub async fn wait(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|state| *state == SessionState::Stopped)
            .await;
    }
}

/// State shared by the handle and both tasks.
struct Shared {
    state: watch::Sender<SessionState>,
    /// Guards the one-time stop transition.
    stopping: AtomicBool,
    running_tasks: AtomicUsize,
    key: OnceLock<String>,
    hooks: Arc<dyn SessionHooks>,
    events: Arc<dyn TerminalEvents>,
    active: ActiveSender,
}

impl Shared {
    fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }

        // Leave before the tasks see the signal, so a replacement session
        // can never join ahead of this leave.
        let key = self.key.get().map(String::as_str);
        if let Some(key) = key {
            self.hooks.leave(key);
        }
        self.events.on_leave(key);
        tracing::debug!(key = ?key, "Session stopping");

        self.state.send_replace(SessionState::Stopping);
    }

    fn task_exited(&self) {
        if self.running_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.send_replace(SessionState::Stopped);
        }
    }

    fn joined(&self) -> bool {
        self.key.get().is_some()
    }
}

struct ReaderLoop {
    shared: Arc<Shared>,
    registry: HandlerRegistry,
    frames: FrameBuffer,
    inbound: mpsc::Sender<Message>,
    reissue: mpsc::Sender<Message>,
    filter_incomplete_events: bool,
}

impl ReaderLoop {
    async fn run<R>(
        mut self,
        mut reader: R,
        mut shutdown: watch::Receiver<SessionState>,
        buffer_size: usize,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; buffer_size];

        loop {
            let read = tokio::select! {
                biased;

                _ = stopping(&mut shutdown) => break,
                read = reader.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => {
                    tracing::debug!(joined = self.shared.joined(), "Connection closed");
                    break;
                }
                Ok(n) => n,
                Err(e) if is_disconnect(&e) => {
                    tracing::debug!(joined = self.shared.joined(), "Connection closed: {}", e);
                    break;
                }
                Err(e) => {
                    tracing::error!(joined = self.shared.joined(), "Read error: {}", e);
                    break;
                }
            };

            let messages = match self.frames.push(&buf[..n]) {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::error!(
                        joined = self.shared.joined(),
                        data = %hex::encode(&buf[..n]),
                        "Decode error: {}",
                        e
                    );
                    break;
                }
            };

            if !self.dispatch_all(messages).await {
                break;
            }
        }

        self.frames.clear();
    }

    /// Returns false when the session must stop.
    async fn dispatch_all(&mut self, messages: Vec<Message>) -> bool {
        for msg in messages {
            if !self.dispatch(msg).await {
                return false;
            }
        }
        true
    }

    async fn dispatch(&mut self, mut msg: Message) -> bool {
        let handler = match self.registry.get(msg.command()) {
            Some(handler) => handler,
            None => {
                self.shared.events.on_not_supported(&msg);
                return true;
            }
        };
        msg.handler = Some(handler.clone());

        if msg.command() == command::P8003_REISSUE_SUB_PACKAGE {
            tracing::debug!(phone = %msg.phone(), "Routing sub-package reissue request");
            return self.reissue.send(msg).await.is_ok();
        }

        if !self.filter_incomplete_events || msg.is_complete() {
            handler.on_read_execution_event(&msg);
            self.shared.events.on_read_execution(&msg);
        }

        if !self.shared.joined() && !self.join(&msg) {
            return false;
        }

        // Blocks while the writer is behind
        self.inbound.send(msg).await.is_ok()
    }

    /// Returns false if another session owns this terminal.
    fn join(&self, msg: &Message) -> bool {
        let outcome = self.shared.hooks.join(msg, self.shared.active.clone());
        if let Ok(key) = &outcome {
            let _ = self.shared.key.set(key.clone());
        }
        self.shared.events.on_join(msg, &outcome);

        match outcome {
            Ok(_) => true,
            Err(e) if e.is_fatal() => {
                tracing::warn!(
                    phone = %msg.phone(),
                    data = %hex::encode(&msg.raw),
                    "Join rejected: {}",
                    e
                );
                false
            }
            Err(e) => {
                tracing::warn!(phone = %msg.phone(), "Join failed, retrying on next message: {}", e);
                true
            }
        }
    }
}

/// Resolves once the session is stopping or its state sender is gone.
pub(crate) async fn stopping(shutdown: &mut watch::Receiver<SessionState>) {
    let _ = shutdown.wait_for(|state| state.is_stopping()).await;
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    use crate::error::ErrorKind;
    use crate::handler::NoopEvents;
    use crate::protocol::{Header, ProtocolVersion};

    const HEARTBEAT_2019: &str = "7e000240000100000000017299841738ffff027e";

    #[derive(Default)]
    struct RecordingHooks {
        joins: Mutex<Vec<String>>,
        leaves: Mutex<Vec<String>>,
        reject_first: AtomicBool,
        duplicate: AtomicBool,
    }

    impl SessionHooks for RecordingHooks {
        fn join(&self, msg: &Message, _active: ActiveSender) -> Result<String> {
            self.joins.lock().unwrap().push(msg.phone().to_string());
            if self.duplicate.load(Ordering::SeqCst) {
                return Err(GatewayError::KeyExist(msg.phone().to_string()));
            }
            if self.reject_first.swap(false, Ordering::SeqCst) {
                return Err(GatewayError::TerminalNotFound("not yet".into()));
            }
            Ok(msg.phone().to_string())
        }

        fn leave(&self, key: &str) {
            self.leaves.lock().unwrap().push(key.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        not_supported: AtomicUsize,
        joins: AtomicUsize,
        leaves: Mutex<Vec<Option<String>>>,
        reads: AtomicUsize,
    }

    impl TerminalEvents for RecordingEvents {
        fn on_not_supported(&self, _msg: &Message) {
            self.not_supported.fetch_add(1, Ordering::SeqCst);
        }

        fn on_join(&self, _msg: &Message, _outcome: &Result<String>) {
            self.joins.fetch_add(1, Ordering::SeqCst);
        }

        fn on_leave(&self, key: Option<&str>) {
            self.leaves.lock().unwrap().push(key.map(str::to_string));
        }

        fn on_read_execution(&self, _msg: &Message) {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn start_session(
        hooks: Arc<RecordingHooks>,
        events: Arc<RecordingEvents>,
    ) -> (SessionHandle, DuplexStream) {
        let (client, server) = duplex(4096);
        let session = Session::new(
            server,
            HandlerRegistry::with_builtins(),
            hooks,
            events,
            SessionConfig::default(),
        )
        .unwrap();
        assert_eq!(session.state(), SessionState::Created);
        (session.start(), client)
    }

    async fn read_reply(terminal: &mut DuplexStream) -> String {
        let mut buf = [0u8; 256];
        let n = terminal.read(&mut buf).await.unwrap();
        hex::encode(&buf[..n])
    }

    #[tokio::test]
    async fn test_heartbeat_reply_and_join() {
        let hooks = Arc::new(RecordingHooks::default());
        let events = Arc::new(RecordingEvents::default());
        let (handle, mut terminal) = start_session(hooks.clone(), events.clone());
        assert_eq!(handle.state(), SessionState::Running);

        terminal
            .write_all(&hex::decode(HEARTBEAT_2019).unwrap())
            .await
            .unwrap();
        assert_eq!(
            read_reply(&mut terminal).await,
            "7e8001400501000000000172998417380000ffff000200867e"
        );

        assert_eq!(handle.key(), Some("00000000017299841738"));
        assert_eq!(events.reads.load(Ordering::SeqCst), 1);
        assert_eq!(events.joins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_command_not_written() {
        let hooks = Arc::new(RecordingHooks::default());
        let events = Arc::new(RecordingEvents::default());
        let (handle, mut terminal) = start_session(hooks.clone(), events.clone());

        // 0x0900 has no handler; the heartbeat after it gets serial 0
        let unknown = "7e090000000123456789010001807e";
        terminal.write_all(&hex::decode(unknown).unwrap()).await.unwrap();
        terminal
            .write_all(&hex::decode(HEARTBEAT_2019).unwrap())
            .await
            .unwrap();

        let reply = read_reply(&mut terminal).await;
        assert!(reply.starts_with("7e8001"));
        assert_eq!(&reply[32..36], "0000");
        assert_eq!(events.not_supported.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.joins.lock().unwrap().len(), 1);
        handle.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let hooks = Arc::new(RecordingHooks::default());
        let events = Arc::new(RecordingEvents::default());
        let (handle, mut terminal) = start_session(hooks.clone(), events.clone());

        terminal
            .write_all(&hex::decode(HEARTBEAT_2019).unwrap())
            .await
            .unwrap();
        read_reply(&mut terminal).await;

        handle.stop();
        handle.stop();
        handle.clone().stop();
        handle.wait().await;

        assert_eq!(handle.state(), SessionState::Stopped);
        assert_eq!(*hooks.leaves.lock().unwrap(), vec!["00000000017299841738"]);
        assert_eq!(
            *events.leaves.lock().unwrap(),
            vec![Some("00000000017299841738".to_string())]
        );

        // Transport is released once both tasks exit
        let mut buf = [0u8; 16];
        assert_eq!(terminal.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_eof_stops_without_leave_when_never_joined() {
        let hooks = Arc::new(RecordingHooks::default());
        let events = Arc::new(RecordingEvents::default());
        let (handle, terminal) = start_session(hooks.clone(), events.clone());

        drop(terminal);
        handle.wait().await;

        assert!(hooks.leaves.lock().unwrap().is_empty());
        assert_eq!(*events.leaves.lock().unwrap(), vec![None]);
    }

    #[tokio::test]
    async fn test_decode_error_stops_session() {
        let hooks = Arc::new(RecordingHooks::default());
        let events = Arc::new(RecordingEvents::default());
        let (handle, mut terminal) = start_session(hooks.clone(), events.clone());

        // Heartbeat with a wrong checksum
        let corrupt = "7e000240000100000000017299841738ffff037e";
        terminal.write_all(&hex::decode(corrupt).unwrap()).await.unwrap();

        handle.wait().await;
        assert_eq!(handle.state(), SessionState::Stopped);
        assert!(hooks.joins.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_identity_stops_session() {
        let hooks = Arc::new(RecordingHooks::default());
        hooks.duplicate.store(true, Ordering::SeqCst);
        let events = Arc::new(RecordingEvents::default());
        let (handle, mut terminal) = start_session(hooks.clone(), events.clone());

        terminal
            .write_all(&hex::decode(HEARTBEAT_2019).unwrap())
            .await
            .unwrap();
        handle.wait().await;

        assert_eq!(handle.key(), None);
        assert_eq!(events.joins.load(Ordering::SeqCst), 1);
        assert!(hooks.leaves.lock().unwrap().is_empty());

        // Rejected message is never answered
        let mut buf = [0u8; 64];
        assert_eq!(terminal.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_join_retried_after_failure() {
        let hooks = Arc::new(RecordingHooks::default());
        hooks.reject_first.store(true, Ordering::SeqCst);
        let events = Arc::new(RecordingEvents::default());
        let (handle, mut terminal) = start_session(hooks.clone(), events.clone());

        let frame = hex::decode(HEARTBEAT_2019).unwrap();
        terminal.write_all(&frame).await.unwrap();
        read_reply(&mut terminal).await;
        assert_eq!(handle.key(), None);

        terminal.write_all(&frame).await.unwrap();
        read_reply(&mut terminal).await;
        assert_eq!(handle.key(), Some("00000000017299841738"));
        assert_eq!(hooks.joins.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_pending_command_sees_closed_channel_on_stop() {
        let hooks = Arc::new(RecordingHooks::default());
        let (handle, mut terminal) = start_session(hooks, Arc::new(RecordingEvents::default()));

        let header = Header::for_terminal("17299841738", ProtocolVersion::V2019).unwrap();
        let (active, rx) =
            ActiveMessage::new(command::P8104_QUERY_PARAMETER, header.clone(), Bytes::new());
        handle
            .submit(active.with_timeout(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(read_reply(&mut terminal).await.starts_with("7e8104"));

        handle.stop();
        assert!(rx.await.is_err());
        handle.wait().await;

        let (late, _rx) = ActiveMessage::new(command::P8104_QUERY_PARAMETER, header, Bytes::new());
        let err = handle.submit(late).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_stop_releases_terminal_that_stopped_reading() {
        let (_terminal, server) = duplex(64);
        let handle = Session::new(
            server,
            HandlerRegistry::with_builtins(),
            Arc::new(RecordingHooks::default()),
            Arc::new(NoopEvents),
            SessionConfig::default(),
        )
        .unwrap()
        .start();

        let header = Header::for_terminal("17299841738", ProtocolVersion::V2019).unwrap();
        let body = vec![0x55u8; 500];
        let (active, rx) = ActiveMessage::new(command::P8104_QUERY_PARAMETER, header, body);
        handle.submit(active).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.stop();
        tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .expect("session stuck in Stopping");
        assert_eq!(handle.state(), SessionState::Stopped);
        assert_eq!(
            rx.await.unwrap().unwrap_err().kind(),
            ErrorKind::WriteDataFail
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_terminal, server) = duplex(64);
        let config = SessionConfig {
            inbound_capacity: 0,
            ..SessionConfig::default()
        };
        let err = Session::new(
            server,
            HandlerRegistry::with_builtins(),
            Arc::new(RecordingHooks::default()),
            Arc::new(NoopEvents),
            config,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_noop_events_accepted() {
        let (client, server) = duplex(64);
        let handle = Session::new(
            server,
            HandlerRegistry::new(),
            Arc::new(RecordingHooks::default()),
            Arc::new(NoopEvents),
            SessionConfig::default(),
        )
        .unwrap()
        .start();
        drop(client);
        handle.wait().await;
        assert_eq!(handle.state(), SessionState::Stopped);
    }
}
