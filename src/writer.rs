//! Dedicated writer task, sole owner of the write half of a terminal connection.
//!
//! Every frame the platform sends goes through this task, so the platform serial
//! counter and the table of outstanding active commands need no lock.
//!
//! # Architecture
//!
//! ```text
//! reader task ──► inbound (10) ──┐
//! reader task ──► reissue (3) ───┼─► Writer Task ─► terminal
//! submitters  ──► active (3) ────┘        │
//!                                         └─► PendingTable (deadlines)
//! ```
//!
//! Deadlines live in the pending table; the loop sleeps until the earliest one
//! instead of spawning a timer per command.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::active::{correlator, ActiveMessage, PendingTable};
use crate::config::SessionConfig;
use crate::error::{GatewayError, Result};
use crate::handler::{HandlerRegistry, TerminalEvents};
use crate::protocol::{command, Header, Message};
use crate::session::{stopping, SessionState};

/// Receiving ends of the channels feeding the writer task.
pub(crate) struct WriterChannels {
    /// Terminal messages awaiting a default reply or correlation.
    pub inbound: mpsc::Receiver<Message>,
    /// Platform-initiated commands.
    pub active: mpsc::Receiver<ActiveMessage>,
    /// Sub-package reissue requests to echo.
    pub reissue: mpsc::Receiver<Message>,
    /// Session lifecycle; the task ends once it reaches `Stopping`.
    pub shutdown: watch::Receiver<SessionState>,
}

/// Spawn the writer task.
///
/// The task ends on the shutdown signal or when the reader drops the inbound
/// sender. Outstanding active commands are dropped with it, so their
/// submitters observe a closed channel.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    registry: HandlerRegistry,
    events: Arc<dyn TerminalEvents>,
    config: &SessionConfig,
    channels: WriterChannels,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let writer = WriterLoop {
        writer,
        shutdown: channels.shutdown.clone(),
        registry,
        events,
        pending: PendingTable::new(),
        next_serial: 0,
        default_timeout: config.default_active_timeout(),
        filter_incomplete_events: config.filter_incomplete_events,
    };
    tokio::spawn(writer.run(channels))
}

struct WriterLoop<W> {
    writer: W,
    /// Aborts a write that is stuck on a terminal that stopped reading.
    shutdown: watch::Receiver<SessionState>,
    registry: HandlerRegistry,
    events: Arc<dyn TerminalEvents>,
    pending: PendingTable,
    /// Platform serial number of the next frame.
    next_serial: u16,
    default_timeout: Duration,
    filter_incomplete_events: bool,
}

impl<W> WriterLoop<W>
where
    W: AsyncWrite + Unpin,
{
    async fn run(mut self, mut channels: WriterChannels) {
        loop {
            let deadline = self.pending.next_deadline();

            tokio::select! {
                _ = stopping(&mut channels.shutdown) => break,
                Some(active) = channels.active.recv() => self.on_active(active).await,
                Some(msg) = channels.reissue.recv() => self.reissue_reply(msg).await,
                msg = channels.inbound.recv() => match msg {
                    Some(msg) => self.on_inbound(msg).await,
                    None => break,
                },
                _ = sleep_until_deadline(deadline) => self.expire(Instant::now()),
            }
        }

        tracing::debug!(
            outstanding = self.pending.len(),
            next_serial = self.next_serial,
            "Writer task stopped"
        );
    }

    async fn on_inbound(&mut self, msg: Message) {
        let msg = if !self.pending.is_empty() && msg.is_complete() {
            match self.active_respond(msg) {
                Some(msg) => msg,
                None => return,
            }
        } else {
            msg
        };
        self.default_reply(msg).await;
    }

    /// Complete the active command this message answers.
    ///
    /// Hands the message back if it answers nothing outstanding.
    fn active_respond(&mut self, mut msg: Message) -> Option<Message> {
        let correlator = match correlator(&msg) {
            None => return Some(msg),
            Some(Ok(correlator)) => correlator,
            Some(Err(e)) => {
                tracing::warn!(
                    phone = %msg.phone(),
                    data = %hex::encode(&msg.raw),
                    "Cannot correlate response: {}",
                    e
                );
                return Some(msg);
            }
        };

        let (seq, pending) = match self.pending.take_match(correlator) {
            Some(found) => found,
            None => return Some(msg),
        };

        msg.platform_seq = seq;
        msg.platform_data = pending.data;
        if !pending.message.complete(Ok(msg)) {
            tracing::debug!(platform_seq = seq, "Active command submitter stopped waiting");
        }
        None
    }

    async fn default_reply(&mut self, mut msg: Message) {
        let handler = match msg.handler.clone() {
            Some(handler) => handler,
            None => return,
        };
        if !handler.has_reply() {
            return;
        }

        let body = match handler.reply_body(&msg) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(
                    phone = %msg.phone(),
                    data = %hex::encode(&msg.raw),
                    "Reply body failed: {}",
                    e
                );
                return;
            }
        };

        let (seq, frame) =
            match self.encode_next(&mut msg.header, handler.reply_protocol(), &body) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::warn!(phone = %msg.phone(), "Reply encode failed: {}", e);
                    return;
                }
            };

        self.write_recorded(&mut msg, seq, frame).await;
        self.write_events(&msg);
    }

    /// Echo a sub-package reissue request back as `0x8003`.
    async fn reissue_reply(&mut self, mut msg: Message) {
        let body = msg.body.clone();
        let (seq, frame) =
            match self.encode_next(&mut msg.header, command::P8003_REISSUE_SUB_PACKAGE, &body) {
                Ok(encoded) => encoded,
                Err(e) => {
                    tracing::warn!(phone = %msg.phone(), "Reissue encode failed: {}", e);
                    return;
                }
            };

        self.write_recorded(&mut msg, seq, frame).await;
        self.write_events(&msg);
    }

    async fn on_active(&mut self, mut active: ActiveMessage) {
        let (seq, frame) =
            match self.encode_next(&mut active.header, active.command, &active.body) {
                Ok(encoded) => encoded,
                Err(e) => {
                    active.complete(Err(e));
                    return;
                }
            };
        let timeout = active.timeout.unwrap_or(self.default_timeout);

        let written = self.write_frame(&frame).await;

        if let Some(handler) = self.registry.get(active.command) {
            let mut header = active.header.clone();
            header.msg_id = active.command;
            let mut msg = Message::new(header, active.body.clone(), Bytes::new());
            msg.handler = Some(handler);
            msg.platform_seq = seq;
            msg.platform_data = frame.clone();
            msg.error = written
                .as_ref()
                .err()
                .map(|e| GatewayError::WriteDataFail(io::Error::new(e.kind(), e.to_string())));
            self.write_events(&msg);
        }

        match written {
            Ok(()) => {
                let displaced = self
                    .pending
                    .insert(seq, active, frame, timeout, Instant::now());
                if let Some(displaced) = displaced {
                    tracing::warn!(
                        platform_seq = seq,
                        command = displaced.message.command,
                        "Serial number wrapped onto an outstanding command, dropping it"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(data = %hex::encode(&frame), "Write failed: {}", e);
                active.complete(Err(GatewayError::WriteDataFail(e)));
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        for (seq, pending) in self.pending.take_expired(now) {
            tracing::debug!(
                platform_seq = seq,
                command = pending.message.command,
                "Active command timed out"
            );
            pending
                .message
                .complete(Err(GatewayError::WriteDataOverTime(pending.timeout)));
        }
    }

    /// Encode with the next platform serial number.
    ///
    /// The counter only advances once the frame exists.
    fn encode_next(
        &mut self,
        header: &mut Header,
        reply_id: u16,
        body: &[u8],
    ) -> Result<(u16, Bytes)> {
        let seq = self.next_serial;
        header.reply_id = reply_id;
        header.platform_serial_number = seq;
        let frame = header.encode(body)?;
        self.next_serial = seq.wrapping_add(1);
        Ok((seq, frame))
    }

    /// Write a reply frame and record the outcome on the message.
    async fn write_recorded(&mut self, msg: &mut Message, seq: u16, frame: Bytes) {
        if let Err(e) = self.write_frame(&frame).await {
            tracing::warn!(data = %hex::encode(&frame), "Write failed: {}", e);
            msg.error = Some(GatewayError::WriteDataFail(e));
        }
        msg.platform_seq = seq;
        msg.platform_data = frame;
    }

    /// Write one frame, giving up as soon as the session is stopping.
    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(frame).await?;
            writer.flush().await
        };
        tokio::select! {
            biased;

            _ = stopping(&mut self.shutdown) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "session stopping",
            )),
            written = write => written,
        }
    }

    fn write_events(&self, msg: &Message) {
        if self.filter_incomplete_events && !msg.is_complete() {
            return;
        }
        match &msg.handler {
            Some(handler) => {
                handler.on_write_execution_event(msg);
                self.events.on_write_execution(msg);
            }
            None => tracing::warn!(command = msg.command(), "Write event without handler"),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
