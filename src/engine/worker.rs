//! The connection worker.
//!
//! A single task owns the stream, the incoming byte buffer and the request
//! state machine. Nothing else touches them; the [`Engine`](crate::Engine)
//! only talks to the worker over channels:
//!
//! ```text
//! Engine ── Request ──► requests ──►┐
//!                                   │  Worker: select! { tick | request | stop }
//! Engine ◄── Reply ◄── replies ◄────┘          then check_state, deliver
//! Engine ── stop(ack) ─► stop
//! ```
//!
//! The state machine cycles `Idle → AwaitingReply → ReplyFormed → Idle`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::config::EngineConfig;
use crate::command::{Command, Verdict};
use crate::error::EngineError;
use crate::response::{Request, Response};

/// Sender the worker answers a stop signal on.
pub(crate) type StopAck = oneshot::Sender<Result<(), EngineError>>;

/// A response tagged with the id of the request it answers.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) id: u64,
    pub(crate) response: Response,
}

/// A request tagged with an id, so the engine can drop replies meant for an
/// exchange it abandoned.
#[derive(Debug)]
pub(crate) struct Envelope {
    pub(crate) id: u64,
    pub(crate) request: Request,
}

/// Engine-side channel endpoints.
pub(crate) struct WorkerHandle {
    pub(crate) requests: mpsc::Sender<Envelope>,
    pub(crate) replies: mpsc::Receiver<Reply>,
    pub(crate) stop: oneshot::Sender<StopAck>,
}

/// Worker-side channel endpoints.
pub(crate) struct Mailbox {
    pub(crate) requests: mpsc::Receiver<Envelope>,
    pub(crate) replies: mpsc::Sender<Reply>,
    pub(crate) stop: oneshot::Receiver<StopAck>,
}

/// Create a connected handle/mailbox pair. Each queue holds one message,
/// which is all a single caller ever has outstanding.
pub(crate) fn channels() -> (WorkerHandle, Mailbox) {
    let (request_tx, request_rx) = mpsc::channel(1);
    let (reply_tx, reply_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = oneshot::channel();
    (
        WorkerHandle {
            requests: request_tx,
            replies: reply_rx,
            stop: stop_tx,
        },
        Mailbox {
            requests: request_rx,
            replies: reply_tx,
            stop: stop_rx,
        },
    )
}

#[derive(Debug)]
pub(crate) enum State {
    /// No request in flight.
    Idle,
    /// Request written; the buffer is being watched.
    AwaitingReply {
        id: u64,
        command: Command,
        issued: Instant,
    },
    /// Outcome decided but not yet handed to the engine.
    ReplyFormed(Reply),
}

/// Holds the liveness flag up for as long as the worker runs.
struct AliveGuard(Arc<AtomicBool>);

impl AliveGuard {
    fn raise(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct Worker<S> {
    stream: S,
    buffer: Vec<u8>,
    scratch: Vec<u8>,
    state: State,
    /// Last transport error seen on the stream.
    error: Option<EngineError>,
    mailbox: Mailbox,
    alive: Arc<AtomicBool>,
    config: EngineConfig,
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        stream: S,
        mailbox: Mailbox,
        alive: Arc<AtomicBool>,
        config: EngineConfig,
    ) -> Self {
        Self {
            stream,
            buffer: Vec::new(),
            scratch: vec![0; config.read_chunk.max(1)],
            state: State::Idle,
            error: None,
            mailbox,
            alive,
            config,
        }
    }

    /// Run until stopped or until the engine drops its endpoints.
    ///
    /// `ready` fires once the worker is live. The stream is dropped, and so
    /// closed, when this returns, whichever way it exits.
    pub(crate) async fn run(mut self, ready: oneshot::Sender<()>) {
        let _alive = AliveGuard::raise(Arc::clone(&self.alive));
        let mut ticker = time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if ready.send(()).is_err() {
            tracing::debug!("Engine went away before worker start-up completed");
            return;
        }
        tracing::debug!("Connection worker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll().await,
                envelope = self.mailbox.requests.recv() => match envelope {
                    Some(envelope) => self.handle_request(envelope).await,
                    None => {
                        tracing::debug!("Request channel closed, connection worker exiting");
                        return;
                    }
                },
                ack = &mut self.mailbox.stop => {
                    self.alive.store(false, Ordering::SeqCst);
                    match ack {
                        Ok(ack) => {
                            if ack.send(Ok(())).is_err() {
                                tracing::debug!("Stop acknowledgement not awaited");
                            }
                        }
                        Err(_) => tracing::debug!("Engine dropped, connection worker exiting"),
                    }
                    tracing::debug!(discarded = self.buffer.len(), "Connection worker stopped");
                    return;
                }
            }

            self.check_state();
            self.deliver();
        }
    }

    /// Pull whatever the stream has ready into the buffer.
    async fn poll(&mut self) {
        let read = time::timeout(
            self.config.read_deadline(),
            self.stream.read(&mut self.scratch),
        )
        .await;

        match read {
            // Deadline passed with nothing to read.
            Err(_) => {}
            Ok(Ok(0)) => self.store_error(
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer").into(),
            ),
            Ok(Ok(n)) => {
                tracing::trace!(bytes = n, "Read from stream");
                self.buffer.extend_from_slice(&self.scratch[..n]);
            }
            Ok(Err(err))
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Ok(Err(err)) => self.store_error(err.into()),
        }
    }

    fn store_error(&mut self, error: EngineError) {
        if self.error.is_none() {
            tracing::warn!(error = %error, "Connection error");
        }
        self.error = Some(error);
    }

    async fn handle_request(&mut self, envelope: Envelope) {
        let Envelope { id, request } = envelope;

        if !matches!(self.state, State::Idle) {
            // A broken connection says more than "busy".
            let error = self.error.clone().unwrap_or(EngineError::Busy);
            tracing::debug!(command = request.command.name(), error = %error, "Rejecting request");
            self.reply_now(id, Response::failed(error)).await;
            return;
        }

        self.buffer.clear();
        // A peer that stops reading must not wedge the loop past the command's deadline.
        if let Err(err) = self.write(&request.bytes, request.command.timeout()).await {
            let error = EngineError::from(err);
            tracing::warn!(command = request.command.name(), error = %error, "Write failed");
            self.error = Some(error.clone());
            self.reply_now(id, Response::failed(error)).await;
            return;
        }

        tracing::debug!(
            command = request.command.name(),
            bytes = request.bytes.len(),
            "Request written"
        );
        self.state = State::AwaitingReply {
            id,
            command: request.command,
            issued: Instant::now(),
        };
    }

    async fn write(&mut self, bytes: &[u8], deadline: Duration) -> io::Result<()> {
        let stream = &mut self.stream;
        let written = time::timeout(deadline, async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        })
        .await;
        written.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("write did not complete within {deadline:?}"),
            ))
        })
    }

    /// Reply outside the state machine, waiting for room on the channel.
    async fn reply_now(&mut self, id: u64, response: Response) {
        if self.mailbox.replies.send(Reply { id, response }).await.is_err() {
            tracing::debug!(id, "Engine dropped before immediate reply");
        }
    }

    /// Decide the in-flight request if its outcome is known.
    fn check_state(&mut self) {
        let State::AwaitingReply {
            id,
            command,
            issued,
        } = &self.state
        else {
            return;
        };

        let elapsed = issued.elapsed();
        let (bytes, error) = match command.classify(&self.buffer, elapsed) {
            Verdict::Unformed => return,
            Verdict::TimedOut => {
                tracing::debug!(command = command.name(), ?elapsed, "Command timed out");
                (self.buffer.clone(), Some(EngineError::Timeout))
            }
            Verdict::Failed => {
                tracing::debug!(command = command.name(), ?elapsed, "Failure pattern matched");
                (self.buffer.clone(), Some(EngineError::Match))
            }
            Verdict::Matched(span) => {
                tracing::debug!(command = command.name(), ?elapsed, "Success pattern matched");
                (self.buffer.get(span).unwrap_or_default().to_vec(), None)
            }
        };

        let id = *id;
        self.state = State::ReplyFormed(Reply {
            id,
            response: Response {
                bytes,
                error,
                duration: elapsed,
            },
        });
    }

    /// One non-blocking attempt to hand over a formed reply.
    fn deliver(&mut self) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::ReplyFormed(reply) => match self.mailbox.replies.try_send(reply) {
                Ok(()) => {}
                Err(TrySendError::Full(reply)) => self.state = State::ReplyFormed(reply),
                Err(TrySendError::Closed(reply)) => {
                    tracing::debug!(id = reply.id, "Engine dropped before reply delivered");
                }
            },
            other => self.state = other,
        }
    }
}
