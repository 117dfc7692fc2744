//! Command and control engine over a byte stream.
//!
//! The [`Engine`] is the caller-facing half of a two-part design: it owns no
//! connection state itself, only channel endpoints to a background worker
//! task that owns the stream, the incoming buffer and the request state
//! machine (see `worker`).
//!
//! ```text
//! ┌──────────────┐  Request   ┌──────────────────┐  bytes   ┌─────────┐
//! │    Engine    │ ─────────► │  Worker (task)   │ ◄──────► │ device  │
//! │ dial/control │ ◄───────── │ poll·match·reply │          └─────────┘
//! └──────────────┘  Response  └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stream_arbiter::{Engine, CommandSet};
//!
//! let commands = CommandSet::load(Path::new("device.json"))?;
//! let mut engine = Engine::new("tcp");
//! engine
//!     .dial("10.0.0.12:2001", Duration::from_secs(1), commands.get("ping").unwrap())
//!     .await?;
//!
//! let response = engine.control(commands.get("GAIN").unwrap(), &[Arg::from(12)]).await;
//! println!("{response}");
//! engine.close().await?;
//! ```
//!
//! One engine serves one caller at a time. `control` takes `&mut self`, so
//! sharing an engine between tasks requires external serialization; there is
//! no multiplexing of outstanding requests over one connection.

mod config;
mod worker;

pub use config::EngineConfig;

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time;

use crate::command::{Arg, Command};
use crate::error::{EngineError, UnknownTransport};
use crate::response::{Request, Response};
use worker::{Envelope, Worker, WorkerHandle};

/// Stream transports an [`Engine`] can dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// A TCP socket (`"tcp"`, or its alias `"tcp4"`).
    #[serde(alias = "tcp4")]
    Tcp,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
        }
    }
}

impl FromStr for Transport {
    type Err = UnknownTransport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" | "tcp4" => Ok(Transport::Tcp),
            other => Err(UnknownTransport(other.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request/reply façade over one stream connection.
pub struct Engine {
    transport: Transport,
    config: EngineConfig,
    /// Raised by the current worker while it runs.
    alive: Arc<AtomicBool>,
    worker: Option<WorkerHandle>,
    next_id: u64,
}

impl Engine {
    /// Create an engine for the named transport kind.
    ///
    /// # Panics
    ///
    /// Panics if `kind` is not a known transport. Choosing the transport is
    /// configuration, not a runtime outcome; use [`Transport::from_str`] to
    /// validate untrusted input first.
    pub fn new(kind: &str) -> Self {
        match kind.parse() {
            Ok(transport) => Self::with_transport(transport),
            Err(err) => panic!("{err}"),
        }
    }

    pub fn with_transport(transport: Transport) -> Self {
        Self::with_config(transport, EngineConfig::default())
    }

    pub fn with_config(transport: Transport, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            alive: Arc::new(AtomicBool::new(false)),
            worker: None,
            next_id: 0,
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a worker is currently running for this engine.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Open the connection, start the worker and verify the link by sending
    /// `ping` [`EngineConfig::ping_attempts`] times.
    ///
    /// An engine that is already connected is closed first.
    ///
    /// # Errors
    ///
    /// - the transport error if the connection cannot be opened within
    ///   `timeout` (`io::ErrorKind::TimedOut` when the deadline passes)
    /// - the first failed ping's error; the worker is stopped again
    ///
    /// # Panics
    ///
    /// Panics if `ping` cannot be expanded without arguments.
    pub async fn dial(
        &mut self,
        addr: &str,
        timeout: Duration,
        ping: &Command,
    ) -> Result<(), EngineError> {
        if let Err(err) = ping.bytes(&[]) {
            panic!(
                "ping command {:?} cannot require arguments: {err}",
                ping.name()
            );
        }

        if self.is_alive() {
            if let Err(err) = self.close().await {
                tracing::warn!(error = %err, "Previous connection did not close cleanly");
            }
        }

        let stream = match self.transport {
            Transport::Tcp => connect_tcp(addr, timeout).await?,
        };
        tracing::info!(addr, transport = %self.transport, "Connected");

        self.start(stream, ping).await
    }

    /// Spawn a worker over `stream` and ping through it.
    pub(crate) async fn start<S>(&mut self, stream: S, ping: &Command) -> Result<(), EngineError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (handle, mailbox) = worker::channels();
        // A fresh flag, so a straggling previous worker cannot lower it.
        self.alive = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(stream, mailbox, Arc::clone(&self.alive), self.config.clone());

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(worker.run(ready_tx));
        if ready_rx.await.is_err() {
            return Err(EngineError::NotConnected);
        }
        self.worker = Some(handle);

        for attempt in 1..=self.config.ping_attempts {
            let response = self.control(ping, &[]).await;
            if let Some(err) = response.error {
                tracing::warn!(attempt, error = %err, "Ping failed, dropping connection");
                if let Err(close_err) = self.close().await {
                    tracing::debug!(error = %close_err, "Close after failed ping");
                }
                return Err(err);
            }
        }

        Ok(())
    }

    /// Expand `command` with `args`, write it, and wait for the reply.
    ///
    /// The wait ends when the incoming bytes match the command's failure
    /// pattern (`EngineError::Match`, whole buffer returned), its success
    /// pattern (matched span returned), or its timeout passes
    /// (`EngineError::Timeout`, whole buffer returned). Bytes received before
    /// the request was written are discarded.
    ///
    /// Formatting errors are returned without contacting the worker.
    pub async fn control(&mut self, command: &Command, args: &[Arg]) -> Response {
        if !self.is_alive() {
            return Response::failed(EngineError::NotConnected);
        }

        let bytes = match command.bytes(args) {
            Ok(bytes) => bytes,
            Err(err) => {
                return Response {
                    bytes: err.formed().unwrap_or_default().as_bytes().to_vec(),
                    error: Some(err),
                    duration: Duration::ZERO,
                }
            }
        };

        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        let Some(worker) = self.worker.as_mut() else {
            return Response::failed(EngineError::NotConnected);
        };

        let envelope = Envelope {
            id,
            request: Request {
                command: command.clone(),
                bytes,
            },
        };
        if worker.requests.send(envelope).await.is_err() {
            return Response::failed(EngineError::NotConnected);
        }

        loop {
            match worker.replies.recv().await {
                Some(reply) if reply.id == id => return reply.response,
                // Left over from an exchange whose caller stopped waiting.
                Some(stale) => tracing::debug!(id = stale.id, "Discarding stale reply"),
                None => return Response::failed(EngineError::NotConnected),
            }
        }
    }

    /// Stop the worker and release the connection.
    ///
    /// Does nothing if the engine is not connected. Waits at most
    /// [`EngineConfig::close_grace`] for the worker to acknowledge; the
    /// engine's channel endpoints are released either way.
    ///
    /// # Errors
    ///
    /// `EngineError::Timeout` if the worker does not acknowledge in time,
    /// otherwise whatever the worker reports on shutdown.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        let worker = self.worker.take();
        if !self.is_alive() {
            return Ok(());
        }
        let Some(worker) = worker else {
            return Ok(());
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if worker.stop.send(ack_tx).is_err() {
            tracing::debug!("Worker already gone at close");
            return Ok(());
        }

        match time::timeout(self.config.close_grace(), ack_rx).await {
            Ok(Ok(result)) => {
                tracing::info!(transport = %self.transport, "Closed");
                result
            }
            // The worker dropped the acknowledgement while exiting.
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                tracing::warn!(
                    grace = ?self.config.close_grace(),
                    "Worker did not acknowledge stop in time"
                );
                Err(EngineError::Timeout)
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("transport", &self.transport)
            .field("alive", &self.is_alive())
            .field("config", &self.config)
            .finish()
    }
}

async fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream, EngineError> {
    let stream = time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out after {timeout:?}"),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandSpec;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::task::JoinHandle;

    fn command(name: &str, template: &str, success: &str, timeout_ms: u64) -> Command {
        CommandSpec {
            name: name.to_string(),
            timeout_ms,
            template: template.to_string(),
            validation: ".*".to_string(),
            success: success.to_string(),
            failure: "ERR".to_string(),
            description: String::new(),
        }
        .compile()
        .unwrap()
    }

    fn ping() -> Command {
        command("ping", "\r", "\r", 300)
    }

    /// Echo everything back, like a device in loopback.
    fn spawn_echo(mut peer: DuplexStream) {
        tokio::spawn(async move {
            let mut buf = [0u8; 256];
            loop {
                match peer.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if peer.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    #[test]
    fn test_transport_parse() {
        assert_eq!("tcp".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!("tcp4".parse::<Transport>().unwrap(), Transport::Tcp);
        assert_eq!(
            "bad".parse::<Transport>().unwrap_err(),
            UnknownTransport("bad".to_string())
        );
        assert_eq!(Engine::new("tcp4").transport(), Transport::Tcp);
    }

    #[test]
    fn test_transport_serde_alias() {
        let t: Transport = serde_json::from_str(r#""tcp4""#).unwrap();
        assert_eq!(t, Transport::Tcp);
        assert_eq!(serde_json::to_string(&t).unwrap(), r#""tcp""#);
    }

    #[test]
    #[should_panic(expected = "unable to create an engine")]
    fn test_new_unknown_kind_panics() {
        let _ = Engine::new("bad");
    }

    #[tokio::test]
    async fn test_control_not_connected() {
        let mut engine = Engine::new("tcp");
        let response = engine.control(&ping(), &[]).await;
        assert!(matches!(response.error, Some(EngineError::NotConnected)));
    }

    #[tokio::test]
    async fn test_control_format_error_never_reaches_worker() {
        let mut engine = Engine::new("tcp");
        let (handle, mut mailbox) = worker::channels();
        engine.worker = Some(handle);
        engine.alive.store(true, Ordering::SeqCst);

        let wrong = command("ping wrong", "Req Arg, No Arg %d\r", "\r", 300);
        let response = engine.control(&wrong, &[]).await;
        assert!(matches!(response.error, Some(EngineError::Args { .. })));
        assert_eq!(response.bytes, b"Req Arg, No Arg %!d(MISSING)\r".to_vec());
        assert!(mailbox.requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_control_returns_worker_reply() {
        let mut engine = Engine::new("tcp");
        let (handle, mut mailbox) = worker::channels();
        engine.worker = Some(handle);
        engine.alive.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let envelope = mailbox.requests.recv().await.unwrap();
            // A stale reply first, then the real one.
            mailbox
                .replies
                .send(worker::Reply {
                    id: envelope.id.wrapping_sub(1),
                    response: Response::default(),
                })
                .await
                .unwrap();
            mailbox
                .replies
                .send(worker::Reply {
                    id: envelope.id,
                    response: Response::failed(EngineError::NotConnected),
                })
                .await
                .unwrap();
        });

        let response = engine.control(&ping(), &[]).await;
        assert!(matches!(response.error, Some(EngineError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_never_started() {
        let mut engine = Engine::new("tcp");
        assert!(engine.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_times_out_without_ack() {
        let mut engine = Engine::new("tcp");
        let (handle, _mailbox) = worker::channels();
        engine.worker = Some(handle);
        engine.alive.store(true, Ordering::SeqCst);

        assert!(matches!(engine.close().await, Err(EngineError::Timeout)));
        // Endpoints were released; a second close has nothing to do.
        assert!(engine.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_returns_worker_report() {
        let mut engine = Engine::new("tcp");
        let (handle, mailbox) = worker::channels();
        engine.worker = Some(handle);
        engine.alive.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            let ack = mailbox.stop.await.unwrap();
            let _ = ack.send(Err(EngineError::NotConnected));
        });

        assert!(matches!(engine.close().await, Err(EngineError::NotConnected)));
    }

    #[tokio::test]
    async fn test_start_pings_and_round_trips() {
        let (local, peer) = tokio::io::duplex(1024);
        spawn_echo(peer);

        let mut engine = Engine::new("tcp");
        engine.start(local, &ping()).await.unwrap();
        assert!(engine.is_alive());

        let echo = command("echo", "HELLO %s\n", "[A-Z]+ [a-z]+\n", 300);
        let response = engine.control(&echo, &[Arg::from("world")]).await;
        assert!(response.is_ok(), "{response}");
        assert_eq!(response.bytes, b"HELLO world\n".to_vec());

        let failing = command("fail", "ERR 1\n", "OK", 300);
        let response = engine.control(&failing, &[]).await;
        assert!(matches!(response.error, Some(EngineError::Match)));
        assert_eq!(response.bytes, b"ERR 1\n".to_vec());

        assert!(engine.close().await.is_ok());
        assert!(!engine.is_alive());
        assert!(engine.close().await.is_ok());

        let response = engine.control(&echo, &[Arg::from("again")]).await;
        assert!(matches!(response.error, Some(EngineError::NotConnected)));
    }

    #[tokio::test]
    async fn test_start_failed_ping_stops_worker() {
        // Nobody answers on the far side.
        let (local, _peer) = tokio::io::duplex(1024);

        let mut engine = Engine::new("tcp");
        let quiet_ping = command("ping", "\r", "\r", 30);
        let err = engine.start(local, &quiet_ping).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout));
        assert!(!engine.is_alive());

        let response = engine.control(&quiet_ping, &[]).await;
        assert!(matches!(response.error, Some(EngineError::NotConnected)));
    }

    /// Answer the first `answered` pings, then go quiet. Resolves to the
    /// number of pings seen once the worker hangs up.
    fn spawn_pinged_peer(mut peer: DuplexStream, answered: usize) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut seen = 0;
            let mut buf = [0u8; 64];
            loop {
                match peer.read(&mut buf).await {
                    Ok(0) | Err(_) => return seen,
                    Ok(n) => {
                        for _ in buf[..n].iter().filter(|&&b| b == b'\r') {
                            seen += 1;
                            if seen <= answered && peer.write_all(b"\r").await.is_err() {
                                return seen;
                            }
                        }
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_start_sends_every_ping_attempt() {
        let (local, peer) = tokio::io::duplex(1024);
        let pings = spawn_pinged_peer(peer, usize::MAX);

        let mut engine = Engine::new("tcp");
        engine.start(local, &ping()).await.unwrap();
        engine.close().await.unwrap();

        let seen = time::timeout(Duration::from_secs(1), pings).await.unwrap().unwrap();
        assert_eq!(seen, engine.config().ping_attempts as usize);
    }

    #[tokio::test]
    async fn test_start_aborts_on_later_ping_failure() {
        for answered in [1, 2] {
            let (local, peer) = tokio::io::duplex(1024);
            let pings = spawn_pinged_peer(peer, answered);

            let mut engine = Engine::new("tcp");
            let quick_ping = command("ping", "\r", "\r", 50);
            let err = engine.start(local, &quick_ping).await.unwrap_err();
            assert!(matches!(err, EngineError::Timeout), "{answered}: {err}");
            assert!(!engine.is_alive());

            // The failed ping was the last one written; the worker then hung up.
            let seen = time::timeout(Duration::from_secs(1), pings).await.unwrap().unwrap();
            assert_eq!(seen, answered + 1);

            let response = engine.control(&quick_ping, &[]).await;
            assert!(matches!(response.error, Some(EngineError::NotConnected)));
        }
    }

    #[tokio::test]
    #[should_panic(expected = "cannot require arguments")]
    async fn test_dial_ping_needing_arguments_panics() {
        let mut engine = Engine::new("tcp");
        let wrong = command("ping wrong", "Req Arg, No Arg %d\r", "\r", 300);
        let _ = engine
            .dial("127.0.0.1:1", Duration::from_millis(100), &wrong)
            .await;
    }

    #[tokio::test]
    async fn test_dial_invalid_address_leaves_engine_closed() {
        let mut engine = Engine::new("tcp");
        let err = engine
            .dial("no port given", Duration::from_millis(100), &ping())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Io(_)));
        assert!(!engine.is_alive());

        let response = engine.control(&ping(), &[]).await;
        assert!(matches!(response.error, Some(EngineError::NotConnected)));
    }
}
