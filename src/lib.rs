//! Command and control over byte streams.
//!
//! This library wraps a stream connection (a TCP socket to a piece of
//! hardware, typically) in a request/reply interface:
//!
//! - `command` - [`Command`] templates and the patterns that classify replies
//! - `engine` - the [`Engine`] façade and its background connection worker
//! - `response` - the [`Response`] every exchange produces
//! - `error` - [`EngineError`] and [`CommandError`]
//!
//! # Example
//!
//! ```ignore
//! use stream_arbiter::{Arg, CommandSpec, Engine};
//!
//! let ping = CommandSpec {
//!     name: "ping".into(),
//!     timeout_ms: 300,
//!     template: "\r".into(),
//!     validation: "\r".into(),
//!     success: "\r".into(),
//!     failure: stream_arbiter::NEVER_MATCHES.into(),
//!     description: "Carriage return echo".into(),
//! }
//! .compile()?;
//!
//! let mut engine = Engine::new("tcp");
//! engine.dial("localhost:2001", Duration::from_secs(1), &ping).await?;
//!
//! let response = engine.control(&some_command, &[Arg::from(42)]).await;
//! match response.error {
//!     None => println!("Command succeeded: {:?}", response.bytes),
//!     Some(err) => eprintln!("Command failed: {err}"),
//! }
//!
//! engine.close().await?;
//! ```
//!
//! Transport errors are handed back to the caller unchanged; the engine never
//! reconnects on its own.

pub mod command;
pub mod engine;
pub mod error;
pub mod response;

pub use command::{Arg, Command, CommandSet, CommandSpec, NEVER_MATCHES};
pub use engine::{Engine, EngineConfig, Transport};
pub use error::{CommandError, EngineError, UnknownTransport};
pub use response::Response;
