// (c) 2024 Ross Younger

//! Client library for strongSwan's VICI control protocol.
//!
//! charon, the IKE daemon at the heart of strongSwan, exposes a UNIX socket
//! (`/var/run/charon.vici` by default) speaking a small length-framed binary
//! protocol: VICI. Over it a client can issue commands (load a connection,
//! initiate a CHILD_SA, list SAs...), subscribe to asynchronous events, and run
//! streaming commands that interleave a series of events with their final
//! result.
//!
//! This crate implements that protocol from the wire up:
//!
//! - [`wire`] — the byte-level codec: primitive reads/writes, the recursive
//!   [`wire::Message`] grammar, and packet framing.
//! - [`connection`] — [`connection::Connection`], the demultiplexer that lets
//!   unary calls, streaming calls, and event subscriptions share one socket.
//! - [`session`] — [`session::Session`], a friendlier facade over a
//!   `Connection` that serialises top-level operations for callers who don't
//!   need to think about that themselves.
//! - [`marshal`] — [`marshal::ToMessage`]/[`marshal::FromMessage`], for mapping
//!   typed request/response structs onto [`wire::Message`] without hand-written
//!   field-by-field plumbing at every call site.
//! - [`transport`] — how to reach charon; a UNIX domain socket by default, but
//!   anything implementing [`transport::Stream`] works.
//!
//! ```no_run
//! # async fn go() -> vici::Result<()> {
//! use tokio_util::sync::CancellationToken;
//! use vici::wire::Message;
//!
//! let session = vici::session::Session::connect(&Default::default()).await?;
//! let mut body = Message::new();
//! body.set("ike", "home");
//! let reply = session
//!     .call("initiate", body, CancellationToken::new(), None)
//!     .await?;
//! assert!(reply.is_success());
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod marshal;
pub mod session;
pub mod transport;
pub mod wire;

pub use error::{Result, VError};
