//! A friendlier facade over a [`Connection`] (C5).
// (c) 2024 Ross Younger
//!
//! [`Connection`] is deliberately low-level: its demultiplexer is safe for
//! concurrent unary calls, but only one top-level operation (a `call`, a
//! `stream`, a `subscribe`) should be in flight at a time, since they all share
//! the same response queue. `Session` adds that serialisation with a single
//! top-level lock, so callers don't have to reason about it themselves.

use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::connection::{self, Connection, Event, EventStream, SubscriberId};
use crate::error::Result;
use crate::transport::Address;
use crate::wire::{Message, PacketKind};

/// A VICI client session: one connection, with its top-level operations
/// serialised against each other.
pub struct Session<W> {
    conn: Connection<W>,
    lock: Mutex<()>,
}

impl<W> std::fmt::Debug for Session<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("conn", &self.conn).finish_non_exhaustive()
    }
}

/// The concrete [`Session`] type returned by [`Session::connect`].
pub type DefaultSession = Session<tokio::net::unix::OwnedWriteHalf>;

impl Session<()> {
    /// Opens a session to `address` using the default transport (a UNIX
    /// domain socket).
    pub async fn connect(address: &Address) -> Result<DefaultSession> {
        let conn = connection::connect(address).await?;
        Ok(Session {
            conn,
            lock: Mutex::new(()),
        })
    }
}

impl<W> Session<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Wraps an already-built [`Connection`], for non-default transports.
    pub fn new(conn: Connection<W>) -> Self {
        Self {
            conn,
            lock: Mutex::new(()),
        }
    }

    /// Issues a unary command and waits for its response. Fails with
    /// [`crate::VError::CommandFailed`] if the response carries
    /// `success = "no"`.
    pub async fn call(
        &self,
        command: &str,
        body: Message,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<Message> {
        let _guard = self.lock.lock().await;
        self.conn
            .request(PacketKind::CmdRequest, Some(command), body, &cancel, deadline)
            .await
    }

    /// Convenience wrapper for `call` with no cancellation or deadline.
    pub async fn call_simple(&self, command: &str, body: Message) -> Result<Message> {
        self.call(command, body, CancellationToken::new(), None).await
    }

    /// Begins a streaming command (`cmd` paired with `event`). The top-level
    /// lock is held for the registration/write step only; the returned
    /// [`EventStream`] itself does not hold it, since pumping it is the
    /// caller's job and may take an arbitrary amount of time.
    pub async fn stream(
        &self,
        cmd: &str,
        event: &str,
        body: Message,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> EventStream<W> {
        let _guard = self.lock.lock().await;
        self.conn.stream(cmd, event, body, cancel, deadline).await
    }

    /// Convenience wrapper for `stream` with no cancellation or deadline.
    pub async fn stream_simple(&self, cmd: &str, event: &str, body: Message) -> EventStream<W> {
        self.stream(cmd, event, body, CancellationToken::new(), None).await
    }

    /// Registers for one or more event names.
    pub async fn subscribe(
        &self,
        names: &[&str],
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.conn.subscribe(names, &cancel, deadline).await
    }

    /// Unregisters one or more event names.
    pub async fn unsubscribe(
        &self,
        names: &[&str],
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.conn.unsubscribe(names, &cancel, deadline).await
    }

    /// Unregisters every currently-registered event name.
    pub async fn unsubscribe_all(&self, cancel: CancellationToken, deadline: Option<Instant>) -> Result<()> {
        self.unsubscribe(&[], cancel, deadline).await
    }

    /// Registers a subscriber sink and returns both its handle (for
    /// [`Session::stop_notify`]) and a freshly-created receiver of the
    /// requested buffer capacity.
    pub async fn notify(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.conn.notify(tx).await;
        (id, rx)
    }

    /// Removes a previously-registered subscriber sink.
    pub async fn stop_notify(&self, id: SubscriberId) {
        self.conn.unnotify(id).await;
    }

    /// Closes the underlying connection.
    pub async fn close(&self) {
        self.conn.close().await;
    }

    /// A convenience deadline `duration` from now, for callers who'd rather
    /// think in relative terms than absolute [`Instant`]s.
    pub fn deadline_in(duration: Duration) -> Instant {
        Instant::now() + duration
    }
}
