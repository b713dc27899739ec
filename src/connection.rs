//! The concurrent client connection (C4): the demultiplexer that lets unary
//! calls, streaming calls, and event subscriptions share one duplex stream.
// (c) 2024 Ross Younger
//!
//! This is the hard part of the crate. A single background reader task owns the
//! socket's read half and classifies every inbound packet by type, routing it to
//! exactly one of three destinations: the response queue (for whichever caller is
//! currently waiting), the streaming binding's internal channel (also the
//! response queue, tagged differently), or the subscriber fan-out set. The write
//! half is serialized behind a single lock and a monotonic sequence counter so
//! that a caller who abandons a request (cancellation, timeout) cannot be handed
//! a later caller's reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexSet;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant as TokioInstant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, VError};
use crate::transport::{self, Address, Stream};
use crate::wire::{Message, Packet, PacketKind, DEFAULT_MAX_SEGMENT_SIZE};

/// Default capacity of the response hand-off queue between the reader task and
/// whichever caller is currently waiting.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// An asynchronous event delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct Event {
    /// The event's name (as registered via `subscribe`).
    pub name: String,
    /// The event's payload.
    pub message: Message,
    /// When this process received the event.
    pub timestamp: Instant,
}

/// Configuration for a [`Connection`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Upper bound on a single packet's encoded payload, enforced on both the
    /// write and read paths.
    pub max_segment_size: u32,
    /// Capacity of the reader-to-caller response hand-off queue.
    pub queue_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Opaque handle to a registered subscriber sink, returned by
/// [`Connection::notify`] and accepted by [`Connection::unnotify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct StampedPacket {
    rseq: u64,
    packet: Packet,
}

enum QueueItem {
    Response(StampedPacket),
    StreamEvent(Message),
}

/// One-slot latch for the terminal error the reader task observes. Only the
/// most recent error is retained; if nobody has consumed the slot by the time a
/// second error would be published (which cannot happen here, since the reader
/// terminates on its first error, but the type is written generally), the older
/// value is simply overwritten.
#[derive(Default)]
struct ErrorLatch {
    value: Mutex<Option<Arc<VError>>>,
    notify: Notify,
}

impl ErrorLatch {
    async fn store(&self, err: VError) {
        let mut guard = self.value.lock().await;
        *guard = Some(Arc::new(err));
        drop(guard);
        self.notify.notify_waiters();
    }

    /// Waits for an error to be published. Never returns if none ever is.
    async fn wait(&self) -> Arc<VError> {
        loop {
            let notified = self.notify.notified();
            if let Some(e) = self.value.lock().await.clone() {
                return e;
            }
            notified.await;
        }
    }
}

struct WriteState<W> {
    writer: W,
    wseq: u64,
}

struct Shared<W> {
    write_state: Mutex<WriteState<W>>,
    response_rx: Mutex<mpsc::Receiver<QueueItem>>,
    error_latch: ErrorLatch,
    subscriptions: Mutex<IndexSet<String>>,
    streaming_binding: Mutex<Option<String>>,
    fanout: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
    next_sink_id: AtomicU64,
    rseq: AtomicU64,
    max_segment_size: u32,
    closed: AtomicBool,
    /// Fires to tell the reader task to stop, since shutting down the write
    /// half does not unblock a read in progress on the independently-owned
    /// read half.
    reader_shutdown: CancellationToken,
}

/// A live connection to charon. Cheap to clone (it is a handle around shared,
/// reference-counted state); clones refer to the same underlying socket and
/// reader task.
///
/// Only one top-level operation (`call`/`stream`/`subscribe`/`unsubscribe`)
/// should be in flight on a given `Connection` at a time — [`crate::session::Session`]
/// enforces this with its own top-level lock. Direct users of `Connection` must
/// provide that serialization themselves; the demultiplexer's sequence-matching
/// makes concurrent unary calls safe, but a concurrent `stream()` and `call()`
/// would each try to consume the single shared response queue.
pub struct Connection<W> {
    shared: Arc<Shared<W>>,
}

// Written by hand rather than `#[derive(Clone)]`: the derive would add a
// `W: Clone` bound that this type, a handle around an `Arc`, does not need.
impl<W> Clone for Connection<W> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<W> std::fmt::Debug for Connection<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Opens a connection to `address` using the default transport (a UNIX domain
/// socket) and default [`Options`].
pub async fn connect(address: &Address) -> Result<Connection<tokio::net::unix::OwnedWriteHalf>> {
    let stream = transport::dial(address).await?;
    let (r, w) = stream.into_split();
    Ok(Connection::from_halves(r, w, Options::default()))
}

/// Builds a connection from an already-established duplex stream, splitting it
/// into independent read/write halves and spawning the reader task. Used for
/// any transport other than the default UNIX socket, including the in-memory
/// pipes test plumbing builds on.
pub fn from_stream<S: Stream>(stream: S, options: Options) -> Connection<WriteHalf<S>> {
    let (r, w) = split(stream);
    Connection::from_halves(r, w, options)
}

impl<W> Connection<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Builds a connection from separately-owned read and write halves.
    pub fn from_halves<R>(read_half: R, write_half: W, options: Options) -> Connection<W>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            write_state: Mutex::new(WriteState {
                writer: write_half,
                wseq: 0,
            }),
            response_rx: Mutex::new(rx),
            error_latch: ErrorLatch::default(),
            subscriptions: Mutex::new(IndexSet::new()),
            streaming_binding: Mutex::new(None),
            fanout: Mutex::new(HashMap::new()),
            next_sink_id: AtomicU64::new(0),
            rseq: AtomicU64::new(0),
            max_segment_size: options.max_segment_size,
            closed: AtomicBool::new(false),
            reader_shutdown: CancellationToken::new(),
        });
        let reader_shared = shared.clone();
        tokio::spawn(reader_loop(read_half, reader_shared, tx));
        Connection { shared }
    }

    /// Issues a unary request and waits for its matching reply.
    ///
    /// `kind` must be [`PacketKind::CmdRequest`], [`PacketKind::EventRegister`]
    /// or [`PacketKind::EventUnregister`]; anything else is a programmer error in
    /// this crate's own higher layers, not a caller mistake, so it is asserted
    /// rather than returned as a typed error.
    pub async fn request(
        &self,
        kind: PacketKind,
        name: Option<&str>,
        body: Message,
        cancel: &CancellationToken,
        deadline: Option<TokioInstant>,
    ) -> Result<Message> {
        assert!(
            matches!(
                kind,
                PacketKind::CmdRequest | PacketKind::EventRegister | PacketKind::EventUnregister
            ),
            "request() is only for CmdRequest/EventRegister/EventUnregister"
        );
        let packet = Packet::new(kind, name, body)?;
        let wseq = self.write(&packet, cancel).await?;
        let reply = self.wait(wseq, cancel, deadline).await?;
        match kind {
            PacketKind::CmdRequest => match reply.kind {
                PacketKind::CmdResponse => reply.message.into_result(),
                other => Err(VError::protocol_mismatch(format!(
                    "expected CmdResponse, got {other:?}"
                ))),
            },
            PacketKind::EventRegister | PacketKind::EventUnregister => match reply.kind {
                PacketKind::EventConfirm => Ok(reply.message),
                PacketKind::EventUnknown => Err(VError::protocol_mismatch(format!(
                    "unknown event '{}'",
                    name.unwrap_or_default()
                ))),
                other => Err(VError::protocol_mismatch(format!(
                    "expected EventConfirm, got {other:?}"
                ))),
            },
            _ => unreachable!(),
        }
    }

    /// Begins a streaming call: registers `event`, binds it so matching event
    /// packets bypass the subscriber fan-out, writes the `CmdRequest`, and
    /// returns a lazy, restartable-once sequence of `(Message, error)` pairs.
    pub async fn stream(
        &self,
        cmd: &str,
        event: &str,
        body: Message,
        cancel: CancellationToken,
        deadline: Option<TokioInstant>,
    ) -> EventStream<W> {
        if let Err(e) = self
            .request(
                PacketKind::EventRegister,
                Some(event),
                Message::new(),
                &cancel,
                deadline,
            )
            .await
        {
            return EventStream::failed(self.clone(), event.to_string(), e);
        }
        *self.shared.streaming_binding.lock().await = Some(event.to_string());

        let packet = match Packet::new(PacketKind::CmdRequest, Some(cmd), body) {
            Ok(p) => p,
            Err(e) => {
                self.clear_streaming_binding(event).await;
                return EventStream::failed(self.clone(), event.to_string(), e);
            }
        };
        match self.write(&packet, &cancel).await {
            Ok(wseq) => EventStream {
                conn: self.clone(),
                event: event.to_string(),
                cancel,
                deadline,
                wseq,
                done: false,
                cleaned_up: false,
                pending_error: None,
            },
            Err(e) => {
                self.clear_streaming_binding(event).await;
                EventStream::failed(self.clone(), event.to_string(), e)
            }
        }
    }

    async fn clear_streaming_binding(&self, event: &str) {
        let mut binding = self.shared.streaming_binding.lock().await;
        if binding.as_deref() == Some(event) {
            *binding = None;
        }
    }

    /// Registers for one or more event names. A name already registered is
    /// skipped. If registration fails partway through the list, names already
    /// registered remain registered; there is no rollback (matching the
    /// best-maintained reference behaviour for this corner case).
    pub async fn subscribe(
        &self,
        names: &[&str],
        cancel: &CancellationToken,
        deadline: Option<TokioInstant>,
    ) -> Result<()> {
        let mut registry = self.shared.subscriptions.lock().await;
        for name in names {
            if registry.contains(*name) {
                continue;
            }
            self.request(
                PacketKind::EventRegister,
                Some(*name),
                Message::new(),
                cancel,
                deadline,
            )
            .await?;
            let _ = registry.insert((*name).to_string());
        }
        Ok(())
    }

    /// Unregisters one or more event names. An empty slice means "unregister
    /// everything currently registered", atomically with respect to the
    /// registry lock. Unregistering an absent name is a no-op.
    pub async fn unsubscribe(
        &self,
        names: &[&str],
        cancel: &CancellationToken,
        deadline: Option<TokioInstant>,
    ) -> Result<()> {
        let mut registry = self.shared.subscriptions.lock().await;
        let targets: Vec<String> = if names.is_empty() {
            registry.iter().cloned().collect()
        } else {
            names
                .iter()
                .filter(|n| registry.contains(**n))
                .map(|n| (*n).to_string())
                .collect()
        };
        for name in targets {
            self.request(
                PacketKind::EventUnregister,
                Some(name.as_str()),
                Message::new(),
                cancel,
                deadline,
            )
            .await?;
            let _ = registry.shift_remove(&name);
        }
        Ok(())
    }

    /// Registers a subscriber sink. Delivery to it is always non-blocking: a
    /// full sink only drops events for that subscriber, never for anyone else,
    /// and never blocks the reader task.
    pub async fn notify(&self, sink: mpsc::Sender<Event>) -> SubscriberId {
        let id = self.shared.next_sink_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.shared.fanout.lock().await.insert(id, sink);
        SubscriberId(id)
    }

    /// Removes a previously-registered subscriber sink.
    pub async fn unnotify(&self, id: SubscriberId) {
        let _ = self.shared.fanout.lock().await.remove(&id.0);
    }

    /// Closes the connection. Idempotent: closing twice is a no-op. Shutting
    /// down the write half only signals the peer; it does nothing to the
    /// independently-owned read half the reader task holds, so closing also
    /// signals `reader_shutdown` directly. The reader task then terminates,
    /// drops the response queue's sending half, and clears the subscriber
    /// fan-out set, which is what wakes any pending `wait()` with
    /// [`VError::Closed`].
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.reader_shutdown.cancel();
        let mut guard = self.shared.write_state.lock().await;
        let _ = guard.writer.shutdown().await;
    }

    async fn write(&self, packet: &Packet, cancel: &CancellationToken) -> Result<u64> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(VError::Closed);
        }
        let mut guard = tokio::select! {
            g = self.shared.write_state.lock() => g,
            () = cancel.cancelled() => return Err(VError::Cancelled),
        };
        tokio::select! {
            res = packet.write_framed(&mut guard.writer, self.shared.max_segment_size) => {
                res?;
            }
            () = cancel.cancelled() => {
                // The write may have been partially flushed to the underlying
                // stream; see the module docs on cancellation for the caveat
                // this implies for framing integrity on cancel-during-write.
                return Err(VError::Cancelled);
            }
        }
        guard.wseq += 1;
        trace!(wseq = guard.wseq, kind = ?packet.kind, "wrote packet");
        Ok(guard.wseq)
    }

    /// Waits for the response whose stamped sequence matches `target_wseq`,
    /// silently draining any stale response left over from an abandoned caller.
    async fn wait(
        &self,
        target_wseq: u64,
        cancel: &CancellationToken,
        deadline: Option<TokioInstant>,
    ) -> Result<Packet> {
        match self.wait_raw(target_wseq, cancel, deadline).await? {
            WaitItem::Response(p) => Ok(p),
            WaitItem::StreamEvent(_) => Err(VError::protocol_mismatch(
                "received a streamed event while waiting for a unary response",
            )),
        }
    }

    async fn wait_raw(
        &self,
        target_wseq: u64,
        cancel: &CancellationToken,
        deadline: Option<TokioInstant>,
    ) -> Result<WaitItem> {
        let mut rx = self.shared.response_rx.lock().await;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(VError::Cancelled),
                () = sleep_until_opt(deadline) => return Err(VError::Cancelled),
                err = self.shared.error_latch.wait() => return Err(err.as_ref().clone_for_wait()),
                item = rx.recv() => {
                    match item {
                        None => return Err(VError::Closed),
                        Some(QueueItem::StreamEvent(msg)) => return Ok(WaitItem::StreamEvent(msg)),
                        Some(QueueItem::Response(sp)) => {
                            if sp.rseq == target_wseq {
                                return Ok(WaitItem::Response(sp.packet));
                            }
                            debug!(rseq = sp.rseq, target_wseq, "draining stale response");
                            continue;
                        }
                    }
                }
            }
        }
    }
}

enum WaitItem {
    Response(Packet),
    StreamEvent(Message),
}

impl VError {
    /// Errors surfaced through the latch are shared (`Arc`); this produces an
    /// owned value carrying the same information for the caller.
    fn clone_for_wait(&self) -> VError {
        match self {
            VError::Encoding(s) => VError::Encoding(s.clone()),
            VError::Malformed(s) => VError::Malformed(s.clone()),
            VError::Transport(e) => VError::Transport(std::io::Error::new(e.kind(), e.to_string())),
            VError::ProtocolMismatch(s) => VError::ProtocolMismatch(s.clone()),
            VError::CommandFailed(s) => VError::CommandFailed(s.clone()),
            VError::Cancelled => VError::Cancelled,
            VError::Closed => VError::Closed,
        }
    }
}

async fn sleep_until_opt(deadline: Option<TokioInstant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(instant).await,
        None => std::future::pending().await,
    }
}

async fn reader_loop<R, W>(mut reader: R, shared: Arc<Shared<W>>, tx: mpsc::Sender<QueueItem>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            biased;
            () = shared.reader_shutdown.cancelled() => {
                debug!("reader terminating: connection closed");
                break;
            }
            res = Packet::read_framed(&mut reader, shared.max_segment_size) => {
                match res {
                    Ok(packet) => dispatch(&shared, &tx, packet).await,
                    Err(e) if is_invalid_ptype(&e) => {
                        // "Invalid ptype: ignore (do not terminate the loop)" — a
                        // misbehaving or newer-than-us peer shouldn't take the whole
                        // connection down over one packet we don't understand.
                        warn!("ignoring packet with invalid type: {e}");
                    }
                    Err(e) => {
                        debug!("reader terminating: {e}");
                        shared.error_latch.store(e).await;
                        break;
                    }
                }
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.fanout.lock().await.clear();
    // Dropping `tx` here (end of function) closes the response queue, which is
    // the definitive signal pending `wait()` callers key off.
}

fn is_invalid_ptype(e: &VError) -> bool {
    matches!(e, VError::Malformed(msg) if msg.contains("invalid packet type"))
}

async fn dispatch<W>(shared: &Arc<Shared<W>>, tx: &mpsc::Sender<QueueItem>, packet: Packet) {
    match packet.kind {
        PacketKind::Event => {
            let name = packet.name.clone().unwrap_or_default();
            let event = Event {
                name: name.clone(),
                message: packet.message,
                timestamp: Instant::now(),
            };
            let streaming = shared.streaming_binding.lock().await.clone();
            if streaming.as_deref() == Some(name.as_str()) {
                if tx.try_send(QueueItem::StreamEvent(event.message)).is_err() {
                    warn!(event = %name, "response queue full, dropping streamed event");
                }
                return;
            }
            let subscribed = shared.subscriptions.lock().await.contains(&name);
            if subscribed {
                let fanout = shared.fanout.lock().await;
                for sink in fanout.values() {
                    if sink.try_send(event.clone()).is_err() {
                        trace!(event = %name, "subscriber sink full, dropping event for it");
                    }
                }
            }
            // No streaming binding and no subscription: discard silently.
        }
        PacketKind::CmdResponse
        | PacketKind::CmdUnknown
        | PacketKind::EventConfirm
        | PacketKind::EventUnknown => {
            let rseq = shared.rseq.fetch_add(1, Ordering::SeqCst) + 1;
            if tx
                .try_send(QueueItem::Response(StampedPacket { rseq, packet }))
                .is_err()
            {
                warn!(rseq, "response queue full, dropping response");
            }
        }
        PacketKind::CmdRequest | PacketKind::EventRegister | PacketKind::EventUnregister => {
            warn!(kind = ?packet.kind, "ignoring unexpected server-to-client request packet");
        }
    }
}

/// A lazy, restartable-once sequence of `(Message, error)` pairs produced by a
/// streaming call. Call [`EventStream::next`] in a loop; `None` means the
/// sequence is exhausted (the server's terminating `CmdResponse` was a success
/// with nothing further to report).
pub struct EventStream<W> {
    conn: Connection<W>,
    event: String,
    cancel: CancellationToken,
    deadline: Option<TokioInstant>,
    wseq: u64,
    done: bool,
    cleaned_up: bool,
    pending_error: Option<VError>,
}

impl<W> std::fmt::Debug for EventStream<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("event", &self.event)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<W> EventStream<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn failed(conn: Connection<W>, event: String, err: VError) -> Self {
        Self {
            conn,
            event,
            cancel: CancellationToken::new(),
            deadline: None,
            wseq: 0,
            done: true,
            cleaned_up: true,
            pending_error: Some(err),
        }
    }

    /// Advances the sequence by one item.
    pub async fn next(&mut self) -> Option<Result<Message>> {
        if let Some(e) = self.pending_error.take() {
            self.done = true;
            return Some(Err(e));
        }
        if self.done {
            return None;
        }
        let outcome = self.conn.wait_raw(self.wseq, &self.cancel, self.deadline).await;
        match outcome {
            Ok(WaitItem::StreamEvent(msg)) => Some(Ok(msg)),
            Ok(WaitItem::Response(p)) => {
                self.done = true;
                self.cleanup().await;
                match p.kind {
                    PacketKind::CmdResponse => match p.message.into_result() {
                        Ok(_) => None,
                        Err(e) => Some(Err(e)),
                    },
                    other => Some(Err(VError::protocol_mismatch(format!(
                        "expected CmdResponse to terminate stream, got {other:?}"
                    )))),
                }
            }
            Err(e) => {
                self.done = true;
                self.cleanup().await;
                Some(Err(e))
            }
        }
    }

    async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        self.conn.clear_streaming_binding(&self.event).await;
        // Best-effort: the request is already done, so an unregister failure
        // (e.g. the connection just died) is not worth surfacing.
        let _ = self
            .conn
            .request(
                PacketKind::EventUnregister,
                Some(&self.event),
                Message::new(),
                &CancellationToken::new(),
                None,
            )
            .await;
    }
}

impl<W> Drop for EventStream<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }
        // The consumer abandoned the sequence before it terminated naturally
        // (step 5 of the streaming contract: cleanup must happen "regardless of
        // how the loop ends"). Async cleanup can't run inside `Drop`, so it is
        // spawned as best-effort background work.
        self.cleaned_up = true;
        let conn = self.conn.clone();
        let event = self.event.clone();
        tokio::spawn(async move {
            conn.clear_streaming_binding(&event).await;
            let _ = conn
                .request(
                    PacketKind::EventUnregister,
                    Some(&event),
                    Message::new(),
                    &CancellationToken::new(),
                    None,
                )
                .await;
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    type TestConn = Connection<WriteHalf<tokio::io::DuplexStream>>;

    fn test_connection() -> (TestConn, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let conn = from_stream(client, Options::default());
        (conn, server)
    }

    fn success_body() -> Message {
        let mut msg = Message::new();
        msg.set("success", "yes");
        msg
    }

    #[tokio::test]
    async fn unary_request_round_trip() {
        let (conn, mut server) = test_connection();
        let server_task = tokio::spawn(async move {
            let req = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(req.kind, PacketKind::CmdRequest);
            assert_eq!(req.name.as_deref(), Some("version"));
            let reply = Packet::new(PacketKind::CmdResponse, None::<String>, success_body()).unwrap();
            reply
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            server
        });
        let reply = conn
            .request(
                PacketKind::CmdRequest,
                Some("version"),
                Message::new(),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert!(reply.is_success());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn command_failure_surfaces_errmsg() {
        let (conn, mut server) = test_connection();
        tokio::spawn(async move {
            let _req = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            let mut body = Message::new();
            body.set("success", "no");
            body.set("errmsg", "no such connection");
            let reply = Packet::new(PacketKind::CmdResponse, None::<String>, body).unwrap();
            reply
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
        });
        let err = conn
            .request(
                PacketKind::CmdRequest,
                Some("initiate"),
                Message::new(),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        match err {
            VError::CommandFailed(m) => assert_eq!(m, "no such connection"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    /// Scenario E: a caller abandons a request; the eventual reply must not be
    /// handed to the next caller's `wait()`.
    #[tokio::test]
    async fn stale_response_is_drained_not_misdelivered() {
        let (conn, mut server) = test_connection();
        let cancel_a = CancellationToken::new();
        let cancel_a2 = cancel_a.clone();
        tokio::spawn(async move {
            // Long enough for A's write to land on the duplex pipe, short
            // enough that the server hasn't replied yet (it isn't even
            // spawned until after A gives up below).
            tokio::time::sleep(Duration::from_millis(5)).await;
            cancel_a2.cancel();
        });

        // Caller A writes its request, then is cancelled before any reply
        // arrives.
        let a = conn
            .request(
                PacketKind::CmdRequest,
                Some("first"),
                Message::new(),
                &cancel_a,
                None,
            )
            .await;
        assert!(matches!(a, Err(VError::Cancelled)));

        // The server only now sees A's request and replies to it, then sees B's
        // and replies to that too.
        let server_task = tokio::spawn(async move {
            for _ in 0..2 {
                let req = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                    .await
                    .unwrap();
                let mut body = success_body();
                body.set("for", req.name.clone().unwrap());
                let reply = Packet::new(PacketKind::CmdResponse, None::<String>, body).unwrap();
                reply
                    .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                    .await
                    .unwrap();
            }
        });

        let b = conn
            .request(
                PacketKind::CmdRequest,
                Some("second"),
                Message::new(),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(b.get_str("for").as_deref(), Some("second"));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_is_preferred_over_a_slow_reply() {
        let (conn, _server) = test_connection();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });
        let err = conn
            .request(
                PacketKind::CmdRequest,
                Some("slow"),
                Message::new(),
                &cancel,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VError::Cancelled));
    }

    #[tokio::test]
    async fn subscription_delivers_matching_events_only() {
        let (conn, mut server) = test_connection();

        // Spawned before the `subscribe()` call below is awaited: that call
        // blocks on the server's `EventConfirm`, so the server side must
        // already be running to avoid deadlocking a single-threaded runtime.
        let server_task = tokio::spawn(async move {
            let reg = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(reg.kind, PacketKind::EventRegister);
            let confirm = Packet::new(PacketKind::EventConfirm, None::<String>, Message::new()).unwrap();
            confirm
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            let mut matching = Message::new();
            matching.set("up", "yes");
            let ev = Packet::new(PacketKind::Event, Some("ike-updown"), matching).unwrap();
            ev.write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            let mut other = Message::new();
            other.set("child", "1");
            let ev2 = Packet::new(PacketKind::Event, Some("child-updown"), other).unwrap();
            ev2.write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
        });

        let (tx, mut rx) = mpsc::channel(8);
        let _id = conn.notify(tx).await;
        conn.subscribe(&["ike-updown"], &CancellationToken::new(), None)
            .await
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(got.name, "ike-updown");
        assert_eq!(got.message.get_str("up").as_deref(), Some("yes"));

        // The unrelated event was discarded, not queued: nothing else arrives.
        let nothing = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(nothing.is_err());
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn closing_wakes_a_pending_waiter_with_closed() {
        let (conn, server) = test_connection();
        drop(server); // simulates the peer hanging up
        let err = conn
            .request(
                PacketKind::CmdRequest,
                Some("version"),
                Message::new(),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VError::Transport(_) | VError::Closed));
    }

    /// `close()` must wake a waiter blocked on a no-deadline call, not just
    /// short-circuit future calls via the `closed` flag: shutting down the
    /// write half alone doesn't touch the reader task's independently-owned
    /// read half, so `close()` has to signal the reader directly.
    #[tokio::test]
    async fn close_wakes_a_pending_waiter_with_no_deadline() {
        let (conn, _server) = test_connection();
        let conn2 = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            conn2.close().await;
        });
        let err = conn
            .request(
                PacketKind::CmdRequest,
                Some("slow"),
                Message::new(),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VError::Closed));
    }

    /// Exercises `stream()`/`EventStream::next()` end-to-end: events bound to
    /// the stream must bypass subscriber fan-out entirely (no subscriber is even
    /// registered here) and the terminating `CmdResponse` must end the sequence
    /// and trigger automatic unregistration.
    #[tokio::test]
    async fn streaming_call_interleaves_events_then_terminates() {
        let (conn, mut server) = test_connection();

        let server_task = tokio::spawn(async move {
            let reg = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(reg.kind, PacketKind::EventRegister);
            assert_eq!(reg.name.as_deref(), Some("list-sa"));
            let confirm = Packet::new(PacketKind::EventConfirm, None::<String>, Message::new()).unwrap();
            confirm
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            let cmd = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(cmd.kind, PacketKind::CmdRequest);
            assert_eq!(cmd.name.as_deref(), Some("list-sas"));

            for n in 1..=2 {
                let mut body = Message::new();
                body.set("name", format!("conn{n}"));
                let ev = Packet::new(PacketKind::Event, Some("list-sa"), body).unwrap();
                ev.write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                    .await
                    .unwrap();
            }
            let reply = Packet::new(PacketKind::CmdResponse, None::<String>, success_body()).unwrap();
            reply
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            let unreg = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(unreg.kind, PacketKind::EventUnregister);
            assert_eq!(unreg.name.as_deref(), Some("list-sa"));
            let confirm2 = Packet::new(PacketKind::EventConfirm, None::<String>, Message::new()).unwrap();
            confirm2
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
        });

        let mut stream = conn
            .stream(
                "list-sas",
                "list-sa",
                Message::new(),
                CancellationToken::new(),
                None,
            )
            .await;

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.get_str("name").as_deref(), Some("conn1"));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.get_str("name").as_deref(), Some("conn2"));
        assert!(stream.next().await.is_none());
        // Calling next() again on an exhausted stream stays exhausted.
        assert!(stream.next().await.is_none());

        server_task.await.unwrap();
    }

    /// A subscriber registered on the same event name as an active `stream()`
    /// call must see nothing for that name until the stream ends, then resume
    /// normal delivery.
    #[tokio::test]
    async fn streaming_isolates_events_from_concurrent_subscriber() {
        let (conn, mut server) = test_connection();

        let server_task = tokio::spawn(async move {
            let sub_reg = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(sub_reg.kind, PacketKind::EventRegister);
            assert_eq!(sub_reg.name.as_deref(), Some("list-sa"));
            let confirm = Packet::new(PacketKind::EventConfirm, None::<String>, Message::new()).unwrap();
            confirm
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            let stream_reg = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(stream_reg.kind, PacketKind::EventRegister);
            assert_eq!(stream_reg.name.as_deref(), Some("list-sa"));
            let confirm2 = Packet::new(PacketKind::EventConfirm, None::<String>, Message::new()).unwrap();
            confirm2
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            let cmd = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(cmd.kind, PacketKind::CmdRequest);

            // While the stream is active, this event must reach only the stream.
            let mut body = Message::new();
            body.set("name", "conn1");
            let ev = Packet::new(PacketKind::Event, Some("list-sa"), body).unwrap();
            ev.write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            let reply = Packet::new(PacketKind::CmdResponse, None::<String>, success_body()).unwrap();
            reply
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            let unreg = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(unreg.kind, PacketKind::EventUnregister);
            let confirm3 = Packet::new(PacketKind::EventConfirm, None::<String>, Message::new()).unwrap();
            confirm3
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            // With the stream done, the same event name must resume normal
            // fan-out delivery to the subscriber.
            let mut body2 = Message::new();
            body2.set("name", "conn2");
            let ev2 = Packet::new(PacketKind::Event, Some("list-sa"), body2).unwrap();
            ev2.write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
        });

        let (tx, mut rx) = mpsc::channel(8);
        let _id = conn.notify(tx).await;
        conn.subscribe(&["list-sa"], &CancellationToken::new(), None)
            .await
            .unwrap();

        let mut stream = conn
            .stream(
                "list-sas",
                "list-sa",
                Message::new(),
                CancellationToken::new(),
                None,
            )
            .await;

        let during = stream.next().await.unwrap().unwrap();
        assert_eq!(during.get_str("name").as_deref(), Some("conn1"));

        // While the stream was active, the subscriber must not have seen it.
        let isolated = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await;
        assert!(isolated.is_err());

        // The terminating CmdResponse: ends the sequence and unregisters.
        assert!(stream.next().await.is_none());

        let resumed = rx.recv().await.unwrap();
        assert_eq!(resumed.name, "list-sa");
        assert_eq!(resumed.message.get_str("name").as_deref(), Some("conn2"));

        server_task.await.unwrap();
    }

    /// One subscriber with a capacity-1 sink must not block delivery to other
    /// subscribers, nor block the reader task from servicing later calls.
    #[tokio::test]
    async fn fanout_does_not_block_on_a_full_subscriber() {
        let (conn, mut server) = test_connection();

        let server_task = tokio::spawn(async move {
            let reg = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(reg.kind, PacketKind::EventRegister);
            let confirm = Packet::new(PacketKind::EventConfirm, None::<String>, Message::new()).unwrap();
            confirm
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();

            for n in 1..=5 {
                let mut body = Message::new();
                body.set("n", n.to_string());
                let ev = Packet::new(PacketKind::Event, Some("ike-updown"), body).unwrap();
                ev.write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                    .await
                    .unwrap();
            }

            // Proves the reader kept servicing the socket throughout: if fan-out
            // had blocked on the full sink, this round trip would never complete.
            let cmd = Packet::read_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
            assert_eq!(cmd.kind, PacketKind::CmdRequest);
            let reply = Packet::new(PacketKind::CmdResponse, None::<String>, success_body()).unwrap();
            reply
                .write_framed(&mut server, DEFAULT_MAX_SEGMENT_SIZE)
                .await
                .unwrap();
        });

        let (small_tx, mut small_rx) = mpsc::channel(1);
        let (big_tx, mut big_rx) = mpsc::channel(8);
        let _small_id = conn.notify(small_tx).await;
        let _big_id = conn.notify(big_tx).await;
        conn.subscribe(&["ike-updown"], &CancellationToken::new(), None)
            .await
            .unwrap();

        // Let the reader dispatch all five events before anyone drains
        // anything, so the capacity-1 sink is guaranteed to be full partway
        // through delivery.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reply = conn
            .request(
                PacketKind::CmdRequest,
                Some("version"),
                Message::new(),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert!(reply.is_success());

        let mut seen = Vec::new();
        while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(20), big_rx.recv()).await {
            seen.push(ev.message.get_str("n").unwrap());
        }
        assert_eq!(seen, vec!["1", "2", "3", "4", "5"]);

        // The capacity-1 sink only ever had room for the first event; the rest
        // were dropped for it alone, which is the point.
        let mut small_seen = 0;
        while small_rx.try_recv().is_ok() {
            small_seen += 1;
        }
        assert_eq!(small_seen, 1);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, _server) = test_connection();
        conn.close().await;
        conn.close().await;
        let err = conn
            .request(
                PacketKind::CmdRequest,
                Some("version"),
                Message::new(),
                &CancellationToken::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VError::Closed));
    }
}
