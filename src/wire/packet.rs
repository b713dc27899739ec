//! Packet framing: wrapping a [`Message`] with a packet type and the outer
//! length-prefixed wire frame (C3)
// (c) 2024 Ross Younger

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, VError};
use crate::wire::message::Message;
use crate::wire::primitive::{write_u32, Cursor};

/// The recommended upper bound on an outer frame's payload length, matching the
/// documented server-side ceiling. The 4-byte outer length field could in
/// principle carry up to `2^32 - 1` bytes; this crate enforces the smaller,
/// documented limit by default.
pub const DEFAULT_MAX_SEGMENT_SIZE: u32 = 512 * 1024;

/// The kind of a packet, carried as a single byte immediately after the outer
/// frame length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Issue a command request. Named.
    CmdRequest,
    /// A reply to a command request.
    CmdResponse,
    /// The command was not recognised by the peer.
    CmdUnknown,
    /// Request to register for an event. Named.
    EventRegister,
    /// Request to unregister from an event. Named.
    EventUnregister,
    /// Confirms an event (un)registration.
    EventConfirm,
    /// The peer does not know of the named event.
    EventUnknown,
    /// An asynchronous event notification. Named.
    Event,
}

impl PacketKind {
    const fn wire_value(self) -> u8 {
        match self {
            PacketKind::CmdRequest => 0,
            PacketKind::CmdResponse => 1,
            PacketKind::CmdUnknown => 2,
            PacketKind::EventRegister => 3,
            PacketKind::EventUnregister => 4,
            PacketKind::EventConfirm => 5,
            PacketKind::EventUnknown => 6,
            PacketKind::Event => 7,
        }
    }

    fn from_wire_value(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PacketKind::CmdRequest,
            1 => PacketKind::CmdResponse,
            2 => PacketKind::CmdUnknown,
            3 => PacketKind::EventRegister,
            4 => PacketKind::EventUnregister,
            5 => PacketKind::EventConfirm,
            6 => PacketKind::EventUnknown,
            7 => PacketKind::Event,
            other => return Err(VError::malformed(format!("invalid packet type {other}"))),
        })
    }

    /// Named types carry a `name` field on the wire; the rest do not.
    pub const fn is_named(self) -> bool {
        matches!(
            self,
            PacketKind::CmdRequest
                | PacketKind::EventRegister
                | PacketKind::EventUnregister
                | PacketKind::Event
        )
    }
}

/// A complete packet: a [`PacketKind`], an optional name (required exactly when
/// the kind is named), and a [`Message`] body.
///
/// `seq` is not part of the wire representation; it is stamped by the
/// connection's reader loop to correlate responses with callers (see
/// [`crate::connection`]).
#[derive(Debug, Clone)]
pub struct Packet {
    /// The packet's type.
    pub kind: PacketKind,
    /// The packet's name, present iff `kind.is_named()`.
    pub name: Option<String>,
    /// The packet's message body.
    pub message: Message,
}

impl Packet {
    /// Builds a packet, validating the name/kind pairing.
    pub fn new(kind: PacketKind, name: Option<impl Into<String>>, message: Message) -> Result<Self> {
        let name = name.map(Into::into);
        validate_name(kind, name.as_deref())?;
        Ok(Self { kind, name, message })
    }

    /// Encodes this packet's payload (type + optional name + message body),
    /// without the outer 4-byte length frame.
    fn encode_payload(&self) -> Result<Vec<u8>> {
        validate_name(self.kind, self.name.as_deref())?;
        let mut out = Vec::new();
        out.push(self.kind.wire_value());
        if let Some(name) = &self.name {
            let len: u8 = name
                .len()
                .try_into()
                .map_err(|_| VError::encoding("packet name too long"))?;
            out.push(len);
            out.extend_from_slice(name.as_bytes());
        }
        out.extend_from_slice(&self.message.encode()?);
        Ok(out)
    }

    /// Decodes a packet from a complete, already-length-delimited payload
    /// (the bytes that followed the outer 4-byte length on the wire).
    fn decode_payload(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        let kind = PacketKind::from_wire_value(cur.read_u8()?)?;
        let name = if kind.is_named() {
            let bytes = cur.read_u8_len_bytes()?;
            if bytes.is_empty() {
                return Err(VError::malformed("named packet with empty name"));
            }
            Some(
                String::from_utf8(bytes.to_vec())
                    .map_err(|_| VError::malformed("packet name is not valid utf-8"))?,
            )
        } else {
            None
        };
        let message = Message::decode(cur.tail())?;
        Ok(Self { kind, name, message })
    }

    /// Writes this packet to `writer`, preceded by its 4-byte big-endian outer
    /// length. Fails before writing anything if validation or encoding fails.
    pub async fn write_framed<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        max_segment_size: u32,
    ) -> Result<()> {
        let payload = self.encode_payload()?;
        if payload.len() as u64 > u64::from(max_segment_size) {
            return Err(VError::encoding(format!(
                "packet payload of {} bytes exceeds the {max_segment_size}-byte segment limit",
                payload.len()
            )));
        }
        let mut framed = Vec::with_capacity(4 + payload.len());
        write_u32(&mut framed, payload.len())?;
        framed.extend_from_slice(&payload);
        writer.write_all(&framed).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one complete framed packet from `reader`.
    pub async fn read_framed<R: AsyncRead + Unpin>(
        reader: &mut R,
        max_segment_size: u32,
    ) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > max_segment_size {
            return Err(VError::malformed(format!(
                "declared segment length {len} exceeds the {max_segment_size}-byte limit"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        Self::decode_payload(&payload)
    }
}

fn validate_name(kind: PacketKind, name: Option<&str>) -> Result<()> {
    match (kind.is_named(), name) {
        (true, None) => Err(VError::encoding(format!("{kind:?} requires a name"))),
        (true, Some(n)) if n.is_empty() => {
            Err(VError::encoding("named packet must not have an empty name"))
        }
        (false, Some(_)) => Err(VError::encoding(format!("{kind:?} must not carry a name"))),
        _ => Ok(()),
    }
}
