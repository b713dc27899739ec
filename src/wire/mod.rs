//! The wire codec: primitive readers/writers (C1), the recursive `Message`
//! grammar (C2), and packet framing (C3).
// (c) 2024 Ross Younger

pub(crate) mod primitive;

pub mod message;
pub mod packet;

pub use message::{IntoValue, Message, Value, MAX_KEY_LEN, MAX_SECTION_DEPTH, MAX_VALUE_LEN};
pub use packet::{Packet, PacketKind, DEFAULT_MAX_SEGMENT_SIZE};
