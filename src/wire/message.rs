//! The recursive `Message` value and its wire codec (C2)
// (c) 2024 Ross Younger
//!
//! A [`Message`] is an ordered mapping from string keys to one of three value
//! shapes: a scalar byte string, a list of byte strings, or a nested `Message`
//! ("section"). Insertion order is preserved and is part of a `Message`'s
//! observable identity: encoding the same insertion order always yields
//! identical bytes (see the `tag_determinism` test below).
//!
//! Unlike the reflection-friendly `interface{}` the original protocol's reference
//! implementation uses for values, this crate represents a value as a tagged
//! [`Value`] enum. That rules out an "unsupported value variant" encoding failure
//! by construction: there is no way to build a `Message` whose values aren't one
//! of the three wire shapes in the first place.

use indexmap::IndexMap;

use crate::error::{Result, VError};
use crate::wire::primitive::{write_u16_len_bytes, write_u8_len_bytes, Cursor};

/// Soft cap on section nesting depth, enforced by the decoder to bound stack
/// usage against hostile or corrupted input. The wire format itself imposes no
/// depth limit.
pub const MAX_SECTION_DEPTH: usize = 64;

/// Maximum length of a scalar value or list item, in bytes.
pub const MAX_VALUE_LEN: usize = u16::MAX as usize;

/// Maximum length of a key, in bytes.
pub const MAX_KEY_LEN: usize = u8::MAX as usize;

const TAG_SECTION_START: u8 = 1;
const TAG_SECTION_END: u8 = 2;
const TAG_KEY_VALUE: u8 = 3;
const TAG_LIST_START: u8 = 4;
const TAG_LIST_ITEM: u8 = 5;
const TAG_LIST_END: u8 = 6;

/// A single `Message` field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A scalar byte string (length must be `<= 65535` to be encodable).
    Str(Vec<u8>),
    /// A list of byte strings (each must be `<= 65535` to be encodable; the list
    /// itself has no length limit imposed by the wire format).
    List(Vec<Vec<u8>>),
    /// A nested message.
    Section(Message),
}

impl Value {
    /// Convenience accessor for the scalar case, doing a lossy UTF-8 conversion.
    pub fn as_str(&self) -> Option<String> {
        match self {
            Value::Str(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }
}

/// The recursive, ordered key/value structure exchanged with charon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: IndexMap<String, Value>,
}

impl Message {
    /// Creates an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this message's keys, in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Returns the number of top-level fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if this message has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Looks up a field by key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Looks up a scalar field, lossily converted to a `String`.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(Value::as_str)
    }

    /// Looks up a list field.
    pub fn get_list(&self, key: &str) -> Option<&[Vec<u8>]> {
        match self.get(key) {
            Some(Value::List(items)) => Some(items),
            _ => None,
        }
    }

    /// Looks up a section field.
    pub fn get_section(&self, key: &str) -> Option<&Message> {
        match self.get(key) {
            Some(Value::Section(m)) => Some(m),
            _ => None,
        }
    }

    /// Sets `key` to `value`, converting it per the rules in [`IntoValue`].
    ///
    /// Inserting an existing key overwrites the value but preserves its position
    /// in the key order (this falls directly out of [`IndexMap::insert`]'s
    /// behaviour). A value that converts to "no value" (a `None` `Option`, or a
    /// nil-equivalent) is treated as "unset" rather than "present but empty",
    /// so the key is removed instead of being given an empty value.
    pub fn set<V: IntoValue>(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        match value.into_value() {
            Some(v) => {
                let _ = self.fields.insert(key, v);
            }
            None => {
                let _ = self.fields.shift_remove(&key);
            }
        }
    }

    /// Removes `key` if present. A no-op if absent.
    pub fn unset(&mut self, key: &str) {
        let _ = self.fields.shift_remove(key);
    }

    /// Inserts a value during decoding, rejecting a key that is already present.
    fn insert_decoded(&mut self, key: String, value: Value) -> Result<()> {
        if self.fields.contains_key(&key) {
            return Err(VError::malformed(format!("duplicate key '{key}'")));
        }
        let _ = self.fields.insert(key, value);
        Ok(())
    }

    /// Encodes this message's elements (without any packet/frame wrapper).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        for (key, value) in &self.fields {
            match value {
                Value::Str(bytes) => {
                    out.push(TAG_KEY_VALUE);
                    write_u8_len_bytes(out, key.as_bytes())?;
                    write_u16_len_bytes(out, bytes)?;
                }
                Value::List(items) => {
                    out.push(TAG_LIST_START);
                    write_u8_len_bytes(out, key.as_bytes())?;
                    for item in items {
                        out.push(TAG_LIST_ITEM);
                        write_u16_len_bytes(out, item)?;
                    }
                    out.push(TAG_LIST_END);
                }
                Value::Section(inner) => {
                    out.push(TAG_SECTION_START);
                    write_u8_len_bytes(out, key.as_bytes())?;
                    inner.encode_into(out)?;
                    out.push(TAG_SECTION_END);
                }
            }
        }
        Ok(())
    }

    /// Decodes a complete message from `buf`. The entire slice must be consumed;
    /// trailing bytes are a malformed-message error.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(buf);
        let msg = Self::decode_elements(&mut cur, 0, false)?;
        if !cur.is_empty() {
            return Err(VError::malformed("trailing bytes after message"));
        }
        Ok(msg)
    }

    fn decode_elements(cur: &mut Cursor<'_>, depth: usize, nested: bool) -> Result<Self> {
        let mut msg = Self::new();
        loop {
            if cur.is_empty() {
                if nested {
                    return Err(VError::malformed("unterminated section"));
                }
                break;
            }
            let tag = cur.read_u8()?;
            match tag {
                TAG_SECTION_END => {
                    if nested {
                        break;
                    }
                    return Err(VError::malformed("unexpected section-end tag"));
                }
                TAG_SECTION_START => {
                    let key = read_key(cur)?;
                    let next_depth = depth + 1;
                    if next_depth > MAX_SECTION_DEPTH {
                        return Err(VError::malformed("section nesting too deep"));
                    }
                    let inner = Self::decode_elements(cur, next_depth, true)?;
                    msg.insert_decoded(key, Value::Section(inner))?;
                }
                TAG_KEY_VALUE => {
                    let key = read_key(cur)?;
                    let value = cur.read_u16_len_bytes()?.to_vec();
                    msg.insert_decoded(key, Value::Str(value))?;
                }
                TAG_LIST_START => {
                    let key = read_key(cur)?;
                    let items = decode_list(cur)?;
                    msg.insert_decoded(key, Value::List(items))?;
                }
                other => {
                    return Err(VError::malformed(format!("unexpected tag {other}")));
                }
            }
        }
        Ok(msg)
    }

    /// Treats an absent `success` field as success, matching the convention that
    /// commands only mark failure explicitly.
    pub fn is_success(&self) -> bool {
        !matches!(self.get_str("success"), Some(s) if s.eq_ignore_ascii_case("no"))
    }

    /// Converts a response into a `Result`, surfacing `errmsg` as the cause of a
    /// [`VError::CommandFailed`] when `success = "no"`.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let errmsg = self
            .get_str("errmsg")
            .unwrap_or_else(|| "command failed".to_string());
        Err(VError::CommandFailed(errmsg))
    }
}

fn decode_list(cur: &mut Cursor<'_>) -> Result<Vec<Vec<u8>>> {
    let mut items = Vec::new();
    loop {
        let tag = cur.read_u8()?;
        match tag {
            TAG_LIST_ITEM => items.push(cur.read_u16_len_bytes()?.to_vec()),
            TAG_LIST_END => break,
            other => return Err(VError::malformed(format!("unexpected tag {other} in list"))),
        }
    }
    Ok(items)
}

fn read_key(cur: &mut Cursor<'_>) -> Result<String> {
    let bytes = cur.read_u8_len_bytes()?;
    if bytes.is_empty() {
        return Err(VError::malformed("empty key"));
    }
    String::from_utf8(bytes.to_vec()).map_err(|_| VError::malformed("key is not valid utf-8"))
}

/// Converts a native value into a `Message` field value, per `Set`'s conversion
/// rules: integers become decimal text, booleans become `"yes"`/`"no"`, `None`
/// means "omit this field entirely".
pub trait IntoValue {
    /// Performs the conversion. `None` means the field should be unset/omitted.
    fn into_value(self) -> Option<Value>;
}

impl IntoValue for Value {
    fn into_value(self) -> Option<Value> {
        Some(self)
    }
}

impl IntoValue for Message {
    fn into_value(self) -> Option<Value> {
        Some(Value::Section(self))
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Option<Value> {
        Some(Value::Str(if self { b"yes".to_vec() } else { b"no".to_vec() }))
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Option<Value> {
        Some(Value::Str(self.as_bytes().to_vec()))
    }
}

impl IntoValue for String {
    fn into_value(self) -> Option<Value> {
        Some(Value::Str(self.into_bytes()))
    }
}

impl IntoValue for Vec<u8> {
    fn into_value(self) -> Option<Value> {
        Some(Value::Str(self))
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Option<Value> {
        self.and_then(IntoValue::into_value)
    }
}

impl IntoValue for Vec<String> {
    fn into_value(self) -> Option<Value> {
        Some(Value::List(self.into_iter().map(String::into_bytes).collect()))
    }
}

impl IntoValue for &[&str] {
    fn into_value(self) -> Option<Value> {
        Some(Value::List(self.iter().map(|s| s.as_bytes().to_vec()).collect()))
    }
}

macro_rules! impl_into_value_integer {
    ($($t:ty),+) => {
        $(
            impl IntoValue for $t {
                fn into_value(self) -> Option<Value> {
                    Some(Value::Str(self.to_string().into_bytes()))
                }
            }
        )+
    };
}
impl_into_value_integer!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);
