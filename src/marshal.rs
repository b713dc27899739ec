//! Typed request/response marshalling on top of [`crate::wire::Message`] (C6).
// (c) 2024 Ross Younger
//!
//! A [`Message`] is a generic ordered map; most callers want to work with a
//! plain Rust struct instead. [`ToMessage`] and [`FromMessage`] are the two
//! halves of that bridge. There is no derive macro here: each implementation
//! names its own fields explicitly, in the style of a `"<name>[,<opt>]*"` field
//! tag a derive macro would otherwise generate from —
//!
//! - an empty name (or `"-"`) means "use the section itself", i.e. the `inline`
//!   option below
//! - `inline` flattens the field's own `ToMessage`/`FromMessage` output into the
//!   surrounding message instead of nesting it under a key
//! - fields whose value converts to "no value" (see
//!   [`IntoValue`](crate::wire::IntoValue)) are omitted from the encoded message
//!   entirely, rather than being written out empty

use crate::error::{Result, VError};
use crate::wire::{IntoValue, Message};

/// Converts a typed value into a [`Message`], the inverse of [`FromMessage`].
pub trait ToMessage {
    /// Builds a message representing `self`.
    fn to_message(&self) -> Message;
}

/// Extracts a typed value out of a [`Message`], the inverse of [`ToMessage`].
pub trait FromMessage: Sized {
    /// Parses `message`, failing with [`VError::Malformed`] if a required field
    /// is missing or cannot be converted.
    fn from_message(message: &Message) -> Result<Self>;
}

impl ToMessage for Message {
    fn to_message(&self) -> Message {
        self.clone()
    }
}

impl FromMessage for Message {
    fn from_message(message: &Message) -> Result<Self> {
        Ok(message.clone())
    }
}

/// Reads a required scalar field, by name, as a `String`.
pub fn required_str(message: &Message, key: &str) -> Result<String> {
    message
        .get_str(key)
        .ok_or_else(|| VError::malformed(format!("missing required field '{key}'")))
}

/// Reads an optional scalar field, by name, as a `String`.
pub fn optional_str(message: &Message, key: &str) -> Option<String> {
    message.get_str(key)
}

/// Sets a field on `message` only when `value` converts to "present" (see
/// [`IntoValue`]); otherwise the field is left unset. A thin wrapper kept
/// around [`Message::set`] so `ToMessage` implementations read uniformly.
pub fn set_field<V: IntoValue>(message: &mut Message, key: &str, value: V) {
    message.set(key, value);
}

/// Copies every field of `inner` directly into `parent`, the `inline` field-tag
/// option: flattening a nested value's own encoding into its containing
/// message instead of nesting it under a key of its own.
pub fn merge_inline(parent: &mut Message, inner: &Message) {
    for key in inner.keys() {
        if let Some(value) = inner.get(key) {
            parent.set(key, value.clone());
        }
    }
}

/// A request to load or query a single IKE connection by name, grounding the
/// crate's marshalling conventions against a real VICI command (`initiate` /
/// `terminate` both take a body shaped like this).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSelector {
    /// The connection's `ike` name.
    pub ike: String,
    /// An optional CHILD_SA name to narrow the selection.
    pub child: Option<String>,
    /// Timeout, in milliseconds, charon should apply to the operation. `None`
    /// means "use charon's default".
    pub timeout_ms: Option<i64>,
}

impl ToMessage for ConnectionSelector {
    fn to_message(&self) -> Message {
        let mut msg = Message::new();
        set_field(&mut msg, "ike", self.ike.as_str());
        set_field(&mut msg, "child", self.child.clone());
        set_field(&mut msg, "timeout", self.timeout_ms);
        msg
    }
}

impl FromMessage for ConnectionSelector {
    fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            ike: required_str(message, "ike")?,
            child: optional_str(message, "child"),
            timeout_ms: message
                .get_str("timeout")
                .map(|s| {
                    s.parse::<i64>()
                        .map_err(|_| VError::malformed("'timeout' is not an integer"))
                })
                .transpose()?,
        })
    }
}

/// The common shape of a command's reply: `success`/`errmsg` plus whatever
/// else the command returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Whether the command succeeded.
    pub success: bool,
    /// The failure reason, when `success` is false.
    pub errmsg: Option<String>,
}

impl ToMessage for CommandOutcome {
    fn to_message(&self) -> Message {
        let mut msg = Message::new();
        set_field(&mut msg, "success", if self.success { "yes" } else { "no" });
        set_field(&mut msg, "errmsg", self.errmsg.clone());
        msg
    }
}

impl FromMessage for CommandOutcome {
    fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            success: message.is_success(),
            errmsg: optional_str(message, "errmsg"),
        })
    }
}

/// A command's full reply: [`CommandOutcome`] flattened in directly via
/// [`merge_inline`] (no `"outcome"` key appears on the wire) alongside
/// whatever else this particular command returns. Grounds the `inline`
/// convention against a real shape: every VICI command reply looks exactly
/// like this, `success`/`errmsg` sitting at the same level as the command's
/// own result fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadConnResult {
    /// The command's overall outcome.
    pub outcome: CommandOutcome,
    /// The connection name charon loaded, echoed back on success.
    pub name: Option<String>,
}

impl ToMessage for LoadConnResult {
    fn to_message(&self) -> Message {
        let mut msg = Message::new();
        merge_inline(&mut msg, &self.outcome.to_message());
        set_field(&mut msg, "name", self.name.clone());
        msg
    }
}

impl FromMessage for LoadConnResult {
    fn from_message(message: &Message) -> Result<Self> {
        Ok(Self {
            outcome: CommandOutcome::from_message(message)?,
            name: optional_str(message, "name"),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn connection_selector_round_trip() {
        let sel = ConnectionSelector {
            ike: "home".to_string(),
            child: Some("office".to_string()),
            timeout_ms: Some(5000),
        };
        let msg = sel.to_message();
        let back = ConnectionSelector::from_message(&msg).unwrap();
        assert_eq!(sel, back);
    }

    #[test]
    fn connection_selector_omits_absent_optionals() {
        let sel = ConnectionSelector {
            ike: "home".to_string(),
            child: None,
            timeout_ms: None,
        };
        let msg = sel.to_message();
        assert!(msg.get("child").is_none());
        assert!(msg.get("timeout").is_none());
        assert_eq!(msg.keys().collect::<Vec<_>>(), vec!["ike"]);
    }

    #[test]
    fn connection_selector_requires_ike() {
        let msg = Message::new();
        let err = ConnectionSelector::from_message(&msg).unwrap_err();
        assert!(matches!(err, VError::Malformed(_)));
    }

    #[test]
    fn command_outcome_failure() {
        let mut msg = Message::new();
        msg.set("success", "no");
        msg.set("errmsg", "denied");
        let outcome = CommandOutcome::from_message(&msg).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.errmsg.as_deref(), Some("denied"));
    }

    #[test]
    fn load_conn_result_flattens_outcome_with_no_nested_key() {
        let result = LoadConnResult {
            outcome: CommandOutcome {
                success: true,
                errmsg: None,
            },
            name: Some("home".to_string()),
        };
        let msg = result.to_message();
        // `outcome`'s fields sit directly at the top level; there is no
        // "outcome" key anywhere.
        assert!(msg.get("outcome").is_none());
        assert_eq!(msg.get_str("success").as_deref(), Some("yes"));
        assert_eq!(msg.get_str("name").as_deref(), Some("home"));

        let back = LoadConnResult::from_message(&msg).unwrap();
        assert_eq!(result, back);
    }

    #[test]
    fn load_conn_result_round_trips_a_failure() {
        let result = LoadConnResult {
            outcome: CommandOutcome {
                success: false,
                errmsg: Some("no such connection".to_string()),
            },
            name: None,
        };
        let msg = result.to_message();
        let back = LoadConnResult::from_message(&msg).unwrap();
        assert_eq!(result, back);
    }
}
