//! Definitions shared by the performatives (AMQP 1.0 Part 2.8)

use std::collections::BTreeMap;

use serde::{de, ser, Deserialize, Serialize};
use serde_amqp::{
    macros::{DeserializeComposite, SerializeComposite},
    primitives::{Binary, Symbol},
    value::Value,
};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// The major protocol version
pub const MAJOR: u8 = 1;
/// The minor protocol version
pub const MINOR: u8 = 0;
/// The protocol revision
pub const REVISION: u8 = 0;

/// The lower bound for the agreed maximum frame size
pub const MIN_MAX_FRAME_SIZE: usize = 512;

/// The IANA assigned port number for AMQP
pub const PORT: u16 = 5672;

/// The IANA assigned port number for AMQP over TLS
pub const SECURE_PORT: u16 = 5671;

/// A link handle, unique per session and per direction
pub type Handle = u32;

/// Sequence number with RFC-1982 serial arithmetic
pub type SequenceNo = u32;

/// Delivery number, scoped by session
pub type DeliveryNumber = SequenceNo;

/// Transfer number, scoped by session
pub type TransferNumber = SequenceNo;

/// Duration in milliseconds
pub type Milliseconds = u32;

/// Opaque delivery tag, unique within a link
pub type DeliveryTag = Binary;

/// A mapping from field name to value
pub type Fields = BTreeMap<Symbol, Value>;

/// Link endpoint role, encoded as a boolean on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// `false`
    Sender,
    /// `true`
    Receiver,
}

impl Role {
    /// The role of the peer's endpoint of the same link
    pub fn reverse(self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl From<Role> for bool {
    fn from(role: Role) -> Self {
        matches!(role, Role::Receiver)
    }
}

impl From<bool> for Role {
    fn from(value: bool) -> Self {
        match value {
            false => Role::Sender,
            true => Role::Receiver,
        }
    }
}

impl ser::Serialize for Role {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bool(bool::from(*self))
    }
}

impl<'de> de::Deserialize<'de> for Role {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        bool::deserialize(deserializer).map(Role::from)
    }
}

/// Settlement policy for a sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum SenderSettleMode {
    /// The sender will send all deliveries initially unsettled to the receiver
    Unsettled = 0,

    /// The sender will send all deliveries settled to the receiver
    Settled = 1,

    /// The sender MAY send a mixture of settled and unsettled deliveries
    #[default]
    Mixed = 2,
}

/// Settlement policy for a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ReceiverSettleMode {
    /// The receiver will spontaneously settle all incoming transfers
    #[default]
    First = 0,

    /// The receiver will only settle after sending the disposition and receiving a
    /// settled disposition from the sender
    Second = 1,
}

/// Error conditions carried by `close`, `end`, `detach` and `rejected`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCondition {
    /// amqp:internal-error
    InternalError,
    /// amqp:not-found
    NotFound,
    /// amqp:unauthorized-access
    UnauthorizedAccess,
    /// amqp:decode-error
    DecodeError,
    /// amqp:resource-limit-exceeded
    ResourceLimitExceeded,
    /// amqp:not-allowed
    NotAllowed,
    /// amqp:invalid-field
    InvalidField,
    /// amqp:not-implemented
    NotImplemented,
    /// amqp:resource-locked
    ResourceLocked,
    /// amqp:precondition-failed
    PreconditionFailed,
    /// amqp:resource-deleted
    ResourceDeleted,
    /// amqp:illegal-state
    IllegalState,
    /// amqp:frame-size-too-small
    FrameSizeTooSmall,
    /// amqp:connection:forced
    ConnectionForced,
    /// amqp:connection:framing-error
    FramingError,
    /// amqp:connection:redirect
    ConnectionRedirect,
    /// amqp:session:window-violation
    WindowViolation,
    /// amqp:session:errant-link
    ErrantLink,
    /// amqp:session:handle-in-use
    HandleInUse,
    /// amqp:session:unattached-handle
    UnattachedHandle,
    /// amqp:link:detach-forced
    DetachForced,
    /// amqp:link:transfer-limit-exceeded
    TransferLimitExceeded,
    /// amqp:link:message-size-exceeded
    MessageSizeExceeded,
    /// amqp:link:redirect
    LinkRedirect,
    /// amqp:link:stolen
    Stolen,
    /// Any condition not defined by AMQP 1.0 itself
    Custom(Symbol),
}

impl ErrorCondition {
    /// The symbolic name of the condition
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCondition::InternalError => "amqp:internal-error",
            ErrorCondition::NotFound => "amqp:not-found",
            ErrorCondition::UnauthorizedAccess => "amqp:unauthorized-access",
            ErrorCondition::DecodeError => "amqp:decode-error",
            ErrorCondition::ResourceLimitExceeded => "amqp:resource-limit-exceeded",
            ErrorCondition::NotAllowed => "amqp:not-allowed",
            ErrorCondition::InvalidField => "amqp:invalid-field",
            ErrorCondition::NotImplemented => "amqp:not-implemented",
            ErrorCondition::ResourceLocked => "amqp:resource-locked",
            ErrorCondition::PreconditionFailed => "amqp:precondition-failed",
            ErrorCondition::ResourceDeleted => "amqp:resource-deleted",
            ErrorCondition::IllegalState => "amqp:illegal-state",
            ErrorCondition::FrameSizeTooSmall => "amqp:frame-size-too-small",
            ErrorCondition::ConnectionForced => "amqp:connection:forced",
            ErrorCondition::FramingError => "amqp:connection:framing-error",
            ErrorCondition::ConnectionRedirect => "amqp:connection:redirect",
            ErrorCondition::WindowViolation => "amqp:session:window-violation",
            ErrorCondition::ErrantLink => "amqp:session:errant-link",
            ErrorCondition::HandleInUse => "amqp:session:handle-in-use",
            ErrorCondition::UnattachedHandle => "amqp:session:unattached-handle",
            ErrorCondition::DetachForced => "amqp:link:detach-forced",
            ErrorCondition::TransferLimitExceeded => "amqp:link:transfer-limit-exceeded",
            ErrorCondition::MessageSizeExceeded => "amqp:link:message-size-exceeded",
            ErrorCondition::LinkRedirect => "amqp:link:redirect",
            ErrorCondition::Stolen => "amqp:link:stolen",
            ErrorCondition::Custom(symbol) => symbol.0.as_str(),
        }
    }
}

impl From<&str> for ErrorCondition {
    fn from(value: &str) -> Self {
        match value {
            "amqp:internal-error" => ErrorCondition::InternalError,
            "amqp:not-found" => ErrorCondition::NotFound,
            "amqp:unauthorized-access" => ErrorCondition::UnauthorizedAccess,
            "amqp:decode-error" => ErrorCondition::DecodeError,
            "amqp:resource-limit-exceeded" => ErrorCondition::ResourceLimitExceeded,
            "amqp:not-allowed" => ErrorCondition::NotAllowed,
            "amqp:invalid-field" => ErrorCondition::InvalidField,
            "amqp:not-implemented" => ErrorCondition::NotImplemented,
            "amqp:resource-locked" => ErrorCondition::ResourceLocked,
            "amqp:precondition-failed" => ErrorCondition::PreconditionFailed,
            "amqp:resource-deleted" => ErrorCondition::ResourceDeleted,
            "amqp:illegal-state" => ErrorCondition::IllegalState,
            "amqp:frame-size-too-small" => ErrorCondition::FrameSizeTooSmall,
            "amqp:connection:forced" => ErrorCondition::ConnectionForced,
            "amqp:connection:framing-error" => ErrorCondition::FramingError,
            "amqp:connection:redirect" => ErrorCondition::ConnectionRedirect,
            "amqp:session:window-violation" => ErrorCondition::WindowViolation,
            "amqp:session:errant-link" => ErrorCondition::ErrantLink,
            "amqp:session:handle-in-use" => ErrorCondition::HandleInUse,
            "amqp:session:unattached-handle" => ErrorCondition::UnattachedHandle,
            "amqp:link:detach-forced" => ErrorCondition::DetachForced,
            "amqp:link:transfer-limit-exceeded" => ErrorCondition::TransferLimitExceeded,
            "amqp:link:message-size-exceeded" => ErrorCondition::MessageSizeExceeded,
            "amqp:link:redirect" => ErrorCondition::LinkRedirect,
            "amqp:link:stolen" => ErrorCondition::Stolen,
            other => ErrorCondition::Custom(Symbol::from(other)),
        }
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ser::Serialize for ErrorCondition {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        Symbol::from(self.as_str()).serialize(serializer)
    }
}

impl<'de> de::Deserialize<'de> for ErrorCondition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let symbol = Symbol::deserialize(deserializer)?;
        Ok(ErrorCondition::from(symbol.0.as_str()))
    }
}

/// Details of an error
/// <type name="error" class="composite" source="list">
///     <descriptor name="amqp:error:list" code="0x00000000:0x0000001d"/>
/// </type>
#[derive(Debug, Clone, PartialEq, SerializeComposite, DeserializeComposite)]
#[amqp_contract(
    name = "amqp:error:list",
    code = "0x0000_0000:0x0000_001d",
    encoding = "list",
    rename_all = "kebab-case"
)]
pub struct Error {
    /// A symbolic value indicating the error condition
    pub condition: ErrorCondition,

    /// Descriptive text about the error condition
    pub description: Option<String>,

    /// Map carrying information about the error condition
    pub info: Option<Fields>,
}

impl Error {
    /// Creates a new error
    pub fn new(condition: impl Into<ErrorCondition>, description: impl Into<Option<String>>) -> Self {
        Self {
            condition: condition.into(),
            description: description.into(),
            info: None,
        }
    }
}

impl From<ErrorCondition> for Error {
    fn from(condition: ErrorCondition) -> Self {
        Self {
            condition,
            description: None,
            info: None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {}", self.condition, description),
            None => write!(f, "{}", self.condition),
        }
    }
}
