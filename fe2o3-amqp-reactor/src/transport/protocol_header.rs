//! Implements the protocol headers

use std::convert::TryFrom;

use crate::types::definitions::{MAJOR, MINOR, REVISION};

const PROTOCOL_HEADER_PREFIX: &[u8; 4] = b"AMQP";

/// Protocol header exchanged before any frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolHeader {
    pub id: ProtocolId,
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl Default for ProtocolHeader {
    fn default() -> Self {
        Self {
            id: ProtocolId::Amqp,
            major: MAJOR,
            minor: MINOR,
            revision: REVISION,
        }
    }
}

impl ProtocolHeader {
    pub fn new(id: ProtocolId, major: u8, minor: u8, revision: u8) -> Self {
        Self {
            id,
            major,
            minor,
            revision,
        }
    }

    pub fn amqp() -> Self {
        Self::default()
    }

    pub fn sasl() -> Self {
        Self {
            id: ProtocolId::Sasl,
            ..Default::default()
        }
    }

    pub fn is_amqp(&self) -> bool {
        matches!(self.id, ProtocolId::Amqp)
    }

    pub fn is_sasl(&self) -> bool {
        matches!(self.id, ProtocolId::Sasl)
    }

    /// Whether the version matches the one this crate speaks
    pub fn is_supported_version(&self) -> bool {
        self.major == MAJOR && self.minor == MINOR && self.revision == REVISION
    }
}

impl From<ProtocolHeader> for [u8; 8] {
    fn from(value: ProtocolHeader) -> Self {
        [
            PROTOCOL_HEADER_PREFIX[0],
            PROTOCOL_HEADER_PREFIX[1],
            PROTOCOL_HEADER_PREFIX[2],
            PROTOCOL_HEADER_PREFIX[3],
            value.id as u8,
            value.major,
            value.minor,
            value.revision,
        ]
    }
}

impl TryFrom<[u8; 8]> for ProtocolHeader {
    type Error = [u8; 8];

    fn try_from(v: [u8; 8]) -> Result<Self, Self::Error> {
        if &v[..4] != PROTOCOL_HEADER_PREFIX {
            return Err(v);
        }
        let id = ProtocolId::try_from(v[4]).map_err(|_| v)?;
        Ok(Self::new(id, v[5], v[6], v[7]))
    }
}

/// Protocol id carried in the fifth byte of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolId {
    Amqp = 0x0,
    Tls = 0x2,
    Sasl = 0x3,
}

impl TryFrom<u8> for ProtocolId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let val = match value {
            0x0 => Self::Amqp,
            0x2 => Self::Tls,
            0x3 => Self::Sasl,
            _ => return Err(value),
        };
        Ok(val)
    }
}
