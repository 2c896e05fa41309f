//! Message tag registry.
//!
//! Tag bytes are wire-normative: both ends of a connection must agree on
//! this table for frames to interoperate.

use serde::{Deserialize, Serialize};

/// One-byte message kind tag carried in the packet header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageTag {
    None = 0x00,
    Text = 0x01,
    Media = 0x02,
    MessageAck = 0x03,
    ContactRequest = 0x04,
    ContactRequestResponse = 0x05,
    CreateUser = 0x06,
    ConnectUser = 0x07,
    AckConnection = 0x08,
    UpdatePseudo = 0x09,
    RemoveContact = 0x0A,
    CreateGroup = 0x0B,
    LeaveGroup = 0x0C,
    AddGroupMember = 0x0D,
    RemoveGroupMember = 0x0E,
    KeyExchange = 0x10,
    KeyExchangeResponse = 0x11,
    ServerKeyExchange = 0x12,
    ServerKeyExchangeResponse = 0x13,
    Encrypted = 0x14,
    ServerEncrypted = 0x15,
    Error = 0xEE,
}

impl MessageTag {
    /// The wire byte for this tag.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Look up a tag by its wire byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(MessageTag::None),
            0x01 => Some(MessageTag::Text),
            0x02 => Some(MessageTag::Media),
            0x03 => Some(MessageTag::MessageAck),
            0x04 => Some(MessageTag::ContactRequest),
            0x05 => Some(MessageTag::ContactRequestResponse),
            0x06 => Some(MessageTag::CreateUser),
            0x07 => Some(MessageTag::ConnectUser),
            0x08 => Some(MessageTag::AckConnection),
            0x09 => Some(MessageTag::UpdatePseudo),
            0x0A => Some(MessageTag::RemoveContact),
            0x0B => Some(MessageTag::CreateGroup),
            0x0C => Some(MessageTag::LeaveGroup),
            0x0D => Some(MessageTag::AddGroupMember),
            0x0E => Some(MessageTag::RemoveGroupMember),
            0x10 => Some(MessageTag::KeyExchange),
            0x11 => Some(MessageTag::KeyExchangeResponse),
            0x12 => Some(MessageTag::ServerKeyExchange),
            0x13 => Some(MessageTag::ServerKeyExchangeResponse),
            0x14 => Some(MessageTag::Encrypted),
            0x15 => Some(MessageTag::ServerEncrypted),
            0xEE => Some(MessageTag::Error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_byte_roundtrip() {
        for byte in 0u8..=0xFF {
            if let Some(tag) = MessageTag::from_byte(byte) {
                assert_eq!(tag.as_byte(), byte);
            }
        }
    }

    #[test]
    fn test_registry_values() {
        assert_eq!(MessageTag::Text.as_byte(), 0x01);
        assert_eq!(MessageTag::KeyExchange.as_byte(), 0x10);
        assert_eq!(MessageTag::Encrypted.as_byte(), 0x14);
        assert_eq!(MessageTag::ServerEncrypted.as_byte(), 0x15);
        assert_eq!(MessageTag::Error.as_byte(), 0xEE);
    }

    #[test]
    fn test_unassigned_bytes_rejected() {
        assert_eq!(MessageTag::from_byte(0x0F), None);
        assert_eq!(MessageTag::from_byte(0x16), None);
        assert_eq!(MessageTag::from_byte(0xFF), None);
    }
}
