//! Typed messages and their payload codecs.
//!
//! Every message kind is a variant of [`MessageBody`]; the decoder is a
//! single match on the packet tag, and each variant's codec lives next to
//! it. Control kinds use ASCII pipe-delimited payloads with the common
//! prefix `message_id|timestamp_ms|`; wrappers and the server key exchange
//! use binary payloads.
//!
//! Group keying rides inside `KEY_EXCHANGE` payloads: a leading `0xFF`
//! (distribution) or `0xFE` (acknowledgment) byte distinguishes it from the
//! text form of the private exchange, whose first byte is always ASCII.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parley_types::events::ErrorLevel;
use parley_types::{GroupId, MessageStatus, UserId};
use serde::{Deserialize, Serialize};

use crate::packet::Packet;
use crate::tag::MessageTag;
use crate::{Result, WireError};

/// Marker byte introducing a wrapped group-key distribution.
pub const GROUP_KEY_MARKER: u8 = 0xFF;

/// Marker byte introducing a group-key acknowledgment.
pub const GROUP_ACK_MARKER: u8 = 0xFE;

/// Fields common to every message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageMeta {
    /// Globally unique opaque id. Empty only for kinds that do not carry one
    /// on the wire (server key exchange, server-encrypted, group keying).
    pub message_id: String,
    /// Creation time, epoch milliseconds UTC.
    pub timestamp_ms: u64,
    /// Sender id, stamped from the packet header (0 = relay).
    pub from: UserId,
    /// Recipient id, stamped from the packet header (0 = relay).
    pub to: UserId,
}

/// Parameters of `CREATE_USER`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUser {
    pub pseudo: String,
}

/// Parameters of `CONNECT_USER`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectUser {
    pub user_id: UserId,
}

/// Parameters of `ACK_CONNECTION` — the assigned account id echoed back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckConnection {
    pub user_id: UserId,
}

/// Parameters of `UPDATE_PSEUDO`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePseudo {
    pub pseudo: String,
}

/// Parameters of `REMOVE_CONTACT`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveContact {
    pub contact_id: UserId,
}

/// Parameters of `CREATE_GROUP`.
///
/// In the client's request `group_id` and `admin_id` are zero; the relay
/// assigns them and echoes the filled struct in its fan-out to members.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroup {
    #[serde(default)]
    pub group_id: GroupId,
    pub name: String,
    #[serde(default)]
    pub admin_id: UserId,
    pub members: Vec<UserId>,
}

/// Parameters of `LEAVE_GROUP`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveGroup {
    pub group_id: GroupId,
}

/// Parameters of `ADD_GROUP_MEMBER` / `REMOVE_GROUP_MEMBER`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMemberChange {
    pub group_id: GroupId,
    pub member_id: UserId,
}

/// The three payload forms a `KEY_EXCHANGE` packet can carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyExchangePayload {
    /// Private exchange request: the sender's public key (X.509 SPKI bytes).
    PublicKey { spki: Vec<u8> },
    /// Wrapped group-key distribution from the group admin.
    GroupKey {
        group_id: GroupId,
        encrypted_key: Vec<u8>,
    },
    /// Group-key acknowledgment from a member.
    GroupAck { group_id: GroupId },
}

/// Message kinds, one variant per registered tag.
#[derive(Clone, Debug, PartialEq)]
pub enum MessageBody {
    Text {
        content: String,
    },
    Media {
        filename: String,
        mime_type: String,
        bytes: Vec<u8>,
    },
    Ack {
        acknowledged_id: String,
        status: MessageStatus,
        reason: Option<String>,
        extras: serde_json::Value,
    },
    ContactRequest {
        request_id: String,
        expires_at_ms: u64,
    },
    ContactRequestResponse {
        request_id: String,
        accepted: bool,
    },
    CreateUser(CreateUser),
    ConnectUser(ConnectUser),
    AckConnection(AckConnection),
    UpdatePseudo(UpdatePseudo),
    RemoveContact(RemoveContact),
    CreateGroup(CreateGroup),
    LeaveGroup(LeaveGroup),
    AddGroupMember(GroupMemberChange),
    RemoveGroupMember(GroupMemberChange),
    KeyExchange(KeyExchangePayload),
    KeyExchangeResponse {
        spki: Vec<u8>,
    },
    ServerKeyExchange {
        spki: Vec<u8>,
    },
    ServerKeyExchangeResponse {
        spki: Vec<u8>,
    },
    Encrypted {
        original_tag: MessageTag,
        sequence: u64,
        nonce: [u8; 12],
        ciphertext: Vec<u8>,
    },
    ServerEncrypted {
        original_tag: MessageTag,
        nonce: [u8; 12],
        ciphertext: Vec<u8>,
    },
    Error {
        level: ErrorLevel,
        kind: String,
        description: String,
    },
}

/// A typed message: common header plus kind-specific body.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub meta: MessageMeta,
    pub body: MessageBody,
}

impl Message {
    /// Create a message.
    pub fn new(meta: MessageMeta, body: MessageBody) -> Self {
        Self { meta, body }
    }

    /// The wire tag for this message's kind.
    pub fn tag(&self) -> MessageTag {
        match &self.body {
            MessageBody::Text { .. } => MessageTag::Text,
            MessageBody::Media { .. } => MessageTag::Media,
            MessageBody::Ack { .. } => MessageTag::MessageAck,
            MessageBody::ContactRequest { .. } => MessageTag::ContactRequest,
            MessageBody::ContactRequestResponse { .. } => MessageTag::ContactRequestResponse,
            MessageBody::CreateUser(_) => MessageTag::CreateUser,
            MessageBody::ConnectUser(_) => MessageTag::ConnectUser,
            MessageBody::AckConnection(_) => MessageTag::AckConnection,
            MessageBody::UpdatePseudo(_) => MessageTag::UpdatePseudo,
            MessageBody::RemoveContact(_) => MessageTag::RemoveContact,
            MessageBody::CreateGroup(_) => MessageTag::CreateGroup,
            MessageBody::LeaveGroup(_) => MessageTag::LeaveGroup,
            MessageBody::AddGroupMember(_) => MessageTag::AddGroupMember,
            MessageBody::RemoveGroupMember(_) => MessageTag::RemoveGroupMember,
            MessageBody::KeyExchange(_) => MessageTag::KeyExchange,
            MessageBody::KeyExchangeResponse { .. } => MessageTag::KeyExchangeResponse,
            MessageBody::ServerKeyExchange { .. } => MessageTag::ServerKeyExchange,
            MessageBody::ServerKeyExchangeResponse { .. } => MessageTag::ServerKeyExchangeResponse,
            MessageBody::Encrypted { .. } => MessageTag::Encrypted,
            MessageBody::ServerEncrypted { .. } => MessageTag::ServerEncrypted,
            MessageBody::Error { .. } => MessageTag::Error,
        }
    }

    /// Whether this kind carries the `message_id|timestamp_ms|` text header.
    fn carries_text_header(&self) -> bool {
        !matches!(
            &self.body,
            MessageBody::ServerKeyExchange { .. }
                | MessageBody::ServerKeyExchangeResponse { .. }
                | MessageBody::ServerEncrypted { .. }
                | MessageBody::KeyExchange(KeyExchangePayload::GroupKey { .. })
                | MessageBody::KeyExchange(KeyExchangePayload::GroupAck { .. })
        )
    }

    /// Serialize the kind-specific payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::MissingField`] if `message_id` is unset on a kind
    /// that carries it.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        if self.carries_text_header() && self.meta.message_id.is_empty() {
            return Err(WireError::MissingField("message_id"));
        }

        let payload = match &self.body {
            MessageBody::Text { content } => self.text_payload(&[content]),
            MessageBody::Media {
                filename,
                mime_type,
                bytes,
            } => self.text_payload(&[filename, mime_type, &BASE64.encode(bytes)]),
            MessageBody::Ack {
                acknowledged_id,
                status,
                reason,
                extras,
            } => self.text_payload(&[
                acknowledged_id,
                &status.as_byte().to_string(),
                reason.as_deref().unwrap_or(""),
                &extras.to_string(),
            ]),
            MessageBody::ContactRequest {
                request_id,
                expires_at_ms,
            } => self.text_payload(&[request_id, &expires_at_ms.to_string()]),
            MessageBody::ContactRequestResponse {
                request_id,
                accepted,
            } => self.text_payload(&[request_id, if *accepted { "1" } else { "0" }]),
            MessageBody::CreateUser(params) => self.management_payload(params)?,
            MessageBody::ConnectUser(params) => self.management_payload(params)?,
            MessageBody::AckConnection(params) => self.management_payload(params)?,
            MessageBody::UpdatePseudo(params) => self.management_payload(params)?,
            MessageBody::RemoveContact(params) => self.management_payload(params)?,
            MessageBody::CreateGroup(params) => self.management_payload(params)?,
            MessageBody::LeaveGroup(params) => self.management_payload(params)?,
            MessageBody::AddGroupMember(params) => self.management_payload(params)?,
            MessageBody::RemoveGroupMember(params) => self.management_payload(params)?,
            MessageBody::KeyExchange(KeyExchangePayload::PublicKey { spki }) => {
                self.text_payload(&[&BASE64.encode(spki)])
            }
            MessageBody::KeyExchange(KeyExchangePayload::GroupKey {
                group_id,
                encrypted_key,
            }) => {
                let mut out = Vec::with_capacity(9 + encrypted_key.len());
                out.push(GROUP_KEY_MARKER);
                out.extend_from_slice(&group_id.to_be_bytes());
                out.extend_from_slice(&(encrypted_key.len() as i32).to_be_bytes());
                out.extend_from_slice(encrypted_key);
                out
            }
            MessageBody::KeyExchange(KeyExchangePayload::GroupAck { group_id }) => {
                let mut out = Vec::with_capacity(5);
                out.push(GROUP_ACK_MARKER);
                out.extend_from_slice(&group_id.to_be_bytes());
                out
            }
            MessageBody::KeyExchangeResponse { spki } => self.text_payload(&[&BASE64.encode(spki)]),
            MessageBody::ServerKeyExchange { spki }
            | MessageBody::ServerKeyExchangeResponse { spki } => {
                let mut out = Vec::with_capacity(4 + spki.len());
                out.extend_from_slice(&(spki.len() as i32).to_be_bytes());
                out.extend_from_slice(spki);
                out
            }
            MessageBody::Encrypted {
                original_tag,
                sequence,
                nonce,
                ciphertext,
            } => {
                let id = self.meta.message_id.as_bytes();
                let mut out = Vec::with_capacity(4 + id.len() + 8 + 1 + 8 + 12 + 4 + ciphertext.len());
                out.extend_from_slice(&(id.len() as i32).to_be_bytes());
                out.extend_from_slice(id);
                out.extend_from_slice(&(self.meta.timestamp_ms as i64).to_be_bytes());
                out.push(original_tag.as_byte());
                out.extend_from_slice(&(*sequence as i64).to_be_bytes());
                out.extend_from_slice(nonce);
                out.extend_from_slice(&(ciphertext.len() as i32).to_be_bytes());
                out.extend_from_slice(ciphertext);
                out
            }
            MessageBody::ServerEncrypted {
                original_tag,
                nonce,
                ciphertext,
            } => {
                let mut out = Vec::with_capacity(4 + 12 + 4 + ciphertext.len());
                out.extend_from_slice(&(original_tag.as_byte() as i32).to_be_bytes());
                out.extend_from_slice(nonce);
                out.extend_from_slice(&(ciphertext.len() as i32).to_be_bytes());
                out.extend_from_slice(ciphertext);
                out
            }
            MessageBody::Error {
                level,
                kind,
                description,
            } => self.text_payload(&[
                &error_level_byte(*level).to_string(),
                kind,
                description,
            ]),
        };

        Ok(payload)
    }

    /// Serialize into a complete packet.
    ///
    /// # Errors
    ///
    /// Propagates [`Message::to_payload`] failures.
    pub fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(
            self.tag(),
            self.meta.from,
            self.meta.to,
            self.to_payload()?,
        ))
    }

    /// Parse a packet into a typed message, stamping `from`/`to` from the
    /// packet header.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::InvalidPayload`] if the payload does not decode
    /// as the tagged kind.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let decoder = PayloadDecoder {
            from: packet.from,
            to: packet.to,
            payload: &packet.payload,
        };

        match packet.tag {
            MessageTag::None => Err(WireError::InvalidPayload(
                "NONE tag carries no message".to_string(),
            )),
            MessageTag::Text => decoder.text(),
            MessageTag::Media => decoder.media(),
            MessageTag::MessageAck => decoder.ack(),
            MessageTag::ContactRequest => decoder.contact_request(),
            MessageTag::ContactRequestResponse => decoder.contact_request_response(),
            MessageTag::CreateUser => decoder.management(MessageBody::CreateUser),
            MessageTag::ConnectUser => decoder.management(MessageBody::ConnectUser),
            MessageTag::AckConnection => decoder.management(MessageBody::AckConnection),
            MessageTag::UpdatePseudo => decoder.management(MessageBody::UpdatePseudo),
            MessageTag::RemoveContact => decoder.management(MessageBody::RemoveContact),
            MessageTag::CreateGroup => decoder.management(MessageBody::CreateGroup),
            MessageTag::LeaveGroup => decoder.management(MessageBody::LeaveGroup),
            MessageTag::AddGroupMember => decoder.management(MessageBody::AddGroupMember),
            MessageTag::RemoveGroupMember => decoder.management(MessageBody::RemoveGroupMember),
            MessageTag::KeyExchange => decoder.key_exchange(),
            MessageTag::KeyExchangeResponse => decoder.key_exchange_response(),
            MessageTag::ServerKeyExchange => {
                decoder.server_key_exchange(|spki| MessageBody::ServerKeyExchange { spki })
            }
            MessageTag::ServerKeyExchangeResponse => {
                decoder.server_key_exchange(|spki| MessageBody::ServerKeyExchangeResponse { spki })
            }
            MessageTag::Encrypted => decoder.encrypted(),
            MessageTag::ServerEncrypted => decoder.server_encrypted(),
            MessageTag::Error => decoder.error(),
        }
    }

    /// Join the common header and kind-specific parts with `|`.
    fn text_payload(&self, parts: &[&str]) -> Vec<u8> {
        let mut out = String::new();
        out.push_str(&self.meta.message_id);
        out.push('|');
        out.push_str(&self.meta.timestamp_ms.to_string());
        for part in parts {
            out.push('|');
            out.push_str(part);
        }
        out.into_bytes()
    }

    /// Common header plus parameters as a JSON object in the final field.
    fn management_payload<T: Serialize>(&self, params: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_string(params)
            .map_err(|e| WireError::InvalidPayload(e.to_string()))?;
        Ok(self.text_payload(&[&json]))
    }
}

/// Borrowed view over a packet payload during decoding.
struct PayloadDecoder<'a> {
    from: UserId,
    to: UserId,
    payload: &'a [u8],
}

impl PayloadDecoder<'_> {
    /// Split a text payload into exactly `parts` fields. The final field
    /// keeps any embedded `|`.
    fn split(&self, parts: usize) -> Result<Vec<&str>> {
        let text = std::str::from_utf8(self.payload)
            .map_err(|_| WireError::InvalidPayload("payload is not UTF-8".to_string()))?;
        let fields: Vec<&str> = text.splitn(parts, '|').collect();
        if fields.len() != parts {
            return Err(WireError::InvalidPayload(format!(
                "expected {parts} fields, got {}",
                fields.len()
            )));
        }
        Ok(fields)
    }

    /// Build the meta from the first two text fields and the packet header.
    fn meta(&self, message_id: &str, timestamp: &str) -> Result<MessageMeta> {
        let timestamp_ms = timestamp
            .parse::<u64>()
            .map_err(|_| WireError::InvalidPayload(format!("bad timestamp: {timestamp:?}")))?;
        Ok(MessageMeta {
            message_id: message_id.to_string(),
            timestamp_ms,
            from: self.from,
            to: self.to,
        })
    }

    /// Meta for binary kinds that carry no id or timestamp on the wire.
    fn bare_meta(&self) -> MessageMeta {
        MessageMeta {
            message_id: String::new(),
            timestamp_ms: 0,
            from: self.from,
            to: self.to,
        }
    }

    fn text(&self) -> Result<Message> {
        let fields = self.split(3)?;
        Ok(Message::new(
            self.meta(fields[0], fields[1])?,
            MessageBody::Text {
                content: fields[2].to_string(),
            },
        ))
    }

    fn media(&self) -> Result<Message> {
        let fields = self.split(5)?;
        let bytes = BASE64
            .decode(fields[4])
            .map_err(|e| WireError::InvalidPayload(format!("bad media base64: {e}")))?;
        Ok(Message::new(
            self.meta(fields[0], fields[1])?,
            MessageBody::Media {
                filename: fields[2].to_string(),
                mime_type: fields[3].to_string(),
                bytes,
            },
        ))
    }

    fn ack(&self) -> Result<Message> {
        let fields = self.split(6)?;
        let status_byte = fields[3]
            .parse::<u8>()
            .map_err(|_| WireError::InvalidPayload(format!("bad ack status: {:?}", fields[3])))?;
        let status = MessageStatus::from_byte(status_byte)
            .ok_or_else(|| WireError::InvalidPayload(format!("unknown ack status {status_byte}")))?;
        let reason = if fields[4].is_empty() {
            None
        } else {
            Some(fields[4].to_string())
        };
        let extras = serde_json::from_str(fields[5])
            .map_err(|e| WireError::InvalidPayload(format!("bad ack extras: {e}")))?;
        Ok(Message::new(
            self.meta(fields[0], fields[1])?,
            MessageBody::Ack {
                acknowledged_id: fields[2].to_string(),
                status,
                reason,
                extras,
            },
        ))
    }

    fn contact_request(&self) -> Result<Message> {
        let fields = self.split(4)?;
        let expires_at_ms = fields[3].parse::<u64>().map_err(|_| {
            WireError::InvalidPayload(format!("bad expiry timestamp: {:?}", fields[3]))
        })?;
        Ok(Message::new(
            self.meta(fields[0], fields[1])?,
            MessageBody::ContactRequest {
                request_id: fields[2].to_string(),
                expires_at_ms,
            },
        ))
    }

    fn contact_request_response(&self) -> Result<Message> {
        let fields = self.split(4)?;
        let accepted = match fields[3] {
            "1" => true,
            "0" => false,
            other => {
                return Err(WireError::InvalidPayload(format!(
                    "bad response flag: {other:?}"
                )))
            }
        };
        Ok(Message::new(
            self.meta(fields[0], fields[1])?,
            MessageBody::ContactRequestResponse {
                request_id: fields[2].to_string(),
                accepted,
            },
        ))
    }

    fn management<T, F>(&self, build: F) -> Result<Message>
    where
        T: for<'de> Deserialize<'de>,
        F: FnOnce(T) -> MessageBody,
    {
        let fields = self.split(3)?;
        let params: T = serde_json::from_str(fields[2])
            .map_err(|e| WireError::InvalidPayload(format!("bad management params: {e}")))?;
        Ok(Message::new(self.meta(fields[0], fields[1])?, build(params)))
    }

    fn key_exchange(&self) -> Result<Message> {
        match self.payload.first() {
            Some(&GROUP_KEY_MARKER) => {
                let mut reader = ByteReader::new(&self.payload[1..]);
                let group_id = reader.i32()?;
                let len = reader.len_i32()?;
                let encrypted_key = reader.take(len)?.to_vec();
                reader.finish()?;
                Ok(Message::new(
                    self.bare_meta(),
                    MessageBody::KeyExchange(KeyExchangePayload::GroupKey {
                        group_id,
                        encrypted_key,
                    }),
                ))
            }
            Some(&GROUP_ACK_MARKER) => {
                let mut reader = ByteReader::new(&self.payload[1..]);
                let group_id = reader.i32()?;
                reader.finish()?;
                Ok(Message::new(
                    self.bare_meta(),
                    MessageBody::KeyExchange(KeyExchangePayload::GroupAck { group_id }),
                ))
            }
            Some(_) => {
                let fields = self.split(3)?;
                let spki = BASE64
                    .decode(fields[2])
                    .map_err(|e| WireError::InvalidPayload(format!("bad key base64: {e}")))?;
                Ok(Message::new(
                    self.meta(fields[0], fields[1])?,
                    MessageBody::KeyExchange(KeyExchangePayload::PublicKey { spki }),
                ))
            }
            None => Err(WireError::InvalidPayload(
                "empty key exchange payload".to_string(),
            )),
        }
    }

    fn key_exchange_response(&self) -> Result<Message> {
        let fields = self.split(3)?;
        let spki = BASE64
            .decode(fields[2])
            .map_err(|e| WireError::InvalidPayload(format!("bad key base64: {e}")))?;
        Ok(Message::new(
            self.meta(fields[0], fields[1])?,
            MessageBody::KeyExchangeResponse { spki },
        ))
    }

    fn server_key_exchange<F>(&self, build: F) -> Result<Message>
    where
        F: FnOnce(Vec<u8>) -> MessageBody,
    {
        let mut reader = ByteReader::new(self.payload);
        let len = reader.len_i32()?;
        let spki = reader.take(len)?.to_vec();
        reader.finish()?;
        Ok(Message::new(self.bare_meta(), build(spki)))
    }

    fn encrypted(&self) -> Result<Message> {
        let mut reader = ByteReader::new(self.payload);
        let id_len = reader.len_i32()?;
        let message_id = String::from_utf8(reader.take(id_len)?.to_vec())
            .map_err(|_| WireError::InvalidPayload("wrapper id is not UTF-8".to_string()))?;
        let timestamp_ms = reader.i64()? as u64;
        let tag_byte = reader.u8()?;
        let original_tag = MessageTag::from_byte(tag_byte)
            .ok_or_else(|| WireError::InvalidPayload(format!("unknown inner tag {tag_byte:#04x}")))?;
        let sequence = reader.i64()? as u64;
        let nonce = reader.nonce()?;
        let ct_len = reader.len_i32()?;
        let ciphertext = reader.take(ct_len)?.to_vec();
        reader.finish()?;

        Ok(Message::new(
            MessageMeta {
                message_id,
                timestamp_ms,
                from: self.from,
                to: self.to,
            },
            MessageBody::Encrypted {
                original_tag,
                sequence,
                nonce,
                ciphertext,
            },
        ))
    }

    fn server_encrypted(&self) -> Result<Message> {
        let mut reader = ByteReader::new(self.payload);
        let tag_ordinal = reader.i32()?;
        let tag_byte = u8::try_from(tag_ordinal).map_err(|_| {
            WireError::InvalidPayload(format!("inner tag ordinal out of range: {tag_ordinal}"))
        })?;
        let original_tag = MessageTag::from_byte(tag_byte)
            .ok_or_else(|| WireError::InvalidPayload(format!("unknown inner tag {tag_byte:#04x}")))?;
        let nonce = reader.nonce()?;
        let ct_len = reader.len_i32()?;
        let ciphertext = reader.take(ct_len)?.to_vec();
        reader.finish()?;

        Ok(Message::new(
            self.bare_meta(),
            MessageBody::ServerEncrypted {
                original_tag,
                nonce,
                ciphertext,
            },
        ))
    }

    fn error(&self) -> Result<Message> {
        let fields = self.split(5)?;
        let level_byte = fields[2]
            .parse::<u8>()
            .map_err(|_| WireError::InvalidPayload(format!("bad error level: {:?}", fields[2])))?;
        let level = error_level_from_byte(level_byte).ok_or_else(|| {
            WireError::InvalidPayload(format!("unknown error level {level_byte}"))
        })?;
        Ok(Message::new(
            self.meta(fields[0], fields[1])?,
            MessageBody::Error {
                level,
                kind: fields[3].to_string(),
                description: fields[4].to_string(),
            },
        ))
    }
}

/// Minimal big-endian reader over a payload slice.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.bytes.len() - self.pos < n {
            return Err(WireError::InvalidPayload(format!(
                "truncated payload: wanted {n} bytes at offset {}",
                self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Read an `int32` length field, rejecting negatives.
    fn len_i32(&mut self) -> Result<usize> {
        let len = self.i32()?;
        usize::try_from(len)
            .map_err(|_| WireError::InvalidPayload(format!("negative length field: {len}")))
    }

    fn nonce(&mut self) -> Result<[u8; 12]> {
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(self.take(12)?);
        Ok(nonce)
    }

    /// Assert the payload was fully consumed.
    fn finish(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(WireError::InvalidPayload(format!(
                "{} trailing bytes after payload",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

fn error_level_byte(level: ErrorLevel) -> u8 {
    match level {
        ErrorLevel::Info => 0,
        ErrorLevel::Warning => 1,
        ErrorLevel::Error => 2,
        ErrorLevel::Critical => 3,
    }
}

fn error_level_from_byte(byte: u8) -> Option<ErrorLevel> {
    match byte {
        0 => Some(ErrorLevel::Info),
        1 => Some(ErrorLevel::Warning),
        2 => Some(ErrorLevel::Error),
        3 => Some(ErrorLevel::Critical),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str) -> MessageMeta {
        MessageMeta {
            message_id: id.to_string(),
            timestamp_ms: 1_700_000_000_123,
            from: 1,
            to: 2,
        }
    }

    fn roundtrip(message: Message) -> Message {
        let packet = message.to_packet().expect("encode");
        let bytes = packet.encode();
        let decoded = Packet::decode(&bytes).expect("decode packet");
        Message::from_packet(&decoded).expect("parse message")
    }

    #[test]
    fn test_text_roundtrip() {
        let message = Message::new(
            meta("abc123"),
            MessageBody::Text {
                content: "hello".to_string(),
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_text_preserves_embedded_pipes() {
        let message = Message::new(
            meta("abc123"),
            MessageBody::Text {
                content: "a|b|c".to_string(),
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_text_payload_layout() {
        let message = Message::new(
            meta("abc123"),
            MessageBody::Text {
                content: "hi".to_string(),
            },
        );
        let payload = message.to_payload().expect("encode");
        assert_eq!(payload, b"abc123|1700000000123|hi");
    }

    #[test]
    fn test_missing_message_id_rejected() {
        let message = Message::new(
            MessageMeta::default(),
            MessageBody::Text {
                content: "hi".to_string(),
            },
        );
        assert!(matches!(
            message.to_payload(),
            Err(WireError::MissingField("message_id"))
        ));
    }

    #[test]
    fn test_media_roundtrip() {
        let message = Message::new(
            meta("m1"),
            MessageBody::Media {
                filename: "cat.png".to_string(),
                mime_type: "image/png".to_string(),
                bytes: vec![0, 1, 2, 255],
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_ack_roundtrip() {
        let message = Message::new(
            meta("a1"),
            MessageBody::Ack {
                acknowledged_id: "orig42".to_string(),
                status: MessageStatus::Failed,
                reason: Some("unknown recipient".to_string()),
                extras: serde_json::json!({"retry_after_ms": 500}),
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_ack_without_reason() {
        let message = Message::new(
            meta("a2"),
            MessageBody::Ack {
                acknowledged_id: "orig43".to_string(),
                status: MessageStatus::Delivered,
                reason: None,
                extras: serde_json::json!({}),
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_contact_request_roundtrip() {
        let message = Message::new(
            meta("c1"),
            MessageBody::ContactRequest {
                request_id: "req-7".to_string(),
                expires_at_ms: 1_700_600_000_000,
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_management_roundtrip() {
        let message = Message::new(
            meta("g1"),
            MessageBody::CreateGroup(CreateGroup {
                group_id: 0,
                name: "team|with|pipes".to_string(),
                admin_id: 1,
                members: vec![2, 3, 4],
            }),
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_key_exchange_public_key_roundtrip() {
        let message = Message::new(
            meta("k1"),
            MessageBody::KeyExchange(KeyExchangePayload::PublicKey {
                spki: vec![0x30, 0x2a, 0x01, 0x02],
            }),
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_group_key_distribution_roundtrip() {
        let message = Message::new(
            MessageMeta {
                from: 1,
                to: 3,
                ..Default::default()
            },
            MessageBody::KeyExchange(KeyExchangePayload::GroupKey {
                group_id: 10,
                encrypted_key: vec![9; 60],
            }),
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_group_key_marker_layout() {
        let message = Message::new(
            MessageMeta {
                from: 1,
                to: 3,
                ..Default::default()
            },
            MessageBody::KeyExchange(KeyExchangePayload::GroupKey {
                group_id: 10,
                encrypted_key: vec![0xAB; 4],
            }),
        );
        let payload = message.to_payload().expect("encode");
        assert_eq!(payload[0], GROUP_KEY_MARKER);
        assert_eq!(&payload[1..5], &10i32.to_be_bytes());
        assert_eq!(&payload[5..9], &4i32.to_be_bytes());
    }

    #[test]
    fn test_group_ack_roundtrip() {
        let message = Message::new(
            MessageMeta {
                from: 3,
                to: 1,
                ..Default::default()
            },
            MessageBody::KeyExchange(KeyExchangePayload::GroupAck { group_id: 10 }),
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_server_key_exchange_roundtrip() {
        let message = Message::new(
            MessageMeta {
                from: 0,
                to: 1,
                ..Default::default()
            },
            MessageBody::ServerKeyExchange {
                spki: vec![0x30; 44],
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_encrypted_roundtrip() {
        let message = Message::new(
            meta("e1"),
            MessageBody::Encrypted {
                original_tag: MessageTag::Text,
                sequence: 7,
                nonce: [5u8; 12],
                ciphertext: vec![1, 2, 3],
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_server_encrypted_roundtrip() {
        let message = Message::new(
            MessageMeta {
                from: 1,
                to: 0,
                ..Default::default()
            },
            MessageBody::ServerEncrypted {
                original_tag: MessageTag::CreateGroup,
                nonce: [7u8; 12],
                ciphertext: vec![4, 5, 6],
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_error_roundtrip() {
        let message = Message::new(
            meta("err1"),
            MessageBody::Error {
                level: ErrorLevel::Critical,
                kind: "PROTOCOL_VIOLATION".to_string(),
                description: "bad | payload".to_string(),
            },
        );
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_truncated_encrypted_rejected() {
        let message = Message::new(
            meta("e1"),
            MessageBody::Encrypted {
                original_tag: MessageTag::Text,
                sequence: 0,
                nonce: [0u8; 12],
                ciphertext: vec![1, 2, 3],
            },
        );
        let mut packet = message.to_packet().expect("encode");
        packet.payload.truncate(packet.payload.len() - 2);
        assert!(matches!(
            Message::from_packet(&packet),
            Err(WireError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let message = Message::new(
            MessageMeta {
                from: 3,
                to: 1,
                ..Default::default()
            },
            MessageBody::KeyExchange(KeyExchangePayload::GroupAck { group_id: 10 }),
        );
        let mut packet = message.to_packet().expect("encode");
        packet.payload.push(0);
        assert!(matches!(
            Message::from_packet(&packet),
            Err(WireError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_from_to_stamped_from_header() {
        let message = Message::new(
            meta("t9"),
            MessageBody::Text {
                content: "x".to_string(),
            },
        );
        let packet = message.to_packet().expect("encode");
        let parsed = Message::from_packet(&packet).expect("parse");
        assert_eq!(parsed.meta.from, 1);
        assert_eq!(parsed.meta.to, 2);
    }
}
