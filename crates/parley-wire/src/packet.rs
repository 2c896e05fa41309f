//! Packet framing.
//!
//! ## Wire format
//!
//! ```text
//! [tag:1][from:4 BE][to:4 BE][payload_size:4 BE][payload:payload_size]
//! ```
//!
//! `from`/`to` are user account ids; id 0 is the relay server. The payload
//! size must match the frame exactly.

use parley_types::UserId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::tag::MessageTag;
use crate::{Result, WireError};

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 13;

/// Maximum accepted payload size (to prevent allocation attacks).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A framed packet: fixed header plus opaque payload bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Message kind tag.
    pub tag: MessageTag,
    /// Sender id (0 = relay).
    pub from: UserId,
    /// Recipient id (0 = relay).
    pub to: UserId,
    /// Kind-specific payload bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet.
    pub fn new(tag: MessageTag, from: UserId, to: UserId, payload: Vec<u8>) -> Self {
        Self {
            tag,
            from,
            to,
            payload,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.push(self.tag.as_byte());
        out.extend_from_slice(&self.from.to_be_bytes());
        out.extend_from_slice(&self.to.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as i32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a complete frame.
    ///
    /// # Errors
    ///
    /// - [`WireError::TruncatedHeader`] if fewer than 13 bytes are present
    /// - [`WireError::UnknownTag`] for an unregistered tag byte
    /// - [`WireError::PayloadSizeMismatch`] if the declared size does not
    ///   match the remaining frame length
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::TruncatedHeader);
        }
        let tag = MessageTag::from_byte(bytes[0]).ok_or(WireError::UnknownTag(bytes[0]))?;
        let from = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let to = i32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
        let declared = i32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);

        let actual = bytes.len() - HEADER_SIZE;
        if declared < 0 || declared as usize != actual {
            return Err(WireError::PayloadSizeMismatch {
                declared: declared.max(0) as usize,
                actual,
            });
        }

        Ok(Self {
            tag,
            from,
            to,
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Read one packet from an async stream.
///
/// # Errors
///
/// Returns [`WireError::Io`] on stream errors (including EOF mid-frame),
/// [`WireError::UnknownTag`] for an unregistered tag, and
/// [`WireError::PayloadSizeMismatch`] for a negative or oversized payload
/// size.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let tag = MessageTag::from_byte(header[0]).ok_or(WireError::UnknownTag(header[0]))?;
    let from = i32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    let to = i32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    let declared = i32::from_be_bytes([header[9], header[10], header[11], header[12]]);

    if declared < 0 || declared as usize > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadSizeMismatch {
            declared: declared.max(0) as usize,
            actual: 0,
        });
    }

    let mut payload = vec![0u8; declared as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Packet {
        tag,
        from,
        to,
        payload,
    })
}

/// Write one packet to an async stream and flush it.
///
/// # Errors
///
/// Returns [`WireError::Io`] if the write fails.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let packet = Packet::new(MessageTag::Text, 1, 2, b"payload".to_vec());
        let bytes = packet.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 7);
        assert_eq!(Packet::decode(&bytes).expect("decode"), packet);
    }

    #[test]
    fn test_header_layout() {
        let packet = Packet::new(MessageTag::Text, 0x01020304, 5, vec![0xAA]);
        let bytes = packet.encode();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(&bytes[1..5], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[5..9], &[0x00, 0x00, 0x00, 0x05]);
        assert_eq!(&bytes[9..13], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(bytes[13], 0xAA);
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(matches!(
            Packet::decode(&[0x01, 0x00, 0x00]),
            Err(WireError::TruncatedHeader)
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut bytes = Packet::new(MessageTag::Text, 1, 2, vec![]).encode();
        bytes[0] = 0x7F;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(WireError::UnknownTag(0x7F))
        ));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut bytes = Packet::new(MessageTag::Text, 1, 2, b"abc".to_vec()).encode();
        bytes[12] = 99;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(WireError::PayloadSizeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let packet = Packet::new(MessageTag::Media, 3, 4, vec![1, 2, 3, 4, 5]);
        let mut buf = Vec::new();
        write_packet(&mut buf, &packet).await.expect("write");

        let mut cursor = std::io::Cursor::new(buf);
        let restored = read_packet(&mut cursor).await.expect("read");
        assert_eq!(restored, packet);
    }

    #[tokio::test]
    async fn test_stream_eof_is_io_error() {
        let mut cursor = std::io::Cursor::new(vec![0x01, 0x00]);
        assert!(matches!(
            read_packet(&mut cursor).await,
            Err(WireError::Io(_))
        ));
    }
}
