//! Wire headers of the SDK controller protocol.
//!
//! Every packet starts with a 12-byte `PacketHeader`:
//!
//! ```text
//!  0       4       8      12
//! ┌───────┬───────┬───────┐
//! │ SDKC  │ size  │ type  │   size counts header + payload
//! └───────┴───────┴───────┘
//! ```
//!
//! followed by a type-specific extension: `msg_type` for messages,
//! `query_id` + `query_type` for queries, `query_id` for query replies.
//! Integers travel in the host's byte order, which the host announces in
//! the first byte it sends after connecting.

use std::fmt;

use crate::error::SdkCtlError;

/// `'SDKC'` as a native integer.
pub const SIGNATURE: i32 = 0x5344_4B43;

/// Largest packet (header included) either side will accept.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

// ── ByteOrder ────────────────────────────────────────────────────

/// Byte order of the integers on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// The handshake flag byte: 0 for little-endian, 1 for big-endian.
    pub fn flag(self) -> u8 {
        match self {
            ByteOrder::Little => 0,
            ByteOrder::Big => 1,
        }
    }

    pub fn from_flag(flag: u8) -> Result<Self, SdkCtlError> {
        match flag {
            0 => Ok(ByteOrder::Little),
            1 => Ok(ByteOrder::Big),
            _ => Err(SdkCtlError::UnknownVariant {
                type_name: "ByteOrder",
                value: flag as i64,
            }),
        }
    }

    pub fn read_i32(self, bytes: &[u8]) -> i32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::Little => i32::from_le_bytes(raw),
            ByteOrder::Big => i32::from_be_bytes(raw),
        }
    }

    pub fn write_i32(self, dst: &mut [u8], value: i32) {
        let raw = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        dst[..4].copy_from_slice(&raw);
    }
}

// ── PacketType ───────────────────────────────────────────────────

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// One-way message.
    Message = 1,
    /// Request that expects a correlated reply.
    Query = 2,
    /// Reply to a query.
    QueryResponse = 3,
}

impl TryFrom<i32> for PacketType {
    type Error = SdkCtlError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Message),
            2 => Ok(PacketType::Query),
            3 => Ok(PacketType::QueryResponse),
            _ => Err(SdkCtlError::UnknownVariant {
                type_name: "PacketType",
                value: value as i64,
            }),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Message => write!(f, "Message"),
            PacketType::Query => write!(f, "Query"),
            PacketType::QueryResponse => write!(f, "QueryResponse"),
        }
    }
}

// ── PacketHeader ─────────────────────────────────────────────────

/// The header common to every packet.
///
/// `packet_type` stays a raw integer so that the dispatcher can log and
/// skip types it does not know without losing framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub signature: i32,
    pub size: i32,
    pub packet_type: i32,
}

impl PacketHeader {
    pub const SIZE: usize = 12;

    pub fn new(packet_type: PacketType, size: usize) -> Self {
        Self {
            signature: SIGNATURE,
            size: size as i32,
            packet_type: packet_type as i32,
        }
    }

    pub fn encode_into(&self, dst: &mut [u8], order: ByteOrder) {
        order.write_i32(&mut dst[0..4], self.signature);
        order.write_i32(&mut dst[4..8], self.size);
        order.write_i32(&mut dst[8..12], self.packet_type);
    }

    pub fn encode(&self, order: ByteOrder) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.encode_into(&mut buf, order);
        buf
    }

    /// Decode without validating anything.
    pub fn decode(src: &[u8], order: ByteOrder) -> Result<Self, SdkCtlError> {
        if src.len() < Self::SIZE {
            return Err(SdkCtlError::InvalidPacketLength {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        Ok(Self {
            signature: order.read_i32(&src[0..4]),
            size: order.read_i32(&src[4..8]),
            packet_type: order.read_i32(&src[8..12]),
        })
    }

    pub fn has_valid_signature(&self) -> bool {
        self.signature == SIGNATURE
    }

    /// Check the signature and that `size` is at least `min_size` and
    /// within `MAX_PACKET_SIZE`. Returns the size as `usize`.
    pub fn validate(&self, min_size: usize) -> Result<usize, SdkCtlError> {
        if !self.has_valid_signature() {
            return Err(SdkCtlError::InvalidSignature(self.signature));
        }
        let size = usize::try_from(self.size)
            .map_err(|_| SdkCtlError::InvalidHeader("negative packet size"))?;
        if size < min_size {
            return Err(SdkCtlError::InvalidPacketLength {
                expected: min_size,
                actual: size,
            });
        }
        if size > MAX_PACKET_SIZE {
            return Err(SdkCtlError::PacketTooLarge {
                size,
                max: MAX_PACKET_SIZE,
            });
        }
        Ok(size)
    }

    pub fn kind(&self) -> Result<PacketType, SdkCtlError> {
        PacketType::try_from(self.packet_type)
    }
}

// ── Extended headers ─────────────────────────────────────────────

/// Header of a `Message` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub packet: PacketHeader,
    pub msg_type: i32,
}

impl MessageHeader {
    pub const SIZE: usize = PacketHeader::SIZE + 4;

    pub fn new(msg_type: i32, payload_len: usize) -> Self {
        Self {
            packet: PacketHeader::new(PacketType::Message, Self::SIZE + payload_len),
            msg_type,
        }
    }

    pub fn encode_into(&self, dst: &mut [u8], order: ByteOrder) {
        self.packet.encode_into(dst, order);
        order.write_i32(&mut dst[12..16], self.msg_type);
    }

    pub fn decode(src: &[u8], order: ByteOrder) -> Result<Self, SdkCtlError> {
        let packet = PacketHeader::decode(src, order)?;
        if src.len() < Self::SIZE {
            return Err(SdkCtlError::InvalidPacketLength {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        Ok(Self {
            packet,
            msg_type: order.read_i32(&src[12..16]),
        })
    }
}

/// Header of a `Query` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryHeader {
    pub packet: PacketHeader,
    pub query_id: i32,
    pub query_type: i32,
}

impl QueryHeader {
    pub const SIZE: usize = PacketHeader::SIZE + 8;

    pub fn new(query_id: i32, query_type: i32, payload_len: usize) -> Self {
        Self {
            packet: PacketHeader::new(PacketType::Query, Self::SIZE + payload_len),
            query_id,
            query_type,
        }
    }

    pub fn encode_into(&self, dst: &mut [u8], order: ByteOrder) {
        self.packet.encode_into(dst, order);
        order.write_i32(&mut dst[12..16], self.query_id);
        order.write_i32(&mut dst[16..20], self.query_type);
    }

    pub fn decode(src: &[u8], order: ByteOrder) -> Result<Self, SdkCtlError> {
        let packet = PacketHeader::decode(src, order)?;
        if src.len() < Self::SIZE {
            return Err(SdkCtlError::InvalidPacketLength {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        Ok(Self {
            packet,
            query_id: order.read_i32(&src[12..16]),
            query_type: order.read_i32(&src[16..20]),
        })
    }
}

/// Header of a `QueryResponse` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryReplyHeader {
    pub packet: PacketHeader,
    pub query_id: i32,
}

impl QueryReplyHeader {
    pub const SIZE: usize = PacketHeader::SIZE + 4;

    pub fn new(query_id: i32, payload_len: usize) -> Self {
        Self {
            packet: PacketHeader::new(PacketType::QueryResponse, Self::SIZE + payload_len),
            query_id,
        }
    }

    pub fn encode_into(&self, dst: &mut [u8], order: ByteOrder) {
        self.packet.encode_into(dst, order);
        order.write_i32(&mut dst[12..16], self.query_id);
    }

    pub fn decode(src: &[u8], order: ByteOrder) -> Result<Self, SdkCtlError> {
        let packet = PacketHeader::decode(src, order)?;
        if src.len() < Self::SIZE {
            return Err(SdkCtlError::InvalidPacketLength {
                expected: Self::SIZE,
                actual: src.len(),
            });
        }
        Ok(Self {
            packet,
            query_id: order.read_i32(&src[12..16]),
        })
    }
}

/// Lay a message header for `payload_len` bytes of payload at the start
/// of `buf`, in native byte order. Used to build direct packets in place.
pub fn init_message_header(
    buf: &mut [u8],
    msg_type: i32,
    payload_len: usize,
) -> Result<(), SdkCtlError> {
    if buf.len() < MessageHeader::SIZE {
        return Err(SdkCtlError::InvalidPacketLength {
            expected: MessageHeader::SIZE,
            actual: buf.len(),
        });
    }
    MessageHeader::new(msg_type, payload_len).encode_into(buf, ByteOrder::native());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_spells_sdkc() {
        assert_eq!(&SIGNATURE.to_be_bytes(), b"SDKC");
    }

    #[test]
    fn header_sizes() {
        assert_eq!(PacketHeader::SIZE, 12);
        assert_eq!(MessageHeader::SIZE, 16);
        assert_eq!(QueryHeader::SIZE, 20);
        assert_eq!(QueryReplyHeader::SIZE, 16);
    }

    #[test]
    fn query_header_layout() {
        let header = QueryHeader::new(7, -1, 5);
        let mut buf = [0u8; QueryHeader::SIZE];
        header.encode_into(&mut buf, ByteOrder::Little);

        assert_eq!(&buf[0..4], &SIGNATURE.to_le_bytes());
        assert_eq!(&buf[4..8], &25i32.to_le_bytes());
        assert_eq!(&buf[8..12], &2i32.to_le_bytes());
        assert_eq!(&buf[12..16], &7i32.to_le_bytes());
        assert_eq!(&buf[16..20], &(-1i32).to_le_bytes());
    }

    #[test]
    fn big_endian_decode() {
        let header = MessageHeader::new(-3, 0);
        let mut buf = [0u8; MessageHeader::SIZE];
        header.encode_into(&mut buf, ByteOrder::Big);
        assert_eq!(&buf[0..4], b"SDKC");

        let decoded = MessageHeader::decode(&buf, ByteOrder::Big).unwrap();
        assert_eq!(decoded, header);
        let wrong = MessageHeader::decode(&buf, ByteOrder::Little).unwrap();
        assert!(!wrong.packet.has_valid_signature());
    }

    #[test]
    fn validate_rejects_bad_signature() {
        let mut header = PacketHeader::new(PacketType::Message, 16);
        header.signature = 0x1234;
        assert!(matches!(
            header.validate(PacketHeader::SIZE),
            Err(SdkCtlError::InvalidSignature(0x1234))
        ));
    }

    #[test]
    fn validate_rejects_bad_sizes() {
        let short = PacketHeader::new(PacketType::Message, 4);
        assert!(short.validate(PacketHeader::SIZE).is_err());

        let mut negative = PacketHeader::new(PacketType::Message, 0);
        negative.size = -20;
        assert!(negative.validate(PacketHeader::SIZE).is_err());

        let huge = PacketHeader::new(PacketType::Message, MAX_PACKET_SIZE + 1);
        assert!(matches!(
            huge.validate(PacketHeader::SIZE),
            Err(SdkCtlError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn unknown_packet_type() {
        assert!(PacketType::try_from(9).is_err());
        assert_eq!(PacketType::try_from(3).unwrap(), PacketType::QueryResponse);
    }

    #[test]
    fn byte_order_flag() {
        assert_eq!(ByteOrder::from_flag(0).unwrap(), ByteOrder::Little);
        assert_eq!(ByteOrder::from_flag(1).unwrap(), ByteOrder::Big);
        assert!(ByteOrder::from_flag(2).is_err());
        assert_eq!(ByteOrder::from_flag(ByteOrder::native().flag()).unwrap(), ByteOrder::native());
    }

    #[test]
    fn init_message_header_in_place() {
        let mut frame = vec![0u8; MessageHeader::SIZE + 3];
        init_message_header(&mut frame, 42, 3).unwrap();
        let header = MessageHeader::decode(&frame, ByteOrder::native()).unwrap();
        assert_eq!(header.msg_type, 42);
        assert_eq!(header.packet.size as usize, frame.len());

        let mut tiny = [0u8; 4];
        assert!(init_message_header(&mut tiny, 1, 0).is_err());
    }
}
