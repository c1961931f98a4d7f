//! Framed codec for the wire protocol, for peers that run as ordinary
//! tokio tasks (the device side and test servers).
//!
//! A device-side codec first yields the host's one-byte byte-order flag
//! as [`Frame::Endianness`] and then decodes and encodes every integer
//! in that order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::SdkCtlError;
use crate::header::{
    ByteOrder, MAX_PACKET_SIZE, MessageHeader, PacketHeader, PacketType, QueryHeader,
    QueryReplyHeader,
};

/// One decoded unit of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The handshake flag byte.
    Endianness(u8),
    Message {
        msg_type: i32,
        payload: Bytes,
    },
    Query {
        query_id: i32,
        query_type: i32,
        payload: Bytes,
    },
    QueryReply {
        query_id: i32,
        payload: Bytes,
    },
}

#[derive(Debug, Clone, Default)]
pub struct SdkCtlCodec {
    /// `None` until the byte-order flag has gone by.
    order: Option<ByteOrder>,
}

impl SdkCtlCodec {
    /// Codec for the accepting side: expects the byte-order flag first.
    pub fn device() -> Self {
        Self { order: None }
    }

    /// Codec for the connecting side: framed in native order from the
    /// start.
    pub fn host() -> Self {
        Self::with_order(ByteOrder::native())
    }

    pub fn with_order(order: ByteOrder) -> Self {
        Self { order: Some(order) }
    }

    /// The negotiated byte order, once known.
    pub fn byte_order(&self) -> Option<ByteOrder> {
        self.order
    }

    fn negotiated(&self) -> Result<ByteOrder, SdkCtlError> {
        self.order
            .ok_or(SdkCtlError::ProtocolViolation("byte order not negotiated"))
    }
}

impl Decoder for SdkCtlCodec {
    type Item = Frame;
    type Error = SdkCtlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(order) = self.order else {
            if src.is_empty() {
                return Ok(None);
            }
            let flag = src.get_u8();
            self.order = Some(ByteOrder::from_flag(flag)?);
            return Ok(Some(Frame::Endianness(flag)));
        };

        if src.len() < PacketHeader::SIZE {
            src.reserve(PacketHeader::SIZE - src.len());
            return Ok(None);
        }
        let header = PacketHeader::decode(&src[..PacketHeader::SIZE], order)?;
        if !header.has_valid_signature() {
            return Err(SdkCtlError::InvalidSignature(header.signature));
        }
        let packet_type = header.kind()?;
        let size = header.validate(min_size(packet_type))?;
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let packet = src.split_to(size).freeze();
        let frame = match packet_type {
            PacketType::Message => Frame::Message {
                msg_type: order.read_i32(&packet[12..16]),
                payload: packet.slice(MessageHeader::SIZE..),
            },
            PacketType::Query => Frame::Query {
                query_id: order.read_i32(&packet[12..16]),
                query_type: order.read_i32(&packet[16..20]),
                payload: packet.slice(QueryHeader::SIZE..),
            },
            PacketType::QueryResponse => Frame::QueryReply {
                query_id: order.read_i32(&packet[12..16]),
                payload: packet.slice(QueryReplyHeader::SIZE..),
            },
        };
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for SdkCtlCodec {
    type Error = SdkCtlError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Endianness(flag) => {
                self.order = Some(ByteOrder::from_flag(flag)?);
                dst.put_u8(flag);
            }
            Frame::Message { msg_type, payload } => {
                let mut header = [0u8; MessageHeader::SIZE];
                MessageHeader::new(msg_type, payload.len()).encode_into(&mut header, self.negotiated()?);
                put_packet(dst, &header, &payload)?;
            }
            Frame::Query {
                query_id,
                query_type,
                payload,
            } => {
                let mut header = [0u8; QueryHeader::SIZE];
                QueryHeader::new(query_id, query_type, payload.len())
                    .encode_into(&mut header, self.negotiated()?);
                put_packet(dst, &header, &payload)?;
            }
            Frame::QueryReply { query_id, payload } => {
                let mut header = [0u8; QueryReplyHeader::SIZE];
                QueryReplyHeader::new(query_id, payload.len())
                    .encode_into(&mut header, self.negotiated()?);
                put_packet(dst, &header, &payload)?;
            }
        }
        Ok(())
    }
}

fn min_size(packet_type: PacketType) -> usize {
    match packet_type {
        PacketType::Message => MessageHeader::SIZE,
        PacketType::Query => QueryHeader::SIZE,
        PacketType::QueryResponse => QueryReplyHeader::SIZE,
    }
}

fn put_packet(dst: &mut BytesMut, header: &[u8], payload: &[u8]) -> Result<(), SdkCtlError> {
    let size = header.len() + payload.len();
    if size > MAX_PACKET_SIZE {
        return Err(SdkCtlError::PacketTooLarge {
            size,
            max: MAX_PACKET_SIZE,
        });
    }
    dst.reserve(size);
    dst.extend_from_slice(header);
    dst.extend_from_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::SIGNATURE;

    fn device_after_flag() -> SdkCtlCodec {
        let mut codec = SdkCtlCodec::device();
        let mut src = BytesMut::from(&[ByteOrder::native().flag()][..]);
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::Endianness(ByteOrder::native().flag()))
        );
        codec
    }

    #[test]
    fn device_reads_flag_first() {
        let mut codec = SdkCtlCodec::device();
        let mut src = BytesMut::from(&[1u8][..]);
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Frame::Endianness(1)));
        assert_eq!(codec.byte_order(), Some(ByteOrder::Big));
        assert!(src.is_empty());
    }

    #[test]
    fn bad_flag_is_rejected() {
        let mut codec = SdkCtlCodec::device();
        let mut src = BytesMut::from(&[7u8][..]);
        assert!(codec.decode(&mut src).is_err());
    }

    #[test]
    fn big_endian_query_from_host() {
        let mut codec = SdkCtlCodec::device();
        let mut src = BytesMut::new();
        src.put_u8(1);
        src.put_i32(SIGNATURE);
        src.put_i32(QueryHeader::SIZE as i32 + 7);
        src.put_i32(PacketType::Query as i32);
        src.put_i32(42);
        src.put_i32(-1);
        src.extend_from_slice(b"sensors");

        assert_eq!(codec.decode(&mut src).unwrap(), Some(Frame::Endianness(1)));
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Frame::Query {
                query_id: 42,
                query_type: -1,
                payload: Bytes::from_static(b"sensors"),
            })
        );
    }

    #[test]
    fn partial_packet_waits_for_more() {
        let mut host = SdkCtlCodec::host();
        let mut wire = BytesMut::new();
        host.encode(
            Frame::Message {
                msg_type: 5,
                payload: Bytes::from_static(b"hello"),
            },
            &mut wire,
        )
        .unwrap();

        let mut device = device_after_flag();
        let mut src = wire.split_to(MessageHeader::SIZE + 2);
        assert_eq!(device.decode(&mut src).unwrap(), None);
        src.unsplit(wire);
        assert_eq!(
            device.decode(&mut src).unwrap(),
            Some(Frame::Message {
                msg_type: 5,
                payload: Bytes::from_static(b"hello"),
            })
        );
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut codec = SdkCtlCodec::host();
        let mut src = BytesMut::new();
        let header = PacketHeader {
            signature: 0x1234_5678,
            size: PacketHeader::SIZE as i32,
            packet_type: PacketType::Message as i32,
        };
        src.extend_from_slice(&header.encode(ByteOrder::native()));
        assert!(matches!(
            codec.decode(&mut src),
            Err(SdkCtlError::InvalidSignature(0x1234_5678))
        ));
    }

    #[test]
    fn garbage_header_reports_the_signature() {
        let mut codec = SdkCtlCodec::host();
        let mut src = BytesMut::new();
        let header = PacketHeader {
            signature: 0x4142_4344,
            size: 64,
            packet_type: 0x7777,
        };
        src.extend_from_slice(&header.encode(ByteOrder::native()));
        assert!(matches!(
            codec.decode(&mut src),
            Err(SdkCtlError::InvalidSignature(0x4142_4344))
        ));
    }

    #[test]
    fn undersized_reply_is_rejected() {
        let mut codec = SdkCtlCodec::host();
        let mut src = BytesMut::new();
        let header = PacketHeader::new(PacketType::QueryResponse, PacketHeader::SIZE);
        src.extend_from_slice(&header.encode(ByteOrder::native()));
        assert!(matches!(
            codec.decode(&mut src),
            Err(SdkCtlError::InvalidPacketLength { .. })
        ));
    }

    #[test]
    fn device_cannot_encode_before_flag() {
        let mut codec = SdkCtlCodec::device();
        let mut dst = BytesMut::new();
        let result = codec.encode(
            Frame::QueryReply {
                query_id: 1,
                payload: Bytes::new(),
            },
            &mut dst,
        );
        assert!(matches!(result, Err(SdkCtlError::ProtocolViolation(_))));
    }
}
