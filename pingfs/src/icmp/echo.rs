use super::{get_checksum, write_checksum, IcmpV4, IcmpV6, PacketError, PacketResult, HEADER_SIZE};

/// Family-specific echo constants. The v6 kernel fills in the checksum on
/// raw ICMPv6 sockets, so only v4 frames carry one computed here.
pub trait Echo {
    const REQUEST_TYPE: u8;
    const REPLY_TYPE: u8;
    const CODE: u8;
    const LOCAL_CHECKSUM: bool;
}

impl Echo for IcmpV4 {
    const REQUEST_TYPE: u8 = 8;
    const REPLY_TYPE: u8 = 0;
    const CODE: u8 = 0;
    const LOCAL_CHECKSUM: bool = true;
}

impl Echo for IcmpV6 {
    const REQUEST_TYPE: u8 = 128;
    const REPLY_TYPE: u8 = 129;
    const CODE: u8 = 0;
    const LOCAL_CHECKSUM: bool = false;
}

pub struct EchoRequest<'a> {
    pub ident: u16,
    pub seq_cnt: u16,
    pub payload: &'a [u8],
}

impl<'a> EchoRequest<'a> {
    /// Write the request frame into `buffer`, returning the frame length.
    pub fn encode<P: Echo>(&self, buffer: &mut [u8]) -> PacketResult<usize> {
        let total = HEADER_SIZE + self.payload.len();
        if buffer.len() < total {
            return Err(PacketError::Oversize);
        }

        buffer[0] = P::REQUEST_TYPE;
        buffer[1] = P::CODE;
        buffer[2..4].copy_from_slice(&[0, 0]);
        buffer[4..6].copy_from_slice(&self.ident.to_be_bytes());
        buffer[6..8].copy_from_slice(&self.seq_cnt.to_be_bytes());
        buffer[8..total].copy_from_slice(self.payload);

        if P::LOCAL_CHECKSUM {
            write_checksum(&mut buffer[..total]);
        }

        Ok(total)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EchoKind {
    Request,
    Reply,
}

#[derive(Debug)]
pub struct EchoPacket<'a> {
    pub kind: EchoKind,
    pub ident: u16,
    pub seq_cnt: u16,
    pub payload: &'a [u8],
}

impl<'a> EchoPacket<'a> {
    /// Decode an ICMP frame (IP header already stripped) and classify it.
    pub fn decode<P: Echo>(buffer: &'a [u8]) -> PacketResult<EchoPacket<'a>> {
        if buffer.len() < HEADER_SIZE {
            return Err(PacketError::TooShort);
        }

        let kind = match buffer[0] {
            t if t == P::REQUEST_TYPE => EchoKind::Request,
            t if t == P::REPLY_TYPE => EchoKind::Reply,
            t => return Err(PacketError::UnknownType(t)),
        };
        if buffer[1] != P::CODE {
            return Err(PacketError::BadCode(buffer[1]));
        }
        if P::LOCAL_CHECKSUM && get_checksum(buffer) != 0 {
            return Err(PacketError::BadChecksum);
        }

        let ident = u16::from_be_bytes([buffer[4], buffer[5]]);
        let seq_cnt = u16::from_be_bytes([buffer[6], buffer[7]]);

        Ok(EchoPacket {
            kind,
            ident,
            seq_cnt,
            payload: &buffer[HEADER_SIZE..],
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn frame<P: Echo>(ident: u16, seq_cnt: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE + payload.len()];
        let len = EchoRequest {
            ident,
            seq_cnt,
            payload,
        }
        .encode::<P>(&mut buf)
        .unwrap();
        assert_eq!(len, buf.len());
        buf
    }

    #[test]
    fn encode_v4_layout() {
        let buf = frame::<IcmpV4>(0x1234, 0x5678, b"ab");
        assert_eq!(buf[0], 8);
        assert_eq!(buf[1], 0);
        assert_eq!(&buf[4..6], &[0x12, 0x34]);
        assert_eq!(&buf[6..8], &[0x56, 0x78]);
        assert_eq!(&buf[8..], b"ab");
        // A frame with a valid checksum sums to zero.
        assert_eq!(get_checksum(&buf), 0);
    }

    #[test]
    fn encode_v6_leaves_checksum_to_kernel() {
        let buf = frame::<IcmpV6>(1, 2, b"xyz");
        assert_eq!(buf[0], 128);
        assert_eq!(&buf[2..4], &[0, 0]);
    }

    #[test]
    fn decode_classifies_request_and_reply() {
        let req = frame::<IcmpV4>(7, 9, b"data");
        let pkt = EchoPacket::decode::<IcmpV4>(&req).unwrap();
        assert_eq!(pkt.kind, EchoKind::Request);
        assert_eq!(pkt.ident, 7);
        assert_eq!(pkt.seq_cnt, 9);
        assert_eq!(pkt.payload, b"data");

        let mut reply = frame::<IcmpV4>(7, 9, b"data");
        reply[0] = 0;
        reply[2..4].copy_from_slice(&[0, 0]);
        write_checksum(&mut reply);
        let pkt = EchoPacket::decode::<IcmpV4>(&reply).unwrap();
        assert_eq!(pkt.kind, EchoKind::Reply);
    }

    #[test]
    fn decode_rejects_foreign_types() {
        // Destination unreachable, type 3
        let mut buf = frame::<IcmpV4>(1, 1, &[]);
        buf[0] = 3;
        write_checksum(&mut buf);
        assert_eq!(
            EchoPacket::decode::<IcmpV4>(&buf).unwrap_err(),
            PacketError::UnknownType(3)
        );
    }

    #[test]
    fn decode_rejects_nonzero_code() {
        let mut buf = frame::<IcmpV4>(1, 1, &[]);
        buf[1] = 5;
        buf[2..4].copy_from_slice(&[0, 0]);
        write_checksum(&mut buf);
        assert_eq!(
            EchoPacket::decode::<IcmpV4>(&buf).unwrap_err(),
            PacketError::BadCode(5)
        );
    }

    #[test]
    fn decode_rejects_corrupt_checksum() {
        let mut buf = frame::<IcmpV4>(1, 1, b"payload");
        buf[10] ^= 0xff;
        assert_eq!(
            EchoPacket::decode::<IcmpV4>(&buf).unwrap_err(),
            PacketError::BadChecksum
        );
    }

    #[test]
    fn decode_rejects_short_frames() {
        assert_eq!(
            EchoPacket::decode::<IcmpV6>(&[128, 0, 0]).unwrap_err(),
            PacketError::TooShort
        );
    }

    #[test]
    fn encode_refuses_small_buffer() {
        let mut buf = [0u8; 8];
        let req = EchoRequest {
            ident: 1,
            seq_cnt: 1,
            payload: b"too long",
        };
        assert_eq!(req.encode::<IcmpV4>(&mut buf).unwrap_err(), PacketError::Oversize);
    }

    proptest! {
        #[test]
        fn roundtrip_v4(ident: u16, seq_cnt: u16,
                        payload in proptest::collection::vec(any::<u8>(), 0..1400)) {
            let buf = frame::<IcmpV4>(ident, seq_cnt, &payload);
            prop_assert_eq!(get_checksum(&buf), 0);
            let pkt = EchoPacket::decode::<IcmpV4>(&buf).unwrap();
            prop_assert_eq!(pkt.kind, EchoKind::Request);
            prop_assert_eq!(pkt.ident, ident);
            prop_assert_eq!(pkt.seq_cnt, seq_cnt);
            prop_assert_eq!(pkt.payload, &payload[..]);
        }

        #[test]
        fn roundtrip_v6(ident: u16, seq_cnt: u16,
                        payload in proptest::collection::vec(any::<u8>(), 0..1400)) {
            let buf = frame::<IcmpV6>(ident, seq_cnt, &payload);
            let pkt = EchoPacket::decode::<IcmpV6>(&buf).unwrap();
            prop_assert_eq!(pkt.kind, EchoKind::Request);
            prop_assert_eq!(pkt.ident, ident);
            prop_assert_eq!(pkt.seq_cnt, seq_cnt);
            prop_assert_eq!(pkt.payload, &payload[..]);
        }
    }
}
