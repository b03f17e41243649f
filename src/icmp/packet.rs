use byteorder::{BigEndian, ByteOrder};

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TIME_EXCEEDED: u8 = 11;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;
pub const ICMPV6_DEST_UNREACHABLE: u8 = 1;
pub const ICMPV6_TIME_EXCEEDED: u8 = 3;

pub const ICMP_HEADER_SIZE: usize = 8;
const IPV4_MIN_HEADER_SIZE: usize = 20;
const IPV6_HEADER_SIZE: usize = 40;

#[derive(Debug, Clone)]
pub struct IcmpPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl IcmpPacket {
    pub fn new_echo_request(identifier: u16, sequence: u16, payload: &[u8], is_ipv6: bool) -> Self {
        let icmp_type = if is_ipv6 { ICMPV6_ECHO_REQUEST } else { ICMP_ECHO_REQUEST };

        let mut packet = Self {
            icmp_type,
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            payload: payload.to_vec(),
        };

        packet.calculate_checksum();
        packet
    }

    pub fn from_bytes(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < ICMP_HEADER_SIZE {
            return Err(anyhow::anyhow!("ICMP packet too short: {} bytes", data.len()));
        }

        Ok(Self {
            icmp_type: data[0],
            code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            identifier: BigEndian::read_u16(&data[4..6]),
            sequence: BigEndian::read_u16(&data[6..8]),
            payload: data[ICMP_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header = [0u8; ICMP_HEADER_SIZE];
        header[0] = self.icmp_type;
        header[1] = self.code;
        BigEndian::write_u16(&mut header[2..4], self.checksum);
        BigEndian::write_u16(&mut header[4..6], self.identifier);
        BigEndian::write_u16(&mut header[6..8], self.sequence);

        let mut bytes = Vec::with_capacity(ICMP_HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// ICMPv6 checksums are rewritten by the kernel for raw sockets; the
    /// value computed here only matters for ICMPv4.
    pub fn calculate_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.to_bytes();
        self.checksum = compute_checksum(&bytes);
    }

    pub fn verify_checksum(&self) -> bool {
        compute_checksum(&self.to_bytes()) == 0
    }
}

fn compute_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(BigEndian::read_u16(&[*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Payload carried by every request, filled with 'a' like the Windows ping.
pub fn echo_payload(size: usize) -> Vec<u8> {
    vec![0x61; size]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    EchoReply,
    TimeExceeded,
    Unreachable(u8),
}

/// An ICMP message that answers one of our echo requests.
///
/// For error messages the identifier and sequence come from the echo header
/// quoted back inside the error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpMessage {
    pub kind: MessageKind,
    pub identifier: u16,
    pub sequence: u16,
}

/// Skips the IPv4 header a raw IPv4 socket hands back in front of the ICMP data.
pub fn strip_ipv4_header(data: &[u8]) -> Option<&[u8]> {
    let first = *data.first()?;
    if first >> 4 != 4 {
        return None;
    }

    let header_len = usize::from(first & 0x0F) * 4;
    if header_len < IPV4_MIN_HEADER_SIZE || data.len() < header_len + ICMP_HEADER_SIZE {
        return None;
    }

    Some(&data[header_len..])
}

/// Classifies ICMP data (no IP header) that could answer an echo request.
/// Anything else, including our own outgoing requests, yields `None`.
pub fn parse_message(data: &[u8], is_ipv6: bool) -> Option<IcmpMessage> {
    let packet = IcmpPacket::from_bytes(data).ok()?;

    let kind = match (is_ipv6, packet.icmp_type) {
        (false, ICMP_ECHO_REPLY) | (true, ICMPV6_ECHO_REPLY) => {
            return Some(IcmpMessage {
                kind: MessageKind::EchoReply,
                identifier: packet.identifier,
                sequence: packet.sequence,
            });
        }
        (false, ICMP_TIME_EXCEEDED) | (true, ICMPV6_TIME_EXCEEDED) => MessageKind::TimeExceeded,
        (false, ICMP_DEST_UNREACHABLE) | (true, ICMPV6_DEST_UNREACHABLE) => {
            MessageKind::Unreachable(packet.code)
        }
        _ => return None,
    };

    let quoted = quoted_echo_header(&packet.payload, is_ipv6)?;
    Some(IcmpMessage {
        kind,
        identifier: BigEndian::read_u16(&quoted[4..6]),
        sequence: BigEndian::read_u16(&quoted[6..8]),
    })
}

fn quoted_echo_header(body: &[u8], is_ipv6: bool) -> Option<&[u8]> {
    let inner = if is_ipv6 {
        body.get(IPV6_HEADER_SIZE..)?
    } else {
        let header_len = usize::from(*body.first()? & 0x0F) * 4;
        if header_len < IPV4_MIN_HEADER_SIZE {
            return None;
        }
        body.get(header_len..)?
    };

    if inner.len() < ICMP_HEADER_SIZE {
        return None;
    }

    let expected = if is_ipv6 { ICMPV6_ECHO_REQUEST } else { ICMP_ECHO_REQUEST };
    (inner[0] == expected).then_some(inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_header(protocol: u8) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45;
        header[8] = 64;
        header[9] = protocol;
        header
    }

    #[test]
    fn test_icmp_packet_creation() {
        let packet = IcmpPacket::new_echo_request(1234, 1, &echo_payload(32), false);
        assert_eq!(packet.icmp_type, ICMP_ECHO_REQUEST);
        assert_eq!(packet.code, 0);
        assert_eq!(packet.identifier, 1234);
        assert_eq!(packet.sequence, 1);
        assert_eq!(packet.payload.len(), 32);
    }

    #[test]
    fn test_icmp_packet_serialization() {
        let packet = IcmpPacket::new_echo_request(1234, 1, &echo_payload(32), false);
        let parsed = IcmpPacket::from_bytes(&packet.to_bytes()).unwrap();

        assert_eq!(packet.icmp_type, parsed.icmp_type);
        assert_eq!(packet.identifier, parsed.identifier);
        assert_eq!(packet.sequence, parsed.sequence);
        assert_eq!(packet.payload, parsed.payload);
    }

    #[test]
    fn test_checksum_calculation() {
        let packet = IcmpPacket::new_echo_request(1234, 1, &echo_payload(33), false);
        assert_ne!(packet.checksum, 0);
        assert!(packet.verify_checksum());
    }

    #[test]
    fn test_short_packet_rejected() {
        assert!(IcmpPacket::from_bytes(&[0, 0, 0]).is_err());
        assert!(parse_message(&[0, 0, 0], false).is_none());
    }

    #[test]
    fn test_parse_echo_reply() {
        let mut reply = IcmpPacket::new_echo_request(77, 9, b"pingnoo", false);
        reply.icmp_type = ICMP_ECHO_REPLY;

        let message = parse_message(&reply.to_bytes(), false).unwrap();
        assert_eq!(message.kind, MessageKind::EchoReply);
        assert_eq!(message.identifier, 77);
        assert_eq!(message.sequence, 9);
    }

    #[test]
    fn test_own_request_ignored() {
        let request = IcmpPacket::new_echo_request(77, 9, b"", false);
        assert!(parse_message(&request.to_bytes(), false).is_none());
    }

    #[test]
    fn test_parse_time_exceeded_v4() {
        let original = IcmpPacket::new_echo_request(0xBEEF, 42, &echo_payload(8), false);

        let mut body = ipv4_header(1);
        body.extend_from_slice(&original.to_bytes()[..8]);

        let error = IcmpPacket {
            icmp_type: ICMP_TIME_EXCEEDED,
            code: 0,
            checksum: 0,
            identifier: 0,
            sequence: 0,
            payload: body,
        };

        let message = parse_message(&error.to_bytes(), false).unwrap();
        assert_eq!(message.kind, MessageKind::TimeExceeded);
        assert_eq!(message.identifier, 0xBEEF);
        assert_eq!(message.sequence, 42);
    }

    #[test]
    fn test_parse_unreachable_v6() {
        let original = IcmpPacket::new_echo_request(5, 6, b"", true);

        let mut body = vec![0u8; 40];
        body[0] = 0x60;
        body.extend_from_slice(&original.to_bytes());

        let error = IcmpPacket {
            icmp_type: ICMPV6_DEST_UNREACHABLE,
            code: 4,
            checksum: 0,
            identifier: 0,
            sequence: 0,
            payload: body,
        };

        let message = parse_message(&error.to_bytes(), true).unwrap();
        assert_eq!(message.kind, MessageKind::Unreachable(4));
        assert_eq!(message.identifier, 5);
        assert_eq!(message.sequence, 6);
    }

    #[test]
    fn test_strip_ipv4_header() {
        let mut datagram = ipv4_header(1);
        let reply = IcmpPacket::new_echo_request(1, 2, b"", false);
        datagram.extend_from_slice(&reply.to_bytes());

        let icmp = strip_ipv4_header(&datagram).unwrap();
        assert_eq!(icmp.len(), 8);
        assert_eq!(icmp[0], ICMP_ECHO_REQUEST);

        assert!(strip_ipv4_header(&[0x60; 40]).is_none());
        assert!(strip_ipv4_header(&[]).is_none());
    }
}
