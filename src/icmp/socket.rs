use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use crate::icmp::{
    parse_message, strip_ipv4_header, EchoReply, EchoRequest, EchoStatus, IcmpPacket, IpVersion,
    MessageKind, Transport,
};

const RECV_BUFFER_SIZE: usize = 1500;

/// Echo transport over raw ICMP sockets.
///
/// Each request opens its own socket: the TTL is a per-socket option and every
/// raw socket sees a copy of all inbound ICMP traffic, so concurrent requests
/// never have to share either.
pub struct RawSocketTransport {
    version: IpVersion,
    identifier: u16,
    source: Option<IpAddr>,
}

impl RawSocketTransport {
    pub fn new(version: IpVersion) -> anyhow::Result<Self> {
        let transport = Self {
            version,
            identifier: crate::utils::generate_identifier(),
            source: None,
        };

        // Fail at construction rather than on the first probe.
        transport.open_socket(None)?;

        Ok(transport)
    }

    pub fn with_source(mut self, source: IpAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    fn open_socket(&self, ttl: Option<u8>) -> anyhow::Result<Socket> {
        let is_ipv6 = self.version.is_ipv6();
        let domain = if is_ipv6 { Domain::IPV6 } else { Domain::IPV4 };
        let protocol = if is_ipv6 { Protocol::ICMPV6 } else { Protocol::ICMPV4 };

        let socket = Socket::new(domain, Type::RAW, Some(protocol)).map_err(|e| {
            anyhow::anyhow!(
                "Failed to create raw socket: {}. Administrator privileges may be required.",
                e
            )
        })?;

        if let Some(ttl) = ttl {
            if is_ipv6 {
                socket
                    .set_unicast_hops_v6(u32::from(ttl))
                    .map_err(|e| anyhow::anyhow!("Failed to set IPv6 hop limit: {}", e))?;
            } else {
                socket
                    .set_ttl(u32::from(ttl))
                    .map_err(|e| anyhow::anyhow!("Failed to set IPv4 TTL: {}", e))?;
            }
        }

        if let Some(source) = self.source {
            socket
                .bind(&SocketAddr::new(source, 0).into())
                .map_err(|e| anyhow::anyhow!("Failed to bind to source address {}: {}", source, e))?;
        }

        Ok(socket)
    }

    fn exchange(&self, request: &EchoRequest, started: Instant) -> anyhow::Result<EchoReply> {
        let is_ipv6 = self.version.is_ipv6();
        let socket = self.open_socket(request.ttl)?;

        let sequence = request.token as u16;
        let packet = IcmpPacket::new_echo_request(self.identifier, sequence, &request.payload, is_ipv6);
        let packet_bytes = packet.to_bytes();

        log::trace!(
            "Sending echo request {} to {} (ttl {:?}, {} bytes)",
            request.token,
            request.address,
            request.ttl,
            packet_bytes.len()
        );
        socket.send_to(&packet_bytes, &SocketAddr::new(request.address, 0).into())?;

        let deadline = started + request.timeout;
        let mut buffer = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(EchoReply::timed_out(now - started));
            }

            socket.set_read_timeout(Some(deadline - now))?;

            let (received, source_addr) = match socket.recv_from(&mut buffer) {
                Ok(result) => result,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            // recv_from initialised the first `received` bytes.
            let data: Vec<u8> = buffer[..received]
                .iter()
                .map(|byte| unsafe { byte.assume_init() })
                .collect();

            let icmp_data = if is_ipv6 {
                Some(data.as_slice())
            } else {
                strip_ipv4_header(&data)
            };

            let Some(message) = icmp_data.and_then(|icmp| parse_message(icmp, is_ipv6)) else {
                continue;
            };

            if message.identifier != self.identifier || message.sequence != sequence {
                continue;
            }

            let status = match message.kind {
                MessageKind::EchoReply => EchoStatus::Reply,
                MessageKind::TimeExceeded => EchoStatus::TtlExpired,
                MessageKind::Unreachable(code) => EchoStatus::Unreachable(code),
            };

            return Ok(EchoReply {
                status,
                responder: source_addr.as_socket().map(|addr| addr.ip()),
                elapsed: started.elapsed(),
            });
        }
    }
}

impl Transport for RawSocketTransport {
    fn ip_version(&self) -> IpVersion {
        self.version
    }

    fn name(&self) -> &'static str {
        "raw-socket"
    }

    fn round_trip(&self, request: &EchoRequest) -> EchoReply {
        let started = Instant::now();

        match self.exchange(request, started) {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!("Echo request {} to {} failed: {}", request.token, request.address, e);
                EchoReply::failed(e.to_string(), started.elapsed())
            }
        }
    }
}

/// Whether a raw ICMP socket of the given family can be opened right now.
pub fn check_raw_socket_privileges(version: IpVersion) -> bool {
    RawSocketTransport::new(version).is_ok()
}
