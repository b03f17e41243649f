// Windows ICMP API transport.
// Uses ICMP.dll, which does not need raw socket privileges.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use crate::icmp::{EchoReply, EchoRequest, EchoStatus, IpVersion, Transport};

const IP_SUCCESS: u32 = 0;
const IP_DEST_NET_UNREACHABLE: u32 = 11002;
const IP_DEST_HOST_UNREACHABLE: u32 = 11003;
const IP_DEST_PROT_UNREACHABLE: u32 = 11004;
const IP_DEST_PORT_UNREACHABLE: u32 = 11005;
const IP_REQ_TIMED_OUT: u32 = 11010;
const IP_TTL_EXPIRED_TRANSIT: u32 = 11013;

const AF_INET6: u16 = 23;
// Room for the reply structure, the echoed data and an ICMP error body.
const REPLY_SLACK: usize = 8 + 64;

#[repr(C)]
struct IpOptionInformation {
    ttl: u8,
    tos: u8,
    flags: u8,
    options_size: u8,
    options_data: *mut u8,
}

#[repr(C)]
struct IcmpEchoReply {
    address: u32,
    status: u32,
    rtt: u32,
    data_size: u16,
    reserved: u16,
    data: *mut u8,
    options: IpOptionInformation,
}

#[repr(C)]
struct SockaddrIn6 {
    sin6_family: u16,
    sin6_port: u16,
    sin6_flowinfo: u32,
    sin6_addr: [u8; 16],
    sin6_scope_id: u32,
}

#[repr(C, packed)]
struct Ipv6AddressEx {
    sin6_port: u16,
    sin6_flowinfo: u32,
    sin6_addr: [u16; 8],
    sin6_scope_id: u32,
}

#[repr(C)]
struct Icmpv6EchoReply {
    address: Ipv6AddressEx,
    status: u32,
    round_trip_time: u32,
}

#[link(name = "iphlpapi")]
unsafe extern "system" {
    fn IcmpCreateFile() -> *mut std::ffi::c_void;
    fn Icmp6CreateFile() -> *mut std::ffi::c_void;
    fn IcmpCloseHandle(icmp_handle: *mut std::ffi::c_void) -> i32;
    fn IcmpSendEcho2(
        icmp_handle: *mut std::ffi::c_void,
        event: *mut std::ffi::c_void,
        apc_routine: *mut std::ffi::c_void,
        apc_context: *mut std::ffi::c_void,
        destination_address: u32,
        request_data: *const u8,
        request_size: u16,
        request_options: *const IpOptionInformation,
        reply_buffer: *mut u8,
        reply_size: u32,
        timeout: u32,
    ) -> u32;
    fn Icmp6SendEcho2(
        icmp_handle: *mut std::ffi::c_void,
        event: *mut std::ffi::c_void,
        apc_routine: *mut std::ffi::c_void,
        apc_context: *mut std::ffi::c_void,
        source_address: *const SockaddrIn6,
        destination_address: *const SockaddrIn6,
        request_data: *const u8,
        request_size: u16,
        request_options: *const IpOptionInformation,
        reply_buffer: *mut u8,
        reply_size: u32,
        timeout: u32,
    ) -> u32;
}

/// Owned ICMP handle, closed on drop.
struct IcmpHandle(*mut std::ffi::c_void);

impl IcmpHandle {
    fn open(version: IpVersion) -> anyhow::Result<Self> {
        let handle = unsafe {
            match version {
                IpVersion::V4 => IcmpCreateFile(),
                IpVersion::V6 => Icmp6CreateFile(),
            }
        };

        if handle.is_null() || handle as isize == -1 {
            return Err(anyhow::anyhow!("Failed to create {} ICMP handle", version));
        }

        Ok(Self(handle))
    }
}

impl Drop for IcmpHandle {
    fn drop(&mut self) {
        unsafe {
            IcmpCloseHandle(self.0);
        }
    }
}

fn classify(status: u32) -> EchoStatus {
    match status {
        IP_SUCCESS => EchoStatus::Reply,
        IP_TTL_EXPIRED_TRANSIT => EchoStatus::TtlExpired,
        IP_REQ_TIMED_OUT => EchoStatus::TimedOut,
        IP_DEST_NET_UNREACHABLE => EchoStatus::Unreachable(0),
        IP_DEST_HOST_UNREACHABLE => EchoStatus::Unreachable(1),
        IP_DEST_PROT_UNREACHABLE => EchoStatus::Unreachable(2),
        IP_DEST_PORT_UNREACHABLE => EchoStatus::Unreachable(3),
        other => EchoStatus::Failed(format!("ICMP status {}", other)),
    }
}

/// Echo transport over the Windows ICMP helper API.
///
/// A handle is opened per request, so requests from different threads never
/// share one.
pub struct IcmpApiTransport {
    version: IpVersion,
}

impl IcmpApiTransport {
    pub fn new(version: IpVersion) -> anyhow::Result<Self> {
        IcmpHandle::open(version)?;
        Ok(Self { version })
    }

    fn send_v4(&self, handle: &IcmpHandle, target: Ipv4Addr, request: &EchoRequest) -> (u32, Option<(u32, IpAddr)>) {
        let options = IpOptionInformation {
            ttl: request.ttl.unwrap_or(128),
            tos: 0,
            flags: 0,
            options_size: 0,
            options_data: std::ptr::null_mut(),
        };

        let reply_size = std::mem::size_of::<IcmpEchoReply>() + request.payload.len() + REPLY_SLACK;
        let mut reply_buffer = vec![0u8; reply_size];

        let result = unsafe {
            IcmpSendEcho2(
                handle.0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                u32::from_ne_bytes(target.octets()),
                request.payload.as_ptr(),
                request.payload.len() as u16,
                &options,
                reply_buffer.as_mut_ptr(),
                reply_size as u32,
                request.timeout.as_millis() as u32,
            )
        };

        if result == 0 {
            return (result, None);
        }

        let reply = unsafe { std::ptr::read_unaligned(reply_buffer.as_ptr() as *const IcmpEchoReply) };
        let responder = IpAddr::V4(Ipv4Addr::from(reply.address.to_ne_bytes()));
        (result, Some((reply.status, responder)))
    }

    fn send_v6(&self, handle: &IcmpHandle, target: Ipv6Addr, request: &EchoRequest) -> (u32, Option<(u32, IpAddr)>) {
        let options = IpOptionInformation {
            ttl: request.ttl.unwrap_or(128),
            tos: 0,
            flags: 0,
            options_size: 0,
            options_data: std::ptr::null_mut(),
        };

        let source = SockaddrIn6 {
            sin6_family: AF_INET6,
            sin6_port: 0,
            sin6_flowinfo: 0,
            sin6_addr: [0; 16],
            sin6_scope_id: 0,
        };
        let destination = SockaddrIn6 {
            sin6_family: AF_INET6,
            sin6_port: 0,
            sin6_flowinfo: 0,
            sin6_addr: target.octets(),
            sin6_scope_id: 0,
        };

        let reply_size = std::mem::size_of::<Icmpv6EchoReply>() + request.payload.len() + REPLY_SLACK;
        let mut reply_buffer = vec![0u8; reply_size];

        let result = unsafe {
            Icmp6SendEcho2(
                handle.0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &source,
                &destination,
                request.payload.as_ptr(),
                request.payload.len() as u16,
                &options,
                reply_buffer.as_mut_ptr(),
                reply_size as u32,
                request.timeout.as_millis() as u32,
            )
        };

        if result == 0 {
            return (result, None);
        }

        let reply = unsafe { std::ptr::read_unaligned(reply_buffer.as_ptr() as *const Icmpv6EchoReply) };
        let words = reply.address.sin6_addr;
        let mut octets = [0u8; 16];
        for (i, word) in words.iter().enumerate() {
            // Words are stored in network order.
            octets[i * 2..i * 2 + 2].copy_from_slice(&word.to_ne_bytes());
        }
        (result, Some((reply.status, IpAddr::V6(Ipv6Addr::from(octets)))))
    }
}

impl Transport for IcmpApiTransport {
    fn ip_version(&self) -> IpVersion {
        self.version
    }

    fn name(&self) -> &'static str {
        "icmp-api"
    }

    fn round_trip(&self, request: &EchoRequest) -> EchoReply {
        let started = Instant::now();

        let handle = match IcmpHandle::open(self.version) {
            Ok(handle) => handle,
            Err(e) => return EchoReply::failed(e.to_string(), started.elapsed()),
        };

        let (_, reply) = match request.address {
            IpAddr::V4(target) if self.version == IpVersion::V4 => self.send_v4(&handle, target, request),
            IpAddr::V6(target) if self.version == IpVersion::V6 => self.send_v6(&handle, target, request),
            other => {
                return EchoReply::failed(
                    format!("{} cannot be reached through an {} ICMP handle", other, self.version),
                    Duration::ZERO,
                );
            }
        };

        let elapsed = started.elapsed();

        match reply {
            Some((status, responder)) => {
                let status = classify(status);
                let responder = (status != EchoStatus::TimedOut).then_some(responder);
                EchoReply { status, responder, elapsed }
            }
            None => EchoReply::timed_out(elapsed),
        }
    }
}

// Test if Windows ICMP API is available
pub fn is_winapi_available(version: IpVersion) -> bool {
    IcmpHandle::open(version).is_ok()
}
