//! Raw-socket re-injection for pipelines that fan one packet out to many.
//!
//! A single diverted packet can only re-enter the kernel once via its
//! verdict; every additional packet a pipeline produces is sent through a
//! raw socket instead, headers included.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{Error, Result};
use crate::packet::Packet;

// IPPROTO_RAW: the kernel sends the caller-supplied header as-is.
const PROTO_RAW: i32 = 255;

/// Pushes finished packets back onto the wire.
pub trait Injector: Send {
    fn inject(&mut self, packet: &Packet) -> Result<()>;
}

/// Raw sockets, one per address family, opened on first use.
#[derive(Default)]
pub struct RawInjector {
    v4: Option<Socket>,
    v6: Option<Socket>,
}

impl RawInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn socket(slot: &mut Option<Socket>, domain: Domain) -> Result<&Socket> {
        if slot.is_none() {
            let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(PROTO_RAW)))
                .map_err(|err| Error::setup(format!("open raw socket: {err}")))?;
            *slot = Some(socket);
        }
        slot.as_ref()
            .ok_or_else(|| Error::internal("raw socket slot"))
    }
}

impl Injector for RawInjector {
    fn inject(&mut self, packet: &Packet) -> Result<()> {
        let destination = packet
            .destination_ip()
            .ok_or_else(|| Error::internal("cannot inject a packet without an IP destination"))?;
        let (socket, addr) = match destination {
            IpAddr::V4(ip) => (
                Self::socket(&mut self.v4, Domain::IPV4)?,
                SockAddr::from(SocketAddr::from((ip, 0))),
            ),
            IpAddr::V6(ip) => (
                Self::socket(&mut self.v6, Domain::IPV6)?,
                SockAddr::from(SocketAddr::from((ip, 0))),
            ),
        };
        socket
            .send_to(packet.as_bytes(), &addr)
            .map_err(|err| Error::setup(format!("raw send to {destination}: {err}")))?;
        Ok(())
    }
}

/// Captures injected packets for assertions.
#[derive(Clone, Default)]
pub struct RecordingInjector {
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl RecordingInjector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Injector for RecordingInjector {
    fn inject(&mut self, packet: &Packet) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(packet.as_bytes().to_vec());
        Ok(())
    }
}
