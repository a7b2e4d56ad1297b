//! The network abstraction consumed by [`crate::listener::Listener`] and
//! [`crate::conn::Connection`] (spec §6). A [`Network`] delivers raw segment
//! bytes plus the addresses they travelled between; it never inspects TCP
//! semantics.
//!
//! Two implementations are provided: [`TunNetwork`], which reads/writes real
//! IPv4 packets off a TUN device via `tidy-tuntap`, and [`MemoryNetwork`],
//! an in-process loopback pair for deterministic tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

use etherparse::Ipv4HeaderSlice;
use nix::poll::{poll, PollFd, PollFlags};
use tidy_tuntap::Tun;

pub type ReceiveCallback = Box<dyn FnMut(Ipv4Addr, Ipv4Addr, Vec<u8>)>;

/// A non-blocking, shareable datagram transport. All methods take `&self`
/// so a single instance can be handed out as `Rc<dyn Network>` to the
/// listener, every connection, and the runtime's poll loop alike (spec §5:
/// "the network object is shared by all Connections").
pub trait Network {
    /// Registers the callback invoked for every inbound segment. Only one
    /// callback may be registered; registering again replaces it.
    fn register_receiver(&self, callback: ReceiveCallback);

    /// Non-blocking send; the caller does not learn of delivery failure.
    fn send(&self, segment: &[u8], dst: Ipv4Addr);

    /// Whether the listener should verify segment checksums.
    fn ignore_checksum(&self) -> bool;

    /// The single local address this network is bound to.
    fn local_addr(&self) -> Ipv4Addr;

    /// Waits up to `timeout` for one inbound datagram and, if one arrives,
    /// feeds it to the registered receiver. Returns whether anything was
    /// delivered. Never blocks longer than `timeout`.
    fn poll(&self, timeout: Duration) -> bool;
}

/// Real network backed by a TUN device. Decapsulates IPv4 to hand the
/// engine bare TCP segment bytes, and re-encapsulates on send — the engine
/// itself never constructs an IP header.
pub struct TunNetwork {
    tun: RefCell<Tun>,
    local_addr: Ipv4Addr,
    ignore_checksum: bool,
    receiver: RefCell<Option<ReceiveCallback>>,
}

impl TunNetwork {
    pub fn new(device: &str, local_addr: Ipv4Addr, netmask: Ipv4Addr) -> crate::error::Result<Self> {
        let tun = Tun::new(device, false)?;
        tun.set_addr(local_addr)?;
        tun.set_netmask(netmask)?;
        tun.bring_up()?;

        Ok(TunNetwork {
            tun: RefCell::new(tun),
            local_addr,
            ignore_checksum: false,
            receiver: RefCell::new(None),
        })
    }

    pub fn with_ignore_checksum(mut self, ignore: bool) -> Self {
        self.ignore_checksum = ignore;
        self
    }
}

impl Network for TunNetwork {
    fn register_receiver(&self, callback: ReceiveCallback) {
        *self.receiver.borrow_mut() = Some(callback);
    }

    fn send(&self, segment: &[u8], dst: Ipv4Addr) {
        let ip_header = etherparse::Ipv4Header::new(
            segment.len() as u16,
            64,
            6, // TCP
            self.local_addr.octets(),
            dst.octets(),
        );

        let mut out = Vec::with_capacity(20 + segment.len());
        if ip_header.write(&mut out).is_err() {
            tracing::warn!("failed to encode outgoing IPv4 header");
            return;
        }
        out.extend_from_slice(segment);

        if let Err(err) = self.tun.borrow_mut().write(&out) {
            tracing::warn!(%err, "tun write failed");
        }
    }

    fn ignore_checksum(&self) -> bool {
        self.ignore_checksum
    }

    fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    fn poll(&self, timeout: Duration) -> bool {
        let fd = self.tun.borrow().as_raw_fd();
        let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        match poll(&mut pfd, millis) {
            Ok(n) if n > 0 => {}
            _ => return false,
        }

        let mut buf = [0u8; 1500];
        let n = match self.tun.borrow_mut().read(&mut buf) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return false,
            Err(err) => {
                tracing::warn!(%err, "tun read failed");
                return false;
            }
        };

        let Ok(ip_header) = Ipv4HeaderSlice::from_slice(&buf[..n]) else {
            tracing::debug!("dropping malformed IPv4 packet");
            return false;
        };
        let ihl = (ip_header.ihl() * 4) as usize;
        let src = ip_header.source_addr();
        let dst = ip_header.destination_addr();

        if let Some(cb) = self.receiver.borrow_mut().as_mut() {
            cb(src, dst, buf[ihl..n].to_vec());
            true
        } else {
            false
        }
    }
}

/// An in-process loopback pair, used by tests to drive the engine without a
/// real device. `send` on one end enqueues directly onto the other end's
/// inbound queue.
pub struct MemoryNetwork {
    local_addr: Ipv4Addr,
    ignore_checksum: bool,
    inbound: Rc<RefCell<VecDeque<(Ipv4Addr, Ipv4Addr, Vec<u8>)>>>,
    peer_inbound: Rc<RefCell<VecDeque<(Ipv4Addr, Ipv4Addr, Vec<u8>)>>>,
    receiver: RefCell<Option<ReceiveCallback>>,
}

impl MemoryNetwork {
    /// Builds a connected pair: `a`'s sends land in `b`'s inbound queue and
    /// vice versa.
    pub fn pair(a_addr: Ipv4Addr, b_addr: Ipv4Addr, ignore_checksum: bool) -> (Self, Self) {
        let a_queue = Rc::new(RefCell::new(VecDeque::new()));
        let b_queue = Rc::new(RefCell::new(VecDeque::new()));

        let a = MemoryNetwork {
            local_addr: a_addr,
            ignore_checksum,
            inbound: a_queue.clone(),
            peer_inbound: b_queue.clone(),
            receiver: RefCell::new(None),
        };
        let b = MemoryNetwork {
            local_addr: b_addr,
            ignore_checksum,
            inbound: b_queue,
            peer_inbound: a_queue,
            receiver: RefCell::new(None),
        };
        (a, b)
    }

    /// Delivers every queued datagram to the registered receiver. Unlike
    /// `poll`, which surfaces at most one at a time to mirror a real event
    /// loop tick, this drains the whole queue — handy for test setup.
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        while self.poll(Duration::ZERO) {
            delivered += 1;
        }
        delivered
    }
}

impl Network for MemoryNetwork {
    fn register_receiver(&self, callback: ReceiveCallback) {
        *self.receiver.borrow_mut() = Some(callback);
    }

    fn send(&self, segment: &[u8], dst: Ipv4Addr) {
        self.peer_inbound
            .borrow_mut()
            .push_back((self.local_addr, dst, segment.to_vec()));
    }

    fn ignore_checksum(&self) -> bool {
        self.ignore_checksum
    }

    fn local_addr(&self) -> Ipv4Addr {
        self.local_addr
    }

    fn poll(&self, _timeout: Duration) -> bool {
        let next = self.inbound.borrow_mut().pop_front();
        match next {
            Some((src, dst, bytes)) => {
                if let Some(cb) = self.receiver.borrow_mut().as_mut() {
                    cb(src, dst, bytes);
                }
                true
            }
            None => false,
        }
    }
}
