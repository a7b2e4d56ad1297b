//! Passive-open demultiplexing (spec §4.1): binds a local port, spawns a
//! [`Connection`] per inbound SYN, and routes subsequent segments to the
//! right connection by 4-tuple.
//!
//! A `HashMap` of live connections keyed by `Quad`, walked on every inbound
//! packet, with a user-supplied accept callback invoked once a SYN spawns a
//! new entry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Instant;

use rand::Rng;

use crate::clock::Clock;
use crate::codec::{self, MSS};
use crate::conn::{Connection, Dual, Quad};
use crate::net::Network;

type AcceptCallback = Box<dyn FnMut(Rc<RefCell<Connection>>)>;
type IssSource = Box<dyn FnMut() -> u32>;

/// Spec §4.1/§9: `iss` must be pseudorandom in `[0, 65535]` — a test-harness
/// constraint, not a protocol requirement, so draw from the 16-bit range
/// rather than a full `u32`.
fn random_iss() -> u32 {
    rand::thread_rng().gen::<u16>() as u32
}

/// Demultiplexes inbound segments for one bound port, spawning a
/// [`Connection`] for each new peer.
pub struct Listener {
    port: u16,
    network: Rc<dyn Network>,
    clock: Rc<dyn Clock>,
    mss: u16,
    connections: HashMap<Quad, Rc<RefCell<Connection>>>,
    accept_callback: Option<AcceptCallback>,
    iss_source: IssSource,
}

impl Listener {
    pub fn new(network: Rc<dyn Network>, clock: Rc<dyn Clock>, port: u16) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Listener {
            port,
            network,
            clock,
            mss: MSS,
            connections: HashMap::new(),
            accept_callback: None,
            iss_source: Box::new(random_iss),
        }))
    }

    /// Overrides the MSS new connections are accepted with. Production code
    /// never needs this (the default comes from [`codec::MSS`]); tests use
    /// it to exercise cwnd behavior at a small, convenient chunk size.
    pub fn set_mss(&mut self, mss: u16) {
        self.mss = mss;
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registers the callback invoked once per newly accepted connection,
    /// immediately after its SYN+ACK has been sent.
    pub fn set_accept_callback(&mut self, f: impl FnMut(Rc<RefCell<Connection>>) + 'static) {
        self.accept_callback = Some(Box::new(f));
    }

    /// Overrides how initial sequence numbers are chosen. Production code
    /// never needs this (the default draws from [`rand`]); tests use it to
    /// pin `iss` to a known value.
    pub fn set_iss_source(&mut self, f: impl FnMut() -> u32 + 'static) {
        self.iss_source = Box::new(f);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Feeds one inbound IPv4-decapsulated segment to the listener (spec
    /// §4.1 steps 1-7).
    pub fn on_datagram(&mut self, src: Ipv4Addr, dst: Ipv4Addr, raw: &[u8]) {
        let seg = match codec::decode(raw) {
            Ok(seg) => seg,
            Err(err) => {
                tracing::debug!(%err, "dropping malformed segment");
                return;
            }
        };

        if seg.dst_port != self.port {
            return;
        }

        if !self.network.ignore_checksum() && !codec::verify_checksum(raw, src, dst) {
            tracing::warn!(src_port = seg.src_port, "dropping segment with bad checksum");
            return;
        }

        let id = Quad {
            peer: Dual { addr: src, port: seg.src_port },
            local: Dual { addr: dst, port: seg.dst_port },
        };

        if seg.flags.syn {
            self.on_syn(id, seg.seq_no);
            return;
        }

        match self.connections.get(&id) {
            Some(conn) => conn.borrow_mut().on_segment(seg.seq_no, seg.ack_no, seg.flags, &seg.payload),
            None => tracing::debug!(?id, "dropping segment for unknown connection"),
        }
    }

    fn on_syn(&mut self, id: Quad, client_isn: u32) {
        if self.connections.contains_key(&id) {
            tracing::debug!(?id, "dropping duplicate SYN for existing connection");
            return;
        }

        let iss = (self.iss_source)();
        let conn = Connection::accept(id, iss, client_isn, self.network.clone(), self.clock.clone(), self.mss);
        let conn = Rc::new(RefCell::new(conn));
        self.connections.insert(id, conn.clone());

        tracing::debug!(?id, iss, "accepted new connection");

        if let Some(cb) = self.accept_callback.as_mut() {
            cb(conn);
        }
    }

    /// Fires any due retransmission timers, then reaps connections that
    /// have reached `CLOSED`.
    pub fn on_tick(&mut self, now: Instant) {
        for conn in self.connections.values() {
            if conn.borrow().timer_due(now) {
                conn.borrow_mut().on_timeout();
            }
        }
        self.connections.retain(|_, conn| !conn.borrow().is_closed());
    }
}
