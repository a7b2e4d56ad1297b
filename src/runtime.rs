//! The single-threaded cooperative event loop (spec §5): one iteration
//! polls the network for at most one inbound datagram and then gives every
//! connection a chance to notice an expired retransmission timer. No
//! internal locking — handlers run to completion before the next poll.
//!
//! The network's own `poll` does the waiting; the listener owns
//! demultiplexing and dispatch once a datagram arrives.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Clock;
use crate::listener::Listener;
use crate::net::Network;

/// Wires a [`Network`] to a [`Listener`], registering the receive callback
/// and driving timer expiry on each loop iteration.
pub struct Runtime {
    network: Rc<dyn Network>,
    clock: Rc<dyn Clock>,
    listener: Rc<RefCell<Listener>>,
}

impl Runtime {
    pub fn new(network: Rc<dyn Network>, clock: Rc<dyn Clock>, port: u16) -> Self {
        let listener = Listener::new(network.clone(), clock.clone(), port);

        let listener_for_cb = listener.clone();
        network.register_receiver(Box::new(move |src, dst, bytes| {
            listener_for_cb.borrow_mut().on_datagram(src, dst, &bytes);
        }));

        Runtime { network, clock, listener }
    }

    pub fn listener(&self) -> Rc<RefCell<Listener>> {
        self.listener.clone()
    }

    /// Runs one iteration: wait up to `poll_timeout` for a datagram, then
    /// service due timers.
    pub fn run_once(&self, poll_timeout: Duration) {
        self.network.poll(poll_timeout);
        self.listener.borrow_mut().on_tick(self.clock.now());
    }

    /// Runs forever, polling with a fixed cadence so timers are serviced
    /// promptly even when the network is idle.
    pub fn run(&self, poll_timeout: Duration) -> ! {
        loop {
            self.run_once(poll_timeout);
        }
    }
}
