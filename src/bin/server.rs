//! A standalone server binary: binds a TUN device, listens on one port, and
//! echoes back whatever each connected peer sends until it closes.

use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use tcpd::clock::SystemClock;
use tcpd::net::TunNetwork;
use tcpd::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(about = "A passive-open TCP-compatible echo server")]
struct Cli {
    /// TUN device name to create and bind.
    #[arg(long, default_value = "tun0")]
    device: String,

    /// Local IPv4 address to assign to the TUN device.
    #[arg(long, default_value = "10.10.10.10")]
    addr: Ipv4Addr,

    /// Netmask to assign to the TUN device.
    #[arg(long, default_value = "255.255.255.0")]
    netmask: Ipv4Addr,

    /// TCP port to listen on.
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// Skip checksum verification on inbound segments.
    #[arg(long)]
    ignore_checksum: bool,

    /// Idle poll timeout, in milliseconds.
    #[arg(long, default_value_t = 50)]
    poll_timeout_ms: u64,
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let network = TunNetwork::new(&cli.device, cli.addr, cli.netmask)
        .expect("failed to bring up tun device")
        .with_ignore_checksum(cli.ignore_checksum);
    let network: Rc<dyn tcpd::net::Network> = Rc::new(network);
    let clock = Rc::new(SystemClock);

    let runtime = Runtime::new(network, clock, cli.port);
    runtime.listener().borrow_mut().set_accept_callback(|conn| {
        tracing::info!(id = ?conn.borrow().id, "accepted connection");

        conn.borrow_mut().set_receive_callback(|conn, payload| {
            if payload.is_empty() {
                tracing::info!("peer closed its side");
                conn.close();
            } else {
                conn.send(payload);
            }
        });
    });

    tracing::info!(port = cli.port, device = %cli.device, "listening");
    runtime.run(Duration::from_millis(cli.poll_timeout_ms));
}
