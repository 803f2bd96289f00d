//! Entry point: assemble the stack on a real tun device and log every
//! accepted connection.
//!
//! Requires root (the tun device is created at startup). Point a peer at the
//! interface, e.g. `ncat 10.0.0.1 80` from the host, and send a few bytes.

use std::net::Ipv4Addr;

use anyhow::Result;
use clap::Parser;

use tuntcp::{IpQueue, NetDevice, TcpEngine};

/// A minimal user-space TCP/IPv4 stack on a tun device.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address assigned to the tun interface.
    #[arg(long, default_value = "10.0.0.1")]
    address: Ipv4Addr,

    /// Netmask of the tun interface.
    #[arg(long, default_value = "255.255.255.0")]
    netmask: Ipv4Addr,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    let mut device = NetDevice::open(cli.address, cli.netmask)?;
    device.bind();

    let mut ip = IpQueue::new();
    ip.manage(device);

    let mut engine = TcpEngine::new();
    engine.manage(ip);

    log::info!("stack is up on {}", cli.address);

    loop {
        let conn = engine.accept().await?;
        log::info!(
            "accepted connection on port {} from peer port {} ({} flows tracked): {:?}",
            conn.src_port,
            conn.dst_port,
            engine.connection_count(),
            String::from_utf8_lossy(conn.payload()),
        );
    }
}
