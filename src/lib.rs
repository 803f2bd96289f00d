//! `tuntcp` — a minimal user-space TCP/IPv4 stack on a Linux tun device.
//!
//! # Architecture
//!
//! ```text
//!  kernel tun device
//!       │ raw IP datagrams
//!  ┌────▼───────┐  bounded queues  ┌──────────┐  IpPacket  ┌───────────┐
//!  │ NetDevice  │─────────────────▶│ IpQueue  │───────────▶│ TcpEngine │──▶ accept()
//!  │ (ingress / │◀─────────────────│ (codec + │◀───────────│ (table +  │
//!  │  egress)   │                  │  queues) │  segments  │  FSM)     │
//!  └────────────┘                  └──────────┘            └───────────┘
//! ```
//!
//! Each stage runs its own workers and hands whole packets to the next one
//! through a bounded channel; closing the device cancels every worker.
//!
//! Each module has a single responsibility:
//! - [`packet`]   — the owned buffer moved between stages
//! - [`checksum`] — the one's-complement sum both codecs share
//! - [`device`]   — tun I/O behind bounded ingress/egress queues
//! - [`ipv4`]     — IPv4 header codec and the IP-layer queue pair
//! - [`tcp`]      — TCP header codec and the pseudo-header checksum
//! - [`conn`]     — connection state and the mutexed table
//! - [`engine`]   — the receive-driven state machine and the accept queue
//! - [`error`]    — the stack-wide error taxonomy

pub mod checksum;
pub mod conn;
pub mod device;
pub mod engine;
pub mod error;
pub mod ipv4;
pub mod packet;
pub mod tcp;

pub use conn::{Connection, State};
pub use device::{DeviceHandle, NetDevice};
pub use engine::TcpEngine;
pub use error::StackError;
pub use ipv4::{IpPacket, IpQueue, Ipv4Header};
pub use packet::{Packet, PACKET_SIZE};
pub use tcp::{TcpFlags, TcpHeader, TcpPacket};
