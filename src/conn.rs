//! Connection state and the mutexed connection table.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::Rng;

use crate::tcp::TcpPacket;

/// Server-side states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for a connection request.
    Listen,
    /// SYN seen and SYN|ACK sent; waiting for the handshake ACK.
    SynReceived,
    /// Handshake complete; data may flow.
    Established,
    /// Peer FIN received; local close pending.
    CloseWait,
    /// FIN|ACK sent; waiting for the final ACK.
    LastAck,
    /// Terminal; the table entry is removed on reaching this state.
    Closed,
}

/// One entry of the connection table.
///
/// `src_port` is the local port (the incoming segment's destination port)
/// and `dst_port` the remote port. Snapshots of entries travel through the
/// accept queue; the authoritative copy lives in [`ConnectionTable`].
#[derive(Debug, Clone)]
pub struct Connection {
    pub src_port: u16,
    pub dst_port: u16,
    pub state: State,
    /// Most recently received segment on this flow.
    pub pkt: TcpPacket,
    pub(crate) initial_seq_num: u32,
    pub(crate) increment_seq_num: u32,
    pub(crate) is_accept: bool,
}

impl Connection {
    /// The application bytes of the segment cached on this snapshot.
    pub fn payload(&self) -> &[u8] {
        self.pkt.payload()
    }
}

/// All live flows, keyed by (local port, remote port), behind a single
/// mutex. Peer addresses are not part of the key, so two peers sharing an
/// ephemeral port toward the same local port alias to one flow.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<(u16, u16), Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(pkt: &TcpPacket) -> (u16, u16) {
        (pkt.tcp_header.dst_port, pkt.tcp_header.src_port)
    }

    /// Snapshot of the flow this segment belongs to, if present.
    pub fn find(&self, pkt: &TcpPacket) -> Option<Connection> {
        self.connections.lock().unwrap().get(&Self::key(pkt)).cloned()
    }

    /// Register a new flow for this segment, starting in
    /// [`State::SynReceived`] with a random initial sequence number.
    pub fn add(&self, pkt: TcpPacket) -> Connection {
        let conn = Connection {
            src_port: pkt.tcp_header.dst_port,
            dst_port: pkt.tcp_header.src_port,
            state: State::SynReceived,
            pkt,
            initial_seq_num: rand::rng().random(),
            increment_seq_num: 0,
            is_accept: false,
        };
        self.connections
            .lock()
            .unwrap()
            .insert((conn.src_port, conn.dst_port), conn.clone());
        conn
    }

    /// Drop the given flow.
    pub fn remove(&self, conn: &Connection) {
        self.connections
            .lock()
            .unwrap()
            .remove(&(conn.src_port, conn.dst_port));
    }

    /// Replace the cached segment on an existing flow.
    pub fn refresh_packet(&self, pkt: &TcpPacket) {
        if let Some(conn) = self.connections.lock().unwrap().get_mut(&Self::key(pkt)) {
            conn.pkt = pkt.clone();
        }
    }

    /// Move the flow this segment belongs to into `state`.
    pub fn update_state(&self, pkt: &TcpPacket, state: State, is_accept: bool) {
        if let Some(conn) = self.connections.lock().unwrap().get_mut(&Self::key(pkt)) {
            conn.state = state;
            conn.is_accept = is_accept;
        }
    }

    /// Advance the flow's consumed sequence space by `increment`.
    pub fn update_seq_num(&self, pkt: &TcpPacket, increment: u32) {
        if let Some(conn) = self.connections.lock().unwrap().get_mut(&Self::key(pkt)) {
            conn.increment_seq_num = conn.increment_seq_num.wrapping_add(increment);
        }
    }

    /// Number of live flows.
    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::Ipv4Header;
    use crate::packet::Packet;
    use crate::tcp::{TcpFlags, TcpHeader, TCP_HEADER_LEN};

    /// An inbound segment from peer port 40000 to local port 80.
    fn segment(flags: TcpFlags, seq: u32) -> TcpPacket {
        let mut ip = Ipv4Header::new([10, 0, 0, 2], [10, 0, 0, 1], TCP_HEADER_LEN);
        let mut tcp = TcpHeader::new(40000, 80, seq, 0, flags);
        let mut buf = ip.marshal();
        buf.extend_from_slice(&tcp.marshal(&ip, &[]));
        TcpPacket {
            ip_header: Ipv4Header::unmarshal(&buf).unwrap(),
            tcp_header: TcpHeader::unmarshal(&buf[20..]).unwrap(),
            packet: Packet::from_vec(buf),
        }
    }

    #[test]
    fn add_swaps_ports_into_local_perspective() {
        let table = ConnectionTable::new();
        let conn = table.add(segment(TcpFlags::default(), 1));
        assert_eq!(conn.src_port, 80);
        assert_eq!(conn.dst_port, 40000);
        assert_eq!(conn.state, State::SynReceived);
        assert_eq!(conn.increment_seq_num, 0);
        assert!(!conn.is_accept);
    }

    #[test]
    fn find_matches_follow_up_segments_of_the_same_flow() {
        let table = ConnectionTable::new();
        table.add(segment(TcpFlags::default(), 1));
        assert!(table.find(&segment(TcpFlags::ack(), 2)).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn find_misses_unknown_flows() {
        let table = ConnectionTable::new();
        table.add(segment(TcpFlags::default(), 1));

        let mut other = segment(TcpFlags::default(), 1);
        other.tcp_header.src_port = 40001;
        assert!(table.find(&other).is_none());
    }

    #[test]
    fn remove_clears_the_entry() {
        let table = ConnectionTable::new();
        let conn = table.add(segment(TcpFlags::default(), 1));
        assert_eq!(table.len(), 1);
        table.remove(&conn);
        assert!(table.is_empty());
    }

    #[test]
    fn update_state_mutates_in_place() {
        let table = ConnectionTable::new();
        let pkt = segment(TcpFlags::default(), 1);
        table.add(pkt.clone());
        table.update_state(&pkt, State::Established, true);

        let conn = table.find(&pkt).unwrap();
        assert_eq!(conn.state, State::Established);
        assert!(conn.is_accept);
    }

    #[test]
    fn update_seq_num_accumulates_and_wraps() {
        let table = ConnectionTable::new();
        let pkt = segment(TcpFlags::default(), 1);
        table.add(pkt.clone());
        table.update_seq_num(&pkt, u32::MAX);
        table.update_seq_num(&pkt, 2);
        assert_eq!(table.find(&pkt).unwrap().increment_seq_num, 1);
    }

    #[test]
    fn refresh_packet_replaces_the_cached_segment() {
        let table = ConnectionTable::new();
        table.add(segment(TcpFlags::default(), 1));
        let newer = segment(TcpFlags::ack(), 99);
        table.refresh_packet(&newer);
        assert_eq!(table.find(&newer).unwrap().pkt.tcp_header.seq_num, 99);
    }
}
