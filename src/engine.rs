//! The TCP engine: the receive-driven state machine, segment synthesis, and
//! the accept queue.
//!
//! One receive loop drains the IP layer and dispatches each segment against
//! the connection table; one egress loop forwards synthesized segments back
//! down. Connections become visible to [`TcpEngine::accept`] once a PSH has
//! been observed on an established flow.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::conn::{Connection, ConnectionTable, State};
use crate::error::StackError;
use crate::ipv4::{IpQueue, Ipv4Header, TCP_PROTOCOL};
use crate::packet::Packet;
use crate::tcp::{TcpFlags, TcpHeader, TcpPacket, TCP_HEADER_LEN};

/// Capacity of the engine's outbound and accept queues.
pub const ENGINE_QUEUE_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// TcpEngine
// ---------------------------------------------------------------------------

/// The top of the stack: owns the connection table and the accept queue.
pub struct TcpEngine {
    table: Arc<ConnectionTable>,
    out_tx: mpsc::Sender<Packet>,
    out_rx: Option<mpsc::Receiver<Packet>>,
    accept_tx: Option<mpsc::Sender<Connection>>,
    accept_rx: mpsc::Receiver<Connection>,
}

impl TcpEngine {
    pub fn new() -> Self {
        let (out_tx, out_rx) = mpsc::channel(ENGINE_QUEUE_SIZE);
        let (accept_tx, accept_rx) = mpsc::channel(ENGINE_QUEUE_SIZE);
        Self {
            table: Arc::new(ConnectionTable::new()),
            out_tx,
            out_rx: Some(out_rx),
            accept_tx: Some(accept_tx),
            accept_rx,
        }
    }

    /// Start the receive and egress workers over a managed IP queue. The
    /// receive loop owns the queue from here on.
    pub fn manage(&mut self, mut ip: IpQueue) {
        let (Some(accept_tx), Some(mut out_rx), Some(cancel)) = (
            self.accept_tx.take(),
            self.out_rx.take(),
            ip.cancellation(),
        ) else {
            log::warn!("tcp engine is already managed or the ip queue is not");
            return;
        };
        let ip_sender = ip.sender();
        let inner = EngineInner {
            table: Arc::clone(&self.table),
            out_tx: self.out_tx.clone(),
            accept_tx,
        };

        let mut rx_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx_cancel.changed() => {
                        log::debug!("tcp receive loop: shutting down");
                        return;
                    }
                    ip_pkt = ip.read() => {
                        let ip_pkt = match ip_pkt {
                            Ok(p) => p,
                            Err(e) => {
                                log::debug!("tcp receive loop: {e}");
                                return;
                            }
                        };
                        if ip_pkt.header.protocol != TCP_PROTOCOL {
                            log::debug!("ignoring protocol {}", ip_pkt.header.protocol);
                            continue;
                        }
                        let ip_len = usize::from(ip_pkt.header.ihl) * 4;
                        if ip_len > ip_pkt.packet.len {
                            log::warn!("dropping segment: ip header exceeds datagram");
                            continue;
                        }
                        let tcp_header =
                            match TcpHeader::unmarshal(&ip_pkt.packet.buf[ip_len..ip_pkt.packet.len]) {
                                Ok(h) => h,
                                Err(e) => {
                                    log::warn!("dropping segment: {e}");
                                    continue;
                                }
                            };
                        inner
                            .recv(TcpPacket {
                                ip_header: ip_pkt.header,
                                tcp_header,
                                packet: ip_pkt.packet,
                            })
                            .await;
                    }
                }
            }
        });

        let mut tx_cancel = cancel;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx_cancel.changed() => {
                        log::debug!("tcp egress loop: shutting down");
                        return;
                    }
                    pkt = out_rx.recv() => {
                        let Some(pkt) = pkt else { return };
                        if let Err(e) = ip_sender.write(pkt).await {
                            log::warn!("tcp egress: {e}");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Next established, data-bearing connection.
    pub async fn accept(&mut self) -> Result<Connection, StackError> {
        self.accept_rx.recv().await.ok_or(StackError::AcceptClosed)
    }

    /// Synthesize and enqueue a segment on `conn` toward its peer.
    pub async fn write(
        &self,
        conn: &Connection,
        flags: TcpFlags,
        data: &[u8],
    ) -> Result<(), StackError> {
        write_segment(&self.table, &self.out_tx, conn, flags, data).await
    }

    /// Number of flows currently tracked.
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }
}

impl Default for TcpEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Receive dispatch
// ---------------------------------------------------------------------------

struct EngineInner {
    table: Arc<ConnectionTable>,
    out_tx: mpsc::Sender<Packet>,
    accept_tx: mpsc::Sender<Connection>,
}

impl EngineInner {
    /// Run one inbound segment through the state machine.
    ///
    /// Every branch tests the state observed at lookup time, so a segment
    /// never matches a row that its own handling just created: the ACK
    /// carried by a peer's FIN|ACK must not count as the final ACK of the
    /// close that same segment triggers.
    async fn recv(&self, pkt: TcpPacket) {
        let found = self.table.find(&pkt);
        let is_new = found.is_none();
        let conn = match found {
            Some(mut conn) => {
                self.table.refresh_packet(&pkt);
                conn.pkt = pkt.clone();
                conn
            }
            None => self.table.add(pkt.clone()),
        };
        let prior = conn.state;
        let flags = pkt.tcp_header.flags;
        let (src, dst) = (pkt.tcp_header.src_port, pkt.tcp_header.dst_port);

        if flags.syn && is_new {
            log::info!("recv SYN, src port: {src}, dst port: {dst}");
            self.table.update_state(&pkt, State::SynReceived, false);
            self.write(&conn, TcpFlags::syn_ack(), &[]).await;
        }

        if !is_new && flags.ack && prior == State::SynReceived {
            log::info!("recv ACK, src port: {src}, dst port: {dst}");
            self.table.update_state(&pkt, State::Established, false);
        }

        if !is_new && flags.psh && prior == State::Established {
            log::info!("recv PSH, src port: {src}, dst port: {dst}");
            self.table.update_state(&pkt, State::Established, true);
            if self.accept_tx.send(conn.clone()).await.is_err() {
                log::warn!("accept queue closed; dropping connection");
            }
        }

        if !is_new && flags.fin && prior == State::Established {
            log::info!("recv FIN, src port: {src}, dst port: {dst}");
            self.table.update_state(&pkt, State::CloseWait, false);
            self.write(&conn, TcpFlags::ack(), &[]).await;
            self.table.update_state(&pkt, State::LastAck, false);
            self.write(&conn, TcpFlags::fin_ack(), &[]).await;
        }

        if !is_new && flags.ack && prior == State::LastAck {
            log::info!("recv last ACK, src port: {src}, dst port: {dst}");
            self.table.update_state(&pkt, State::Closed, false);
            self.table.remove(&conn);
        }
    }

    async fn write(&self, conn: &Connection, flags: TcpFlags, data: &[u8]) {
        if let Err(e) = write_segment(&self.table, &self.out_tx, conn, flags, data).await {
            log::warn!("failed to enqueue segment: {e}");
        }
    }
}

/// Build and enqueue one outbound segment, advancing the flow's consumed
/// sequence space by the payload length plus one for SYN and one for FIN.
async fn write_segment(
    table: &ConnectionTable,
    out_tx: &mpsc::Sender<Packet>,
    conn: &Connection,
    flags: TcpFlags,
    data: &[u8],
) -> Result<(), StackError> {
    let pkt = &conn.pkt;

    // An empty incoming payload (SYN, FIN, bare ACK) is acknowledged as one
    // phantom byte; a data-bearing one by the length of this reply.
    let ack_increment = if pkt.payload_len() == 0 {
        1
    } else {
        data.len() as u32
    };
    let ack_num = pkt.tcp_header.seq_num.wrapping_add(ack_increment);
    let seq_num = conn.initial_seq_num.wrapping_add(conn.increment_seq_num);

    let mut ip_header = Ipv4Header::new(
        pkt.ip_header.dst_ip,
        pkt.ip_header.src_ip,
        TCP_HEADER_LEN + data.len(),
    );
    let mut tcp_header = TcpHeader::new(
        pkt.tcp_header.dst_port,
        pkt.tcp_header.src_port,
        seq_num,
        ack_num,
        flags,
    );

    let mut out = ip_header.marshal();
    out.extend_from_slice(&tcp_header.marshal(&ip_header, data));
    out.extend_from_slice(data);

    let mut seq_increment = data.len() as u32;
    if flags.syn {
        seq_increment += 1;
    }
    if flags.fin {
        seq_increment += 1;
    }
    table.update_seq_num(pkt, seq_increment);

    out_tx
        .send(Packet::from_vec(out))
        .await
        .map_err(|_| StackError::DeviceClosed)
}
