//! IPv4 header codec and the IP-layer queue pair.
//!
//! The ingress worker pulls raw packets off the device, decodes the fixed
//! 20-byte header, and hands [`IpPacket`]s upward; the egress worker forwards
//! fully-serialized datagrams down to the device queue. Malformed datagrams
//! are logged and dropped without stalling the pipeline.

use tokio::sync::{mpsc, watch};

use crate::checksum::checksum;
use crate::device::{NetDevice, QUEUE_SIZE};
use crate::error::StackError;
use crate::packet::Packet;

/// Fixed IPv4 header length; options are unsupported.
pub const IP_HEADER_LEN: usize = 20;
/// IANA protocol number for TCP.
pub const TCP_PROTOCOL: u8 = 6;

const IP_VERSION_4: u8 = 4;
/// Header length in 32-bit words.
const IHL: u8 = 5;
/// Don't-fragment, as the 3-bit flags field (byte 6 = 0x40 on the wire).
const FLAG_DF: u8 = 0b010;
const TTL: u8 = 64;

// ---------------------------------------------------------------------------
// Ipv4Header
// ---------------------------------------------------------------------------

/// Decoded form of the first 20 bytes of an IPv4 datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in 32-bit words.
    pub ihl: u8,
    pub tos: u8,
    /// Length of header plus payload.
    pub total_length: u16,
    pub id: u16,
    /// 3-bit flags field (reserved, DF, MF).
    pub flags: u8,
    /// 13-bit fragment offset.
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
}

impl Ipv4Header {
    /// Header for an outbound TCP datagram carrying `payload_len` bytes
    /// after the IP header.
    pub fn new(src_ip: [u8; 4], dst_ip: [u8; 4], payload_len: usize) -> Self {
        Self {
            version: IP_VERSION_4,
            ihl: IHL,
            tos: 0,
            total_length: (IP_HEADER_LEN + payload_len) as u16,
            id: 0,
            flags: FLAG_DF,
            fragment_offset: 0,
            ttl: TTL,
            protocol: TCP_PROTOCOL,
            checksum: 0,
            src_ip,
            dst_ip,
        }
    }

    /// Decode the first 20 bytes of `pkt`.
    pub fn unmarshal(pkt: &[u8]) -> Result<Self, StackError> {
        if pkt.len() < IP_HEADER_LEN {
            return Err(StackError::BadHeader(format!(
                "ip datagram too short: {} bytes",
                pkt.len()
            )));
        }
        let version = pkt[0] >> 4;
        let ihl = pkt[0] & 0x0f;
        if version != IP_VERSION_4 {
            return Err(StackError::BadHeader(format!("ip version {version}")));
        }
        if ihl < IHL {
            return Err(StackError::BadHeader(format!("ip ihl {ihl}")));
        }

        let mut src_ip = [0u8; 4];
        let mut dst_ip = [0u8; 4];
        src_ip.copy_from_slice(&pkt[12..16]);
        dst_ip.copy_from_slice(&pkt[16..20]);

        Ok(Self {
            version,
            ihl,
            tos: pkt[1],
            total_length: u16::from_be_bytes([pkt[2], pkt[3]]),
            id: u16::from_be_bytes([pkt[4], pkt[5]]),
            flags: pkt[6] >> 5,
            fragment_offset: u16::from_be_bytes([pkt[6], pkt[7]]) & 0x1fff,
            ttl: pkt[8],
            protocol: pkt[9],
            checksum: u16::from_be_bytes([pkt[10], pkt[11]]),
            src_ip,
            dst_ip,
        })
    }

    /// Encode to the fixed 20-byte wire form, computing the header checksum.
    ///
    /// The checksum bytes stay zero until after the sum, so re-marshaling a
    /// header can never fold a stale checksum into the new one.
    pub fn marshal(&mut self) -> Vec<u8> {
        let mut pkt = vec![0u8; IP_HEADER_LEN];
        pkt[0] = (self.version << 4) | self.ihl;
        pkt[1] = self.tos;
        pkt[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        pkt[4..6].copy_from_slice(&self.id.to_be_bytes());
        let flags_frag = (u16::from(self.flags) << 13) | self.fragment_offset;
        pkt[6..8].copy_from_slice(&flags_frag.to_be_bytes());
        pkt[8] = self.ttl;
        pkt[9] = self.protocol;
        pkt[12..16].copy_from_slice(&self.src_ip);
        pkt[16..20].copy_from_slice(&self.dst_ip);

        self.checksum = checksum(&pkt);
        pkt[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        pkt
    }
}

/// A parsed datagram: the decoded header plus the owning buffer. The payload
/// spans `ihl * 4 .. len`.
#[derive(Debug, Clone)]
pub struct IpPacket {
    pub header: Ipv4Header,
    pub packet: Packet,
}

// ---------------------------------------------------------------------------
// IpQueue
// ---------------------------------------------------------------------------

/// Clonable egress handle to a managed [`IpQueue`].
#[derive(Clone)]
pub struct IpSender {
    outgoing_tx: mpsc::Sender<Packet>,
}

impl IpSender {
    /// Enqueue a fully-serialized IP datagram for the device.
    pub async fn write(&self, pkt: Packet) -> Result<(), StackError> {
        self.outgoing_tx
            .send(pkt)
            .await
            .map_err(|_| StackError::DeviceClosed)
    }
}

/// The IP layer: demultiplexes IPv4 out of the raw device stream and
/// re-multiplexes outbound datagrams onto it.
pub struct IpQueue {
    incoming_tx: Option<mpsc::Sender<IpPacket>>,
    incoming_rx: mpsc::Receiver<IpPacket>,
    outgoing_tx: mpsc::Sender<Packet>,
    outgoing_rx: Option<mpsc::Receiver<Packet>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl IpQueue {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(QUEUE_SIZE);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(QUEUE_SIZE);
        Self {
            incoming_tx: Some(incoming_tx),
            incoming_rx,
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
            cancel: None,
        }
    }

    /// Start the two IP workers over a bound device. The ingress worker owns
    /// the device from here on.
    pub fn manage(&mut self, mut device: NetDevice) {
        let (Some(incoming_tx), Some(mut outgoing_rx)) =
            (self.incoming_tx.take(), self.outgoing_rx.take())
        else {
            log::warn!("ip queue is already managed");
            return;
        };
        let cancel = device.cancellation();
        self.cancel = Some(cancel.clone());
        let handle = device.handle();

        let mut ingress_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ingress_cancel.changed() => {
                        log::debug!("ip ingress: shutting down");
                        return;
                    }
                    pkt = device.read_packet() => {
                        let pkt = match pkt {
                            Ok(pkt) => pkt,
                            Err(e) => {
                                log::debug!("ip ingress: {e}");
                                return;
                            }
                        };
                        let header = match Ipv4Header::unmarshal(pkt.bytes()) {
                            Ok(header) => header,
                            Err(e) => {
                                log::warn!("dropping datagram: {e}");
                                continue;
                            }
                        };
                        if incoming_tx.send(IpPacket { header, packet: pkt }).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let mut egress_cancel = cancel;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = egress_cancel.changed() => {
                        log::debug!("ip egress: shutting down");
                        return;
                    }
                    pkt = outgoing_rx.recv() => {
                        let Some(pkt) = pkt else { return };
                        if let Err(e) = handle.write_packet(pkt).await {
                            log::warn!("ip egress: {e}");
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Next parsed datagram from the device.
    pub async fn read(&mut self) -> Result<IpPacket, StackError> {
        self.incoming_rx.recv().await.ok_or(StackError::DeviceClosed)
    }

    /// Enqueue a fully-serialized IP datagram for the device.
    pub async fn write(&self, pkt: Packet) -> Result<(), StackError> {
        self.outgoing_tx
            .send(pkt)
            .await
            .map_err(|_| StackError::DeviceClosed)
    }

    /// Clonable egress handle, usable after the queue itself has been handed
    /// to the next layer.
    pub fn sender(&self) -> IpSender {
        IpSender {
            outgoing_tx: self.outgoing_tx.clone(),
        }
    }

    /// The device's cancellation signal; `None` until
    /// [`manage`](Self::manage) has run.
    pub(crate) fn cancellation(&self) -> Option<watch::Receiver<bool>> {
        self.cancel.clone()
    }
}

impl Default for IpQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Ipv4Header {
        let mut h = Ipv4Header::new([10, 0, 0, 2], [10, 0, 0, 1], 24);
        h.tos = 0xa0;
        h.id = 0xbeef;
        h.fragment_offset = 0x123;
        h.ttl = 32;
        h
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let mut h = sample_header();
        let bytes = h.marshal();
        let decoded = Ipv4Header::unmarshal(&bytes).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn marshaled_checksum_verifies() {
        let bytes = sample_header().marshal();
        assert_eq!(checksum(&bytes), 0);
    }

    #[test]
    fn remarshal_is_stable() {
        let mut h = sample_header();
        let first = h.marshal();
        let second = h.marshal();
        assert_eq!(first, second);
    }

    #[test]
    fn constructor_defaults() {
        let mut h = Ipv4Header::new([192, 168, 0, 1], [192, 168, 0, 2], 100);
        assert_eq!(h.version, 4);
        assert_eq!(h.ihl, 5);
        assert_eq!(h.total_length, 120);
        assert_eq!(h.ttl, 64);
        assert_eq!(h.protocol, TCP_PROTOCOL);
        assert_eq!(h.flags, 0b010);

        // The DF bit lands in byte 6.
        let bytes = h.marshal();
        assert_eq!(bytes[6], 0x40);
        assert_eq!(bytes[7], 0x00);
    }

    #[test]
    fn short_datagram_is_rejected() {
        let err = Ipv4Header::unmarshal(&[0x45; 19]).unwrap_err();
        assert!(matches!(err, StackError::BadHeader(_)));
    }

    #[test]
    fn version_six_is_rejected() {
        let mut bytes = sample_header().marshal();
        bytes[0] = 0x65;
        assert!(matches!(
            Ipv4Header::unmarshal(&bytes),
            Err(StackError::BadHeader(_))
        ));
    }

    #[test]
    fn truncated_header_length_is_rejected() {
        let mut bytes = sample_header().marshal();
        bytes[0] = 0x44;
        assert!(matches!(
            Ipv4Header::unmarshal(&bytes),
            Err(StackError::BadHeader(_))
        ));
    }
}
