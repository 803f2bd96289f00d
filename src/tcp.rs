//! TCP header codec: the flag byte, the fixed 20-byte layout, and the
//! pseudo-header checksum.
//!
//! Options are never emitted and never parsed, but their bytes are accounted
//! for through `data_offset` when locating the payload of an inbound
//! segment.

use crate::checksum::checksum;
use crate::error::StackError;
use crate::ipv4::{Ipv4Header, TCP_PROTOCOL};
use crate::packet::Packet;

/// Fixed TCP header length; options are never emitted.
pub const TCP_HEADER_LEN: usize = 20;
/// Static advertised receive window.
pub const WINDOW_SIZE: u16 = 65535;

/// The eight TCP flag bits as independent booleans.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcpFlags {
    pub cwr: bool,
    pub ece: bool,
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

impl TcpFlags {
    /// Unpack byte 13 of the header.
    pub fn from_byte(b: u8) -> Self {
        Self {
            cwr: b & 0x80 != 0,
            ece: b & 0x40 != 0,
            urg: b & 0x20 != 0,
            ack: b & 0x10 != 0,
            psh: b & 0x08 != 0,
            rst: b & 0x04 != 0,
            syn: b & 0x02 != 0,
            fin: b & 0x01 != 0,
        }
    }

    /// Pack into byte 13 of the header.
    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.cwr {
            b |= 0x80;
        }
        if self.ece {
            b |= 0x40;
        }
        if self.urg {
            b |= 0x20;
        }
        if self.ack {
            b |= 0x10;
        }
        if self.psh {
            b |= 0x08;
        }
        if self.rst {
            b |= 0x04;
        }
        if self.syn {
            b |= 0x02;
        }
        if self.fin {
            b |= 0x01;
        }
        b
    }

    /// SYN|ACK, the handshake reply.
    pub fn syn_ack() -> Self {
        Self {
            syn: true,
            ack: true,
            ..Self::default()
        }
    }

    /// Bare ACK.
    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Self::default()
        }
    }

    /// FIN|ACK, the passive-close reply.
    pub fn fin_ack() -> Self {
        Self {
            fin: true,
            ack: true,
            ..Self::default()
        }
    }
}

/// Decoded form of the first 20 bytes of a TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Header length in 32-bit words; always 5 on egress.
    pub data_offset: u8,
    /// Low reserved bits of byte 12, kept but never acted on.
    pub reserved: u8,
    pub flags: TcpFlags,
    pub window: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
}

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16, seq_num: u32, ack_num: u32, flags: TcpFlags) -> Self {
        Self {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            data_offset: (TCP_HEADER_LEN / 4) as u8,
            reserved: 0,
            flags,
            window: WINDOW_SIZE,
            checksum: 0,
            urgent_pointer: 0,
        }
    }

    /// Decode the first 20 bytes of `pkt`.
    pub fn unmarshal(pkt: &[u8]) -> Result<Self, StackError> {
        if pkt.len() < TCP_HEADER_LEN {
            return Err(StackError::BadHeader(format!(
                "tcp segment too short: {} bytes",
                pkt.len()
            )));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([pkt[0], pkt[1]]),
            dst_port: u16::from_be_bytes([pkt[2], pkt[3]]),
            seq_num: u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]),
            ack_num: u32::from_be_bytes([pkt[8], pkt[9], pkt[10], pkt[11]]),
            data_offset: pkt[12] >> 4,
            reserved: pkt[12] & 0x0e,
            flags: TcpFlags::from_byte(pkt[13]),
            window: u16::from_be_bytes([pkt[14], pkt[15]]),
            checksum: u16::from_be_bytes([pkt[16], pkt[17]]),
            urgent_pointer: u16::from_be_bytes([pkt[18], pkt[19]]),
        })
    }

    /// Encode the fixed 20-byte header, computing the checksum over the
    /// pseudo-header, this header, and `payload`. The caller appends the
    /// payload itself.
    pub fn marshal(&mut self, ip_header: &Ipv4Header, payload: &[u8]) -> Vec<u8> {
        let mut pkt = vec![0u8; TCP_HEADER_LEN];
        pkt[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        pkt[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        pkt[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        pkt[8..12].copy_from_slice(&self.ack_num.to_be_bytes());
        pkt[12] = self.data_offset << 4;
        pkt[13] = self.flags.to_byte();
        pkt[14..16].copy_from_slice(&self.window.to_be_bytes());
        // Bytes 16..18 stay zero until the checksum below.
        pkt[18..20].copy_from_slice(&self.urgent_pointer.to_be_bytes());

        let mut segment = Vec::with_capacity(TCP_HEADER_LEN + payload.len());
        segment.extend_from_slice(&pkt);
        segment.extend_from_slice(payload);
        self.set_checksum(ip_header, &segment);
        pkt[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        pkt
    }

    /// Compute the TCP checksum over the 12-byte IPv4 pseudo-header followed
    /// by `segment` (header plus payload) and store it in `self.checksum`.
    pub fn set_checksum(&mut self, ip_header: &Ipv4Header, segment: &[u8]) {
        let mut buf = Vec::with_capacity(12 + segment.len());
        buf.extend_from_slice(&ip_header.src_ip);
        buf.extend_from_slice(&ip_header.dst_ip);
        buf.push(0);
        buf.push(TCP_PROTOCOL);
        buf.extend_from_slice(&(segment.len() as u16).to_be_bytes());
        buf.extend_from_slice(segment);
        self.checksum = checksum(&buf);
    }
}

/// A fully-parsed inbound segment: both decoded headers plus the owning
/// buffer.
#[derive(Debug, Clone)]
pub struct TcpPacket {
    pub ip_header: Ipv4Header,
    pub tcp_header: TcpHeader,
    pub packet: Packet,
}

impl TcpPacket {
    /// The application bytes carried by this segment; empty when the header
    /// offsets point past the end of the datagram.
    pub fn payload(&self) -> &[u8] {
        let start = usize::from(self.ip_header.ihl) * 4
            + usize::from(self.tcp_header.data_offset) * 4;
        if start >= self.packet.len {
            return &[];
        }
        &self.packet.buf[start..self.packet.len]
    }

    /// Length of the application bytes.
    pub fn payload_len(&self) -> usize {
        self.payload().len()
    }
}
