//! Segment header encode/decode and checksum verification.
//!
//! The wire format is the standard 20-byte (no options) TCP header,
//! big-endian: src_port, dst_port, seq_no, ack_no, a flags-and-data-offset
//! word (high 4 bits = header length in 32-bit words, low 9 bits = control
//! flags), window, checksum, urgent pointer, followed by payload.
//!
//! This module treats the segment as a bare byte string handed to it by a
//! [`crate::net::Network`] alongside the peer/local addresses used only for
//! pseudo-header checksum math — no IP header lives inside these bytes.

use std::net::Ipv4Addr;

use etherparse::{Ipv4Header, TcpHeader};

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 20;

/// Typical maximum segment size for an MTU-1500 link with no IP/TCP options.
pub const MSS: u16 = 1460;

const FLAG_FIN: u16 = 0x001;
const FLAG_SYN: u16 = 0x002;
const FLAG_ACK: u16 = 0x010;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
}

impl Flags {
    pub const fn syn() -> Self {
        Flags { syn: true, ack: false, fin: false }
    }

    pub const fn syn_ack() -> Self {
        Flags { syn: true, ack: true, fin: false }
    }

    pub const fn ack() -> Self {
        Flags { syn: false, ack: true, fin: false }
    }

    pub const fn fin_ack() -> Self {
        Flags { syn: false, ack: true, fin: true }
    }

    fn bits(self) -> u16 {
        let mut bits = 0u16;
        if self.fin {
            bits |= FLAG_FIN;
        }
        if self.syn {
            bits |= FLAG_SYN;
        }
        if self.ack {
            bits |= FLAG_ACK;
        }
        bits
    }

    fn from_bits(bits: u16) -> Self {
        Flags {
            syn: bits & FLAG_SYN != 0,
            ack: bits & FLAG_ACK != 0,
            fin: bits & FLAG_FIN != 0,
        }
    }
}

/// A decoded segment: header fields plus an owned copy of the payload.
#[derive(Debug, Clone)]
pub struct Segment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_no: u32,
    pub ack_no: u32,
    pub flags: Flags,
    pub payload: Vec<u8>,
}

/// Decodes a raw segment. Does not check the checksum; call
/// [`verify_checksum`] separately (the listener treats a bad checksum and a
/// malformed segment identically — both are silent drops — but keeping them
/// separate lets callers log which happened).
pub fn decode(raw: &[u8]) -> Result<Segment> {
    if raw.len() < HEADER_LEN {
        return Err(Error::Truncated);
    }

    let src_port = u16::from_be_bytes([raw[0], raw[1]]);
    let dst_port = u16::from_be_bytes([raw[2], raw[3]]);
    let seq_no = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let ack_no = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
    let flags_word = u16::from_be_bytes([raw[12], raw[13]]);
    let header_words = (flags_word >> 12) as u8;
    let flags = Flags::from_bits(flags_word & 0x1FF);

    if header_words < 5 {
        return Err(Error::BadHeaderLen(header_words));
    }
    let header_len = header_words as usize * 4;
    if raw.len() < header_len {
        return Err(Error::Truncated);
    }

    Ok(Segment {
        src_port,
        dst_port,
        seq_no,
        ack_no,
        flags,
        payload: raw[header_len..].to_vec(),
    })
}

/// Verifies the 16-bit one's-complement checksum over the IPv4 pseudo-header
/// plus segment. `src`/`dst` are the addresses the segment travelled
/// between, supplied by the network layer out of band (this module never
/// sees an IP header).
pub fn verify_checksum(raw: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
    if raw.len() < HEADER_LEN {
        return false;
    }
    let Ok((header, payload)) = TcpHeader::from_slice(raw) else {
        return false;
    };
    let pseudo = pseudo_ip_header(src, dst);
    match header.calc_checksum_ipv4(&pseudo, payload) {
        Ok(expected) => expected == header.checksum,
        Err(_) => false,
    }
}

fn pseudo_ip_header(src: Ipv4Addr, dst: Ipv4Addr) -> Ipv4Header {
    // Only source/destination feed the TCP pseudo-header checksum; the rest
    // of this header is never serialized, so any placeholder TTL/length is
    // fine.
    Ipv4Header::new(0, 64, 6, src.octets(), dst.octets())
}

/// Encodes a segment with a freshly computed checksum.
pub fn encode(
    src_port: u16,
    dst_port: u16,
    seq_no: u32,
    ack_no: u32,
    flags: Flags,
    payload: &[u8],
    local: Ipv4Addr,
    peer: Ipv4Addr,
) -> Vec<u8> {
    let mut header = TcpHeader::new(src_port, dst_port, seq_no, 64240);
    header.acknowledgment_number = ack_no;
    header.ack = flags.ack;
    header.syn = flags.syn;
    header.fin = flags.fin;

    let pseudo = pseudo_ip_header(local, peer);
    header.checksum = header
        .calc_checksum_ipv4(&pseudo, payload)
        .expect("payload within etherparse's checksum length limit");

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    header.write(&mut out).expect("writing to a Vec never fails");
    out.extend_from_slice(payload);
    out
}
