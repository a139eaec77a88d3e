//! DHCP/BOOTP wire codec (RFC 2131 fixed header, RFC 2132 option TLVs).
//!
//! Grounded on `original_source/dhcplib/packet.py`'s `Packet.parse`/`pack`/
//! `reply` for field order and semantics, and on the teacher's
//! `core/packet.rs` for the general parse-by-draining-a-buffer shape
//! (`HardwareAddress`, fixed-size field slots).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use super::hwaddr::HardwareAddress;
use super::message_type::{OPT_END, OPT_PAD};
use crate::error::PacketError;

pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const HEADER_LEN: usize = 1 + 1 + 1 + 1 + 4 + 2 + 2 + 4 + 4 + 4 + 4 + 16 + 64 + 128;

/// A parsed BOOTP/DHCP packet: fixed header plus an option-code → raw-bytes
/// map. Option 0 (pad) is skipped on parse and never emitted on pack;
/// option 255 (end) terminates parsing and is always written last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: HashMap<u8, Vec<u8>>,
}

const BROADCAST_FLAG: u16 = 0x8000;
pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

impl Packet {
    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    pub fn hardware_address(&self) -> HardwareAddress {
        HardwareAddress::new(self.chaddr, self.hlen)
    }

    /// Option code 53. `None` for a BOOTP packet that never set it.
    pub fn message_type_byte(&self) -> Option<u8> {
        self.options.get(&53).and_then(|v| v.first().copied())
    }

    fn read_ipv4(buf: &[u8], off: usize) -> Ipv4Addr {
        Ipv4Addr::new(buf[off], buf[off + 1], buf[off + 2], buf[off + 3])
    }

    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN + MAGIC_COOKIE.len() {
            return Err(PacketError::Truncated);
        }

        let op = buf[0];
        let htype = buf[1];
        let hlen = buf[2];
        let hops = buf[3];
        let xid = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let secs = u16::from_be_bytes(buf[8..10].try_into().unwrap());
        let flags = u16::from_be_bytes(buf[10..12].try_into().unwrap());
        let ciaddr = Self::read_ipv4(buf, 12);
        let yiaddr = Self::read_ipv4(buf, 16);
        let siaddr = Self::read_ipv4(buf, 20);
        let giaddr = Self::read_ipv4(buf, 24);
        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&buf[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&buf[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&buf[108..236]);

        if buf[236..240] != MAGIC_COOKIE {
            return Err(PacketError::InvalidMagic);
        }

        let options = parse_options(&buf[240..])?;

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + MAGIC_COOKIE.len() + 64);
        out.push(self.op);
        out.push(self.htype);
        out.push(self.hlen);
        out.push(self.hops);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.ciaddr.octets());
        out.extend_from_slice(&self.yiaddr.octets());
        out.extend_from_slice(&self.siaddr.octets());
        out.extend_from_slice(&self.giaddr.octets());
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&MAGIC_COOKIE);

        for (code, value) in &self.options {
            out.push(*code);
            out.push(value.len() as u8);
            out.extend_from_slice(value);
        }
        out.push(OPT_END);

        out
    }

    /// Builds a server response pre-filled per spec.md §4.1: op=BOOTREPLY,
    /// htype/hlen/xid/flags/siaddr/giaddr/ciaddr/chaddr copied from the
    /// query, sname set to the host's name NUL-padded to 64 bytes.
    pub fn reply(&self) -> Self {
        let hostname = hostname_bytes();
        let mut sname = [0u8; 64];
        let n = hostname.len().min(64);
        sname[..n].copy_from_slice(&hostname[..n]);

        Self {
            op: BOOTREPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr: self.ciaddr,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: self.siaddr,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname,
            file: [0u8; 128],
            options: HashMap::new(),
        }
    }
}

fn hostname_bytes() -> Vec<u8> {
    nix::unistd::gethostname()
        .map(|s| s.to_string_lossy().into_owned().into_bytes())
        .unwrap_or_default()
}

fn parse_options(buf: &[u8]) -> Result<HashMap<u8, Vec<u8>>, PacketError> {
    let mut options = HashMap::new();
    let mut i = 0usize;
    let mut terminated = false;

    while i < buf.len() {
        let code = buf[i];
        i += 1;

        if code == OPT_PAD {
            continue;
        }
        if code == OPT_END {
            terminated = true;
            break;
        }

        if i >= buf.len() {
            return Err(PacketError::Truncated);
        }
        let len = buf[i] as usize;
        i += 1;

        if i + len > buf.len() {
            return Err(PacketError::Truncated);
        }
        options.insert(code, buf[i..i + len].to_vec());
        i += len;
    }

    if !terminated {
        return Err(PacketError::Truncated);
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let mut options = HashMap::new();
        options.insert(53, vec![1]);
        options.insert(50, vec![10, 3, 2, 2]);
        Packet {
            op: BOOTREQUEST,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0xdeadbeef,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options,
        }
    }

    #[test]
    fn parse_pack_round_trips() {
        let pkt = sample_packet();
        let bytes = pkt.pack();
        let reparsed = Packet::parse(&bytes).unwrap();
        assert_eq!(pkt, reparsed);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample_packet().pack();
        bytes[236] = 0;
        assert_eq!(Packet::parse(&bytes), Err(PacketError::InvalidMagic));
    }

    #[test]
    fn truncated_before_end_option_fails() {
        let bytes = sample_packet().pack();
        let truncated = &bytes[..bytes.len() - 2];
        assert_eq!(Packet::parse(truncated), Err(PacketError::Truncated));
    }

    #[test]
    fn pad_options_are_skipped() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf.extend_from_slice(&MAGIC_COOKIE);
        buf.push(OPT_PAD);
        buf.push(53);
        buf.push(1);
        buf.push(1);
        buf.push(OPT_END);

        let pkt = Packet::parse(&buf).unwrap();
        assert_eq!(pkt.options.get(&53), Some(&vec![1u8]));
    }

    #[test]
    fn reply_copies_identity_fields() {
        let query = sample_packet();
        let answer = query.reply();
        assert_eq!(answer.op, BOOTREPLY);
        assert_eq!(answer.xid, query.xid);
        assert_eq!(answer.chaddr, query.chaddr);
        assert_eq!(answer.hlen, query.hlen);
    }

    #[test]
    fn broadcast_flag_detection() {
        let mut pkt = sample_packet();
        assert!(!pkt.is_broadcast());
        pkt.flags = BROADCAST_FLAG;
        assert!(pkt.is_broadcast());
    }
}
