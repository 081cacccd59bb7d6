//! Candidate address kinds and the 0x71 address-list codec
//!
//! Each wire entry is one octet combining the address kind (low nibble)
//! and the family bit (0x80 = IPv6), the raw address bytes and a 16-bit
//! port. The list starts with a count octet. A `Redirection` entry names
//! the rendezvous host rather than a peer candidate.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::codec::{Reader, Writer};
use crate::error::{HandshakeError, Result};

const FAMILY_IPV6: u8 = 0x80;

/// Where a candidate address was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressKind {
    Public = 0x01,
    LocalHost = 0x02,
    Local = 0x03,
    Stun = 0x04,
    Redirection = 0x05,
}

impl AddressKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Public),
            0x02 => Some(Self::LocalHost),
            0x03 => Some(Self::Local),
            0x04 => Some(Self::Stun),
            0x05 => Some(Self::Redirection),
            _ => None,
        }
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::LocalHost => write!(f, "localhost"),
            Self::Local => write!(f, "local"),
            Self::Stun => write!(f, "stun"),
            Self::Redirection => write!(f, "redirection"),
        }
    }
}

/// Parsed 0x71 address list: peer candidates plus the optional
/// rendezvous host signalled by a redirection entry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddressList {
    pub candidates: Vec<(SocketAddr, AddressKind)>,
    pub host: Option<SocketAddr>,
}

pub fn read_address_list(r: &mut Reader<'_>) -> Result<AddressList> {
    let count = r.read_u8()?;
    let mut list = AddressList::default();
    for _ in 0..count {
        if r.available() == 0 {
            break;
        }
        let (address, kind) = read_address(r)?;
        if kind == AddressKind::Redirection {
            list.host = Some(address);
        } else {
            list.candidates.push((address, kind));
        }
    }
    Ok(list)
}

fn read_address(r: &mut Reader<'_>) -> Result<(SocketAddr, AddressKind)> {
    let tag = r.read_u8()?;
    let kind = AddressKind::from_u8(tag & 0x0F).ok_or_else(|| {
        HandshakeError::malformed("address kind", format!("{:#04x}", tag & 0x0F))
    })?;
    let ip = if tag & FAMILY_IPV6 != 0 {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(r.read_bytes(16)?);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(r.read_bytes(4)?);
        IpAddr::V4(Ipv4Addr::from(octets))
    };
    let port = r.read_u16()?;
    Ok((SocketAddr::new(ip, port), kind))
}

pub fn write_address_list(w: &mut Writer, list: &AddressList) {
    let count = list.candidates.len() + usize::from(list.host.is_some());
    w.write_u8(count as u8);
    for (address, kind) in &list.candidates {
        write_address(w, *address, *kind);
    }
    if let Some(host) = list.host {
        write_address(w, host, AddressKind::Redirection);
    }
}

pub fn write_address(w: &mut Writer, address: SocketAddr, kind: AddressKind) {
    match address.ip() {
        IpAddr::V4(ip) => {
            w.write_u8(kind as u8);
            w.write_bytes(&ip.octets());
        }
        IpAddr::V6(ip) => {
            w.write_u8(kind as u8 | FAMILY_IPV6);
            w.write_bytes(&ip.octets());
        }
    }
    w.write_u16(address.port());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)), port)
    }

    #[test]
    fn test_roundtrip_mixed_families() {
        let list = AddressList {
            candidates: vec![
                (v4(1, 1935), AddressKind::Public),
                (
                    SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 19350),
                    AddressKind::Local,
                ),
            ],
            host: Some(v4(9, 1935)),
        };

        let mut w = Writer::new();
        write_address_list(&mut w, &list);
        let mut r = Reader::new(w.data());
        let parsed = read_address_list(&mut r).unwrap();
        assert_eq!(parsed, list);
        assert_eq!(r.available(), 0);
    }

    #[test]
    fn test_redirection_becomes_host() {
        let mut w = Writer::new();
        w.write_u8(1);
        write_address(&mut w, v4(7, 1935), AddressKind::Redirection);

        let parsed = read_address_list(&mut Reader::new(w.data())).unwrap();
        assert!(parsed.candidates.is_empty());
        assert_eq!(parsed.host, Some(v4(7, 1935)));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut w = Writer::new();
        w.write_u8(1);
        w.write_u8(0x0E);
        w.write_bytes(&[10, 0, 0, 1]);
        w.write_u16(1935);

        assert!(read_address_list(&mut Reader::new(w.data())).is_err());
    }

    #[test]
    fn test_count_beyond_buffer_stops_cleanly() {
        let mut w = Writer::new();
        w.write_u8(3);
        write_address(&mut w, v4(1, 1935), AddressKind::Public);

        let parsed = read_address_list(&mut Reader::new(w.data())).unwrap();
        assert_eq!(parsed.candidates.len(), 1);
    }
}
