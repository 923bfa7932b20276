//! Raw address format: four IPv4 octets followed by a big-endian port.

use std::net::{Ipv4Addr, SocketAddrV4};

pub const RAW_ADDR_LEN: usize = 6;

pub fn encode(addr: SocketAddrV4) -> Vec<u8> {
    let mut raw = Vec::with_capacity(RAW_ADDR_LEN);
    raw.extend_from_slice(&addr.ip().octets());
    raw.extend_from_slice(&addr.port().to_be_bytes());
    raw
}

pub fn decode(raw: &[u8]) -> Option<SocketAddrV4> {
    if raw.len() != RAW_ADDR_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let port = u16::from_be_bytes([raw[4], raw[5]]);
    Some(SocketAddrV4::new(ip, port))
}

pub fn render(raw: &[u8]) -> String {
    match decode(raw) {
        Some(addr) => addr.to_string(),
        None => raw.iter().map(|b| format!("{b:02x}")).collect(),
    }
}
