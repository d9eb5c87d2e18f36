use std::net::Ipv6Addr;

use super::*;
use crate::error::Result;

#[test]
fn test_peer_address_roundtrip_v4() -> Result<()> {
    let a = PeerAddress {
        ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 15)),
        port: 43221,
    };

    let mut m = Message::new();
    a.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.raw = m.raw.clone();
    decoded.decode()?;

    let mut b = PeerAddress::default();
    b.get_from(&decoded)?;
    assert_eq!(b, a, "got {b}, expected {a}");

    Ok(())
}

#[test]
fn test_peer_address_roundtrip_v6() -> Result<()> {
    let a = PeerAddress {
        ip: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x21)),
        port: 1234,
    };

    let mut m = Message::new();
    a.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.raw = m.raw.clone();
    decoded.decode()?;

    let mut b = PeerAddress::default();
    b.get_from(&decoded)?;
    assert_eq!(b, a, "got {b}, expected {a}");

    Ok(())
}

#[test]
fn test_peer_address_truncated() {
    use stun::attributes::{RawAttribute, ATTR_XOR_PEER_ADDRESS};

    let mut m = Message::new();
    let a = RawAttribute {
        typ: ATTR_XOR_PEER_ADDRESS,
        value: vec![1, 2, 3],
        ..Default::default()
    };
    let _ = a.add_to(&mut m);

    let mut p = PeerAddress::default();
    assert!(p.get_from(&m).is_err(), "truncated value must not decode");
}
