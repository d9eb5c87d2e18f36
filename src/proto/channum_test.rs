use super::*;
use crate::error::Result;

use stun::attributes::RawAttribute;

#[test]
fn test_channel_number_string() {
    let n = ChannelNumber(0x4001);
    assert_eq!(n.to_string(), "16385", "bad string {n}");
}

#[test]
fn test_channel_number_add_to() -> Result<()> {
    let mut m = Message::new();
    let n = ChannelNumber(0x4000 + 12);
    n.add_to(&mut m)?;
    m.write_header();

    let mut decoded = Message::new();
    decoded.raw = m.raw.clone();
    decoded.decode()?;

    let mut num = ChannelNumber::default();
    num.get_from(&decoded)?;
    assert_eq!(num, n, "decoded {num}, expected {n}");

    Ok(())
}

#[test]
fn test_channel_number_get_from_bad_length() -> Result<()> {
    let mut m = Message::new();
    let a = RawAttribute {
        typ: ATTR_CHANNEL_NUMBER,
        value: vec![1, 2, 3],
        ..Default::default()
    };
    a.add_to(&mut m)?;

    let mut num = ChannelNumber::default();
    let result = num.get_from(&m);
    assert!(result.is_err(), "should error on 3-byte CHANNEL-NUMBER");

    Ok(())
}

#[test]
fn test_channel_number_valid_range() {
    assert!(!ChannelNumber(MIN_CHANNEL_NUMBER - 1).is_valid());
    assert!(ChannelNumber(MIN_CHANNEL_NUMBER).is_valid());
    assert!(ChannelNumber(MAX_CHANNEL_NUMBER).is_valid());
    assert!(!ChannelNumber(MAX_CHANNEL_NUMBER + 1).is_valid());
}
