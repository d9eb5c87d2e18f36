use super::*;
use crate::error::Result;

#[test]
fn test_channel_data_encode() -> Result<()> {
    let mut d = ChannelData {
        data: vec![1, 2, 3, 4],
        number: ChannelNumber(MIN_CHANNEL_NUMBER + 1),
        ..Default::default()
    };
    d.encode();

    let mut b = ChannelData {
        raw: d.raw.clone(),
        ..Default::default()
    };
    b.decode()?;

    assert_eq!(b, d, "not equal");
    assert!(
        ChannelData::is_channel_data(&b.raw) && ChannelData::is_channel_data(&d.raw),
        "unexpected IsChannelData"
    );

    Ok(())
}

#[test]
fn test_channel_data_padding() {
    // 5-byte payload must be padded to the next 4-byte boundary on the wire,
    // while the length field stays 5.
    let mut d = ChannelData {
        data: vec![1, 2, 3, 4, 5],
        number: ChannelNumber(MIN_CHANNEL_NUMBER),
        ..Default::default()
    };
    d.encode();

    assert_eq!(d.raw.len(), CHANNEL_DATA_HEADER_SIZE + 8);
    assert_eq!(u16::from_be_bytes([d.raw[2], d.raw[3]]), 5);
}

#[test]
fn test_channel_data_decode_unpadded() -> Result<()> {
    // Datagram transports may omit padding.
    let raw = vec![0x40, 0x00, 0x00, 0x03, 1, 2, 3];
    let mut d = ChannelData {
        raw,
        ..Default::default()
    };
    d.decode()?;
    assert_eq!(d.data, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn test_channel_data_equal() {
    let tests = vec![
        (
            "equal",
            ChannelData {
                number: ChannelNumber(MIN_CHANNEL_NUMBER),
                data: vec![1, 2, 3],
                ..Default::default()
            },
            ChannelData {
                number: ChannelNumber(MIN_CHANNEL_NUMBER),
                data: vec![1, 2, 3],
                ..Default::default()
            },
            true,
        ),
        (
            "number",
            ChannelData {
                number: ChannelNumber(MIN_CHANNEL_NUMBER + 1),
                data: vec![1, 2, 3],
                ..Default::default()
            },
            ChannelData {
                number: ChannelNumber(MIN_CHANNEL_NUMBER),
                data: vec![1, 2, 3],
                ..Default::default()
            },
            false,
        ),
        (
            "length",
            ChannelData {
                number: ChannelNumber(MIN_CHANNEL_NUMBER),
                data: vec![1, 2, 3, 4],
                ..Default::default()
            },
            ChannelData {
                number: ChannelNumber(MIN_CHANNEL_NUMBER),
                data: vec![1, 2, 3],
                ..Default::default()
            },
            false,
        ),
    ];

    for (name, a, b, r) in tests {
        let v = a == b;
        assert_eq!(v, r, "unexpected: ({name}) {r} != {v}");
    }
}

#[test]
fn test_channel_data_decode_errors() {
    let tests = vec![
        ("short", vec![1, 2, 3]),
        ("number out of range", vec![0x3f, 0xff, 0x00, 0x00]),
        ("length over buffer", vec![0x40, 0x00, 0x00, 0x05, 1, 2]),
    ];

    for (name, raw) in tests {
        let mut d = ChannelData {
            raw,
            ..Default::default()
        };
        assert!(d.decode().is_err(), "expected decode error: {name}");
    }
}

#[test]
fn test_is_channel_data() {
    let tests = vec![
        ("small", vec![1, 2, 3, 4], false),
        ("zeroes", vec![0, 0, 0, 0], false),
        ("stun", vec![0x00, 0x01, 0x00, 0x00], false),
        ("channel", vec![0x40, 0x00, 0x00, 0x00], true),
    ];

    for (name, buf, r) in tests {
        let v = ChannelData::is_channel_data(&buf);
        assert_eq!(v, r, "unexpected: ({name}) {r} != {v}");
    }
}
