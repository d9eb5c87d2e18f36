#[cfg(test)]
#[path = "channum_test.rs"]
mod channum_test;

use std::fmt;

use stun::attributes::ATTR_CHANNEL_NUMBER;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

/// MIN_CHANNEL_NUMBER is the lower inclusive bound of the channel
/// number space reserved for ChannelData, RFC 5766 Section 11.
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;
/// MAX_CHANNEL_NUMBER is the upper inclusive bound of the channel
/// number space.
pub const MAX_CHANNEL_NUMBER: u16 = 0x7fff;

/// 16 bits of uint + 16 bits of RFFU = 0.
const CHANNEL_NUMBER_SIZE: usize = 4;

/// ChannelNumber represents CHANNEL-NUMBER attribute.
///
/// The CHANNEL-NUMBER attribute contains the number of the channel.
///
/// RFC 5766 Section 14.1
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone, Hash, PartialOrd, Ord)]
pub struct ChannelNumber(pub u16);

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Setter for ChannelNumber {
    // Adds CHANNEL-NUMBER to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let mut v = vec![0; CHANNEL_NUMBER_SIZE];
        v[..2].copy_from_slice(&self.0.to_be_bytes());
        // v[2..4] are zeroes (RFFU = 0)
        m.add(ATTR_CHANNEL_NUMBER, &v);
        Ok(())
    }
}

impl Getter for ChannelNumber {
    // Decodes CHANNEL-NUMBER from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_CHANNEL_NUMBER)?;

        check_size(ATTR_CHANNEL_NUMBER, v.len(), CHANNEL_NUMBER_SIZE)?;

        self.0 = u16::from_be_bytes([v[0], v[1]]);
        // v[2..4] is RFFU and equals to 0.
        Ok(())
    }
}

impl ChannelNumber {
    /// Reports whether the number lies in the channel number space.
    pub fn is_valid(&self) -> bool {
        (MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&self.0)
    }
}
