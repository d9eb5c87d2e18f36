#[cfg(test)]
#[path = "lifetime_test.rs"]
mod lifetime_test;

use std::fmt;
use std::time::Duration;

use stun::attributes::ATTR_LIFETIME;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

/// DEFAULT_LIFETIME in RFC 5766 is 10 minutes.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(10 * 60);

// Seconds in u32, 4 bytes on the wire.
const LIFETIME_SIZE: usize = 4;

/// Lifetime represents LIFETIME attribute.
///
/// The LIFETIME attribute represents the duration for which the server
/// will maintain an allocation in the absence of a refresh.
///
/// RFC 5766 Section 14.2
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct Lifetime(pub Duration);

impl fmt::Display for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0.as_secs())
    }
}

impl Setter for Lifetime {
    // Adds LIFETIME to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let v = (self.0.as_secs() as u32).to_be_bytes();
        m.add(ATTR_LIFETIME, &v);
        Ok(())
    }
}

impl Getter for Lifetime {
    // Decodes LIFETIME from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_LIFETIME)?;

        check_size(ATTR_LIFETIME, v.len(), LIFETIME_SIZE)?;

        let seconds = u32::from_be_bytes([v[0], v[1], v[2], v[3]]);
        self.0 = Duration::from_secs(seconds as u64);

        Ok(())
    }
}
