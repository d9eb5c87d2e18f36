use std::fmt;

use stun::attributes::ATTR_EVEN_PORT;
use stun::checks::check_size;
use stun::message::{Getter, Message, Setter};

const EVEN_PORT_SIZE: usize = 1;
const FIRST_BIT_SET: u8 = 0b1000_0000;

/// EvenPort represents EVEN-PORT attribute.
///
/// This attribute allows the client to request that the port in the
/// relayed transport address be even, and (optionally) that the server
/// reserve the next-higher port number.
///
/// RFC 5766 Section 14.6
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct EvenPort {
    /// reserve_port means that the server is requested to reserve the
    /// next-higher port number (on the same IP address) for a subsequent
    /// allocation.
    pub reserve_port: bool,
}

impl fmt::Display for EvenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reserve_port {
            write!(f, "reserve: true")
        } else {
            write!(f, "reserve: false")
        }
    }
}

impl Setter for EvenPort {
    // Adds EVEN-PORT to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        let mut v = vec![0; EVEN_PORT_SIZE];
        if self.reserve_port {
            v[0] = FIRST_BIT_SET;
        }
        m.add(ATTR_EVEN_PORT, &v);
        Ok(())
    }
}

impl Getter for EvenPort {
    // Decodes EVEN-PORT from message.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let v = m.get(ATTR_EVEN_PORT)?;

        check_size(ATTR_EVEN_PORT, v.len(), EVEN_PORT_SIZE)?;

        self.reserve_port = v[0] & FIRST_BIT_SET != 0;
        Ok(())
    }
}
