use stun::attributes::ATTR_DONT_FRAGMENT;
use stun::message::{Getter, Message, Setter};

/// DontFragmentAttr represents DONT-FRAGMENT attribute.
///
/// The attribute has no value; its presence requests the server to set
/// the DF bit on datagrams relayed to the peer.
///
/// RFC 5766 Section 14.8
#[derive(Default, Debug, PartialEq, Eq, Copy, Clone)]
pub struct DontFragmentAttr;

impl Setter for DontFragmentAttr {
    // Adds DONT-FRAGMENT to message.
    fn add_to(&self, m: &mut Message) -> Result<(), stun::Error> {
        m.add(ATTR_DONT_FRAGMENT, &[]);
        Ok(())
    }
}

impl Getter for DontFragmentAttr {
    // Reports whether DONT-FRAGMENT is set.
    fn get_from(&mut self, m: &Message) -> Result<(), stun::Error> {
        let _ = m.get(ATTR_DONT_FRAGMENT)?;
        Ok(())
    }
}
