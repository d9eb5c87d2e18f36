#[cfg(test)]
#[path = "binding_test.rs"]
mod binding_test;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::proto::channum::{MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER};

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum BindingState {
    #[default]
    Idle,
    Request,
    Ready,
    Refresh,
    Failed,
}

// Binding is a channel number bound to one peer address.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Binding {
    pub(crate) number: u16,
    pub(crate) peer: SocketAddr,
    pub(crate) state: BindingState,
    pub(crate) refreshed_at: Instant,
}

/// BindingManager hands out channel numbers for one allocation and maps
/// them back to peer addresses for inbound ChannelData.
pub(crate) struct BindingManager {
    by_number: HashMap<u16, SocketAddr>,
    by_peer: HashMap<SocketAddr, Binding>,
    next: u16,
}

impl BindingManager {
    pub(crate) fn new() -> Self {
        BindingManager {
            by_number: HashMap::new(),
            by_peer: HashMap::new(),
            next: MIN_CHANNEL_NUMBER,
        }
    }

    // Picks the next free number from the monotonically increasing
    // counter, wrapping at the top of the range and probing past numbers
    // that are still bound.
    fn assign_channel_number(&mut self) -> Result<u16> {
        let span = (MAX_CHANNEL_NUMBER - MIN_CHANNEL_NUMBER) as usize + 1;
        for _ in 0..span {
            let n = self.next;
            self.next = if n >= MAX_CHANNEL_NUMBER {
                MIN_CHANNEL_NUMBER
            } else {
                n + 1
            };
            if !self.by_number.contains_key(&n) {
                return Ok(n);
            }
        }
        Err(Error::ErrNoChannelsFree)
    }

    pub(crate) fn create(&mut self, peer: SocketAddr) -> Result<u16> {
        if self.by_peer.contains_key(&peer) {
            return Err(Error::ErrAlreadyBound);
        }

        let number = self.assign_channel_number()?;
        self.by_number.insert(number, peer);
        self.by_peer.insert(
            peer,
            Binding {
                number,
                peer,
                state: BindingState::Request,
                refreshed_at: Instant::now(),
            },
        );
        Ok(number)
    }

    pub(crate) fn find_by_peer(&self, peer: &SocketAddr) -> Option<&Binding> {
        self.by_peer.get(peer)
    }

    pub(crate) fn get_by_peer_mut(&mut self, peer: &SocketAddr) -> Option<&mut Binding> {
        self.by_peer.get_mut(peer)
    }

    pub(crate) fn find_by_number(&self, number: u16) -> Option<&Binding> {
        let peer = self.by_number.get(&number)?;
        self.by_peer.get(peer)
    }

    pub(crate) fn delete_by_peer(&mut self, peer: &SocketAddr) -> Option<Binding> {
        let binding = self.by_peer.remove(peer)?;
        self.by_number.remove(&binding.number);
        Some(binding)
    }

    pub(crate) fn clear(&mut self) {
        self.by_number.clear();
        self.by_peer.clear();
    }

    pub(crate) fn size(&self) -> usize {
        self.by_peer.len()
    }
}
