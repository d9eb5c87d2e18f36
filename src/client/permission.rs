#[cfg(test)]
#[path = "permission_test.rs"]
mod permission_test;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use stun::agent::TransactionId;
use stun::fingerprint::FINGERPRINT;
use stun::message::{Message, MessageType, Setter, CLASS_INDICATION, METHOD_SEND};
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::client::allocation::AllocationInner;
use crate::client::binding::BindingState;
use crate::client::periodic_timer::{
    PeriodicTimer, PeriodicTimerTimeoutHandler, TimerIdRefresh,
};
use crate::client::{
    ClientInner, BINDING_LIFETIME, BINDING_REFRESH_INTERVAL, PERM_REFRESH_INTERVAL,
};
use crate::error::{Error, Result};
use crate::proto::chandata::ChannelData;
use crate::proto::channum::ChannelNumber;
use crate::proto::data::Data;
use crate::proto::peeraddr::PeerAddress;

pub(crate) const MAX_READ_QUEUE_SIZE: usize = 1024;

// Why a conduit went away; mapped to an error on the next read.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Closed,
    ConnectionLost,
}

impl CloseReason {
    pub(crate) fn into_error(self) -> Error {
        match self {
            CloseReason::Closed => Error::ErrClosed,
            CloseReason::ConnectionLost => Error::ErrConnectionLost,
        }
    }
}

struct QueueState {
    items: VecDeque<Vec<u8>>,
    closed: Option<CloseReason>,
}

// InboundQueue is the bounded datagram queue between the demultiplexer
// and a reader. On overflow the oldest datagram is dropped and counted;
// losing relayed datagrams under backpressure is ordinary TURN behavior.
pub(crate) struct InboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl InboundQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        InboundQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: None,
            }),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) async fn push(&self, data: Vec<u8>) {
        {
            let mut state = self.state.lock().await;
            if state.closed.is_some() {
                return;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.items.push_back(data);
        }
        self.notify.notify_one();
    }

    pub(crate) async fn pop(&self, deadline: Option<Instant>) -> Result<Vec<u8>> {
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(data) = state.items.pop_front() {
                    return Ok(data);
                }
                if let Some(reason) = state.closed {
                    return Err(reason.into_error());
                }
            }

            let notified = self.notify.notified();
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::ErrTimeout);
                    }
                    let _ = timeout(d - now, notified).await;
                }
                None => notified.await,
            }
        }
    }

    pub(crate) async fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock().await;
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
        }
        self.notify.notify_waiters();
        // A waiter registering after notify_waiters picks up this permit.
        self.notify.notify_one();
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Permission is a bidirectional conduit between the allocation and one
/// peer. Reads drain datagrams the relay forwarded from the peer; writes
/// go out as Send indications, or as ChannelData once [`Permission::bind`]
/// succeeded.
#[derive(Clone)]
pub struct Permission {
    pub(crate) inner: Arc<PermissionInner>,
}

pub(crate) struct PermissionInner {
    pub(crate) peer: SocketAddr,
    pub(crate) client: Weak<ClientInner>,
    pub(crate) allocation: Weak<AllocationInner>,
    pub(crate) queue: InboundQueue,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    pub(crate) closed: AtomicBool,
    refresh_timer: PeriodicTimer,
    binding_timer: PeriodicTimer,
}

impl PermissionInner {
    pub(crate) fn new(
        peer: SocketAddr,
        client: Weak<ClientInner>,
        allocation: Weak<AllocationInner>,
    ) -> Self {
        PermissionInner {
            peer,
            client,
            allocation,
            queue: InboundQueue::new(MAX_READ_QUEUE_SIZE),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            closed: AtomicBool::new(false),
            refresh_timer: PeriodicTimer::new(TimerIdRefresh::Perm, PERM_REFRESH_INTERVAL),
            binding_timer: PeriodicTimer::new(TimerIdRefresh::Binding, BINDING_REFRESH_INTERVAL),
        }
    }

    pub(crate) async fn start_refresh(this: &Arc<Self>) {
        this.refresh_timer.start(Arc::downgrade(this)).await;
    }

    fn peer_address(&self) -> PeerAddress {
        PeerAddress {
            ip: self.peer.ip(),
            port: self.peer.port(),
        }
    }

    // The channel number to use for writes, present once a ChannelBind
    // round-trip completed and the binding is still installed.
    pub(crate) async fn bound_number(&self) -> Option<u16> {
        let alloc = self.allocation.upgrade()?;
        let bindings = alloc.bindings.lock().await;
        bindings
            .find_by_peer(&self.peer)
            .filter(|b| b.state == BindingState::Ready)
            .filter(|b| b.refreshed_at.elapsed() < BINDING_LIFETIME)
            .map(|b| b.number)
    }

    // Tears the conduit down without touching the allocation's maps; the
    // owner of those maps drives this on allocation death.
    pub(crate) async fn shutdown(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.refresh_timer.stop().await;
        self.binding_timer.stop().await;
        self.queue.close(reason).await;
    }

    async fn refresh_permission(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let attrs: Vec<Box<dyn Setter + Send + Sync>> = vec![Box::new(self.peer_address())];
        match client
            .request(stun::message::METHOD_CREATE_PERMISSION, attrs)
            .await
        {
            Ok(_) => log::debug!("permission refreshed for {}", self.peer),
            Err(err) => log::warn!("permission refresh for {} failed: {err}", self.peer),
        }
    }

    async fn refresh_binding(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(alloc) = self.allocation.upgrade() else {
            return;
        };
        let Some(client) = self.client.upgrade() else {
            return;
        };

        let number = {
            let mut bindings = alloc.bindings.lock().await;
            match bindings.get_by_peer_mut(&self.peer) {
                Some(b) => {
                    b.state = BindingState::Refresh;
                    b.number
                }
                None => {
                    self.binding_timer.stop().await;
                    return;
                }
            }
        };

        let attrs: Vec<Box<dyn Setter + Send + Sync>> = vec![
            Box::new(ChannelNumber(number)),
            Box::new(self.peer_address()),
        ];
        match client
            .request(stun::message::METHOD_CHANNEL_BIND, attrs)
            .await
        {
            Ok(_) => {
                let mut bindings = alloc.bindings.lock().await;
                if let Some(b) = bindings.get_by_peer_mut(&self.peer) {
                    b.state = BindingState::Ready;
                    b.refreshed_at = Instant::now();
                }
            }
            Err(err) => {
                // The binding is gone; the conduit keeps working over
                // Send indications.
                log::warn!(
                    "channel bind refresh for {} failed: {err}; falling back to indications",
                    self.peer
                );
                alloc.bindings.lock().await.delete_by_peer(&self.peer);
                self.binding_timer.stop().await;
            }
        }
    }
}

#[async_trait]
impl PeriodicTimerTimeoutHandler for PermissionInner {
    async fn on_timeout(&self, id: TimerIdRefresh) {
        match id {
            TimerIdRefresh::Perm => self.refresh_permission().await,
            TimerIdRefresh::Binding => self.refresh_binding().await,
        }
    }
}

impl Permission {
    /// The peer this conduit reaches.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Receives one datagram relayed from the peer. A datagram longer
    /// than `buf` is truncated. Honors the read deadline.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let deadline = *self.inner.read_deadline.lock().await;
        let data = self.inner.queue.pop(deadline).await?;
        let n = std::cmp::min(buf.len(), data.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Relays `data` to the peer: as a ChannelData frame when a channel
    /// is bound, as a Send indication otherwise. Never waits on a STUN
    /// transaction.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        let client = self.inner.client.upgrade().ok_or(Error::ErrClientClosed)?;
        let deadline = *self.inner.write_deadline.lock().await;

        if let Some(number) = self.inner.bound_number().await {
            let mut ch_data = ChannelData {
                data: data.to_vec(),
                number: ChannelNumber(number),
                ..Default::default()
            };
            ch_data.encode();
            client.write_frame_deadline(&ch_data.raw, deadline).await?;
            return Ok(data.len());
        }

        let mut msg = Message::new();
        msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(METHOD_SEND, CLASS_INDICATION)),
            Box::new(Data(data.to_vec())),
            Box::new(self.inner.peer_address()),
            Box::new(FINGERPRINT),
        ])?;
        client.indicate_deadline(&msg, deadline).await?;
        Ok(data.len())
    }

    /// Sets the absolute deadline for pending and future reads. `None`
    /// disables it.
    pub async fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.inner.read_deadline.lock().await = deadline;
    }

    /// Sets the absolute deadline for future writes. `None` disables it.
    pub async fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.inner.write_deadline.lock().await = deadline;
    }

    /// Binds a channel to the peer, switching the write path to
    /// ChannelData framing. Fails with `ErrAlreadyBound` when a channel
    /// is already bound.
    pub async fn bind(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        let alloc = self
            .inner
            .allocation
            .upgrade()
            .ok_or(Error::ErrAllocationDead)?;
        let client = self.inner.client.upgrade().ok_or(Error::ErrClientClosed)?;

        let number = {
            let mut bindings = alloc.bindings.lock().await;
            bindings.create(self.inner.peer)?
        };

        let attrs: Vec<Box<dyn Setter + Send + Sync>> = vec![
            Box::new(ChannelNumber(number)),
            Box::new(self.inner.peer_address()),
        ];
        let result = client
            .request(stun::message::METHOD_CHANNEL_BIND, attrs)
            .await;

        match result {
            Ok(_) => {
                if self.inner.closed.load(Ordering::SeqCst) {
                    // Closed while the bind was in flight.
                    alloc.bindings.lock().await.delete_by_peer(&self.inner.peer);
                    return Err(Error::ErrClosed);
                }
                {
                    let mut bindings = alloc.bindings.lock().await;
                    if let Some(b) = bindings.get_by_peer_mut(&self.inner.peer) {
                        b.state = BindingState::Ready;
                        b.refreshed_at = Instant::now();
                    }
                }
                log::debug!(
                    "channel binding successful: {} 0x{number:x}",
                    self.inner.peer
                );
                self.inner
                    .binding_timer
                    .start(Arc::downgrade(&self.inner))
                    .await;
                Ok(())
            }
            Err(err) => {
                alloc.bindings.lock().await.delete_by_peer(&self.inner.peer);
                Err(err)
            }
        }
    }

    /// Reports whether a channel is currently bound to the peer.
    pub async fn bound(&self) -> bool {
        self.inner.bound_number().await.is_some()
    }

    /// The bound channel number, if any.
    pub async fn binding(&self) -> Option<u16> {
        self.inner.bound_number().await
    }

    /// Datagrams dropped from the inbound queue due to backpressure.
    pub fn dropped(&self) -> u64 {
        self.inner.queue.dropped()
    }

    /// Closes the conduit and detaches it from the allocation, releasing
    /// its channel binding. Idempotent; a blocked `read` wakes with
    /// `ErrClosed`.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(alloc) = self.inner.allocation.upgrade() {
            alloc.perms.lock().await.remove(&self.inner.peer);
            alloc.bindings.lock().await.delete_by_peer(&self.inner.peer);
        }
        self.inner.shutdown(CloseReason::Closed).await;
        Ok(())
    }
}
