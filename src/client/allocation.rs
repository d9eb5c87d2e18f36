use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use stun::message::{Getter, Setter, METHOD_CREATE_PERMISSION, METHOD_REFRESH};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::client::binding::BindingManager;
use crate::client::permission::{CloseReason, Permission, PermissionInner};
use crate::client::{ClientInner, RefreshPolicy};
use crate::error::{Error, Result};
use crate::proto::lifetime::Lifetime;
use crate::proto::peeraddr::PeerAddress;

/// PeerAddr is a peer transport address accepted by
/// [`Allocation::create`]. Only UDP peers can be reached through a UDP
/// allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Udp(SocketAddr),
    Ip(IpAddr),
}

/// Allocation is a relay lease on the TURN server. It owns the
/// per-peer permissions and keeps the lease alive until closed.
#[derive(Clone)]
pub struct Allocation {
    pub(crate) inner: Arc<AllocationInner>,
}

pub(crate) struct AllocationInner {
    pub(crate) client: Weak<ClientInner>,
    pub(crate) relayed: SocketAddr,
    pub(crate) reflexive: Option<SocketAddr>,
    pub(crate) lifetime: Mutex<Duration>,
    refreshed_at: Mutex<Instant>,
    pub(crate) perms: Mutex<HashMap<SocketAddr, Arc<PermissionInner>>>,
    pub(crate) bindings: Mutex<BindingManager>,
    pub(crate) dead: AtomicBool,
    refresh_close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl AllocationInner {
    pub(crate) fn new(
        client: Weak<ClientInner>,
        relayed: SocketAddr,
        reflexive: Option<SocketAddr>,
        lifetime: Duration,
    ) -> Self {
        AllocationInner {
            client,
            relayed,
            reflexive,
            lifetime: Mutex::new(lifetime),
            refreshed_at: Mutex::new(Instant::now()),
            perms: Mutex::new(HashMap::new()),
            bindings: Mutex::new(BindingManager::new()),
            dead: AtomicBool::new(false),
            refresh_close_tx: Mutex::new(None),
        }
    }

    // Spawns the keep-alive task. With the default policy the interval
    // follows half the server-declared lifetime, so a LIFETIME update in
    // a Refresh response reschedules the next tick.
    pub(crate) async fn start_refresh(this: &Arc<Self>, policy: RefreshPolicy) {
        if policy == RefreshPolicy::Disabled {
            return;
        }

        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);
        {
            let mut slot = this.refresh_close_tx.lock().await;
            if slot.is_some() {
                return;
            }
            *slot = Some(close_tx);
        }

        let this = Arc::downgrade(this);
        tokio::spawn(async move {
            loop {
                let interval = {
                    let Some(alloc) = this.upgrade() else { break };
                    match policy {
                        RefreshPolicy::Every(d) => d,
                        _ => *alloc.lifetime.lock().await / 2,
                    }
                };
                tokio::select! {
                    _ = sleep(interval) => {
                        let Some(alloc) = this.upgrade() else { break };
                        if alloc.dead.load(Ordering::SeqCst) {
                            break;
                        }
                        alloc.refresh_with_backoff().await;
                        if alloc.dead.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });
    }

    // Sends one Refresh and records the server's LIFETIME answer.
    pub(crate) async fn refresh(&self, lifetime: Duration) -> Result<()> {
        let client = self.client.upgrade().ok_or(Error::ErrClientClosed)?;
        let attrs: Vec<Box<dyn Setter + Send + Sync>> = vec![Box::new(Lifetime(lifetime))];
        let res = client.request(METHOD_REFRESH, attrs).await?;

        let mut updated = Lifetime::default();
        if updated.get_from(&res).is_ok() {
            *self.lifetime.lock().await = updated.0;
        }
        Ok(())
    }

    // Keep-alive with exponential backoff. Retries fit inside what is
    // left of the lease; once that budget is gone the allocation is dead.
    async fn refresh_with_backoff(&self) {
        let lifetime = *self.lifetime.lock().await;
        let expiry = *self.refreshed_at.lock().await + lifetime;
        let mut backoff = Duration::from_secs(1);

        loop {
            match self.refresh(lifetime).await {
                Ok(()) => {
                    *self.refreshed_at.lock().await = Instant::now();
                    return;
                }
                Err(err) => {
                    log::warn!("allocation refresh failed: {err}");
                    if Instant::now() + backoff >= expiry {
                        log::error!("allocation expired after repeated refresh failures");
                        self.mark_dead().await;
                        return;
                    }
                    sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    async fn mark_dead(&self) {
        if let Some(client) = self.client.upgrade() {
            client.allocation.lock().await.take();
        }
        self.shutdown(CloseReason::Closed, false).await;
    }

    // Tears the lease down. `deregister` sends a best-effort
    // Refresh(lifetime=0) so the server can release the port early.
    pub(crate) async fn shutdown(&self, reason: CloseReason, deregister: bool) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            self.refresh_close_tx.lock().await.take();
        }

        if deregister {
            if let Some(client) = self.client.upgrade() {
                let attrs: Vec<Box<dyn Setter + Send + Sync>> = vec![Box::new(Lifetime(Duration::ZERO))];
                if let Err(err) = client.request_unchecked(METHOD_REFRESH, attrs).await {
                    log::debug!("allocation deregistration failed: {err}");
                }
            }
        }

        let perms: Vec<Arc<PermissionInner>> =
            { self.perms.lock().await.drain().map(|(_, p)| p).collect() };
        for perm in perms {
            perm.shutdown(reason).await;
        }
        self.bindings.lock().await.clear();
    }
}

impl Allocation {
    /// The relayed transport address the server allocated.
    pub fn relayed_addr(&self) -> SocketAddr {
        self.inner.relayed
    }

    /// The client's server-reflexive address, when the server reported
    /// one.
    pub fn reflexive_addr(&self) -> Option<SocketAddr> {
        self.inner.reflexive
    }

    /// The current server-declared lease lifetime.
    pub async fn lifetime(&self) -> Duration {
        *self.inner.lifetime.lock().await
    }

    /// Opens a conduit to `peer`, dispatching on the address kind.
    pub async fn create(&self, peer: PeerAddr) -> Result<Permission> {
        match peer {
            PeerAddr::Udp(addr) => self.create_udp(addr).await,
            PeerAddr::Ip(_) => Err(Error::ErrUnsupportedPeerType),
        }
    }

    /// Installs a server-side permission for the UDP peer and returns
    /// the conduit for it.
    pub async fn create_udp(&self, peer: SocketAddr) -> Result<Permission> {
        let inner = &self.inner;
        if inner.dead.load(Ordering::SeqCst) {
            return Err(Error::ErrAllocationDead);
        }
        let client = inner.client.upgrade().ok_or(Error::ErrClientClosed)?;

        {
            let perms = inner.perms.lock().await;
            if perms.contains_key(&peer) {
                return Err(Error::ErrPermissionExists);
            }
        }

        let attrs: Vec<Box<dyn Setter + Send + Sync>> = vec![Box::new(PeerAddress {
            ip: peer.ip(),
            port: peer.port(),
        })];
        client.request(METHOD_CREATE_PERMISSION, attrs).await?;

        let perm_inner = Arc::new(PermissionInner::new(
            peer,
            inner.client.clone(),
            Arc::downgrade(inner),
        ));
        {
            let mut perms = inner.perms.lock().await;
            if inner.dead.load(Ordering::SeqCst) {
                return Err(Error::ErrAllocationDead);
            }
            if perms.contains_key(&peer) {
                return Err(Error::ErrPermissionExists);
            }
            perms.insert(peer, Arc::clone(&perm_inner));
        }
        PermissionInner::start_refresh(&perm_inner).await;

        log::debug!("permission created for {peer}");
        Ok(Permission { inner: perm_inner })
    }

    /// Releases the lease: stops refresh, closes every permission, and
    /// tells the server to drop the allocation. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if let Some(client) = self.inner.client.upgrade() {
            let mut slot = client.allocation.lock().await;
            if let Some(current) = slot.as_ref() {
                if Arc::ptr_eq(current, &self.inner) {
                    slot.take();
                }
            }
        }
        self.inner.shutdown(CloseReason::Closed, true).await;
        Ok(())
    }
}
