
pub mod allocation;
pub mod binding;
pub mod periodic_timer;
pub mod permission;
pub mod transaction;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stun::agent::TransactionId;
use stun::attributes::{
    ATTR_MESSAGE_INTEGRITY, ATTR_NONCE, ATTR_REALM, ATTR_SOFTWARE, ATTR_USERNAME,
};
use stun::error_code::{ErrorCodeAttribute, CODE_STALE_NONCE, CODE_UNAUTHORIZED};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{
    is_message, Getter, Message, MessageType, Method, Setter, CLASS_ERROR_RESPONSE,
    CLASS_INDICATION, CLASS_REQUEST, METHOD_ALLOCATE, METHOD_BINDING, METHOD_DATA,
};
use stun::textattrs::{Nonce, Realm, Software, TextAttribute};
use stun::xoraddr::XorMappedAddress;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::client::allocation::AllocationInner;
use crate::client::permission::CloseReason;
use crate::client::transaction::{TransactionMap, Transactor};
use crate::error::{Error, Result};
use crate::proto::chandata::ChannelData;
use crate::proto::data::Data;
use crate::proto::lifetime::{Lifetime, DEFAULT_LIFETIME};
use crate::proto::peeraddr::PeerAddress;
use crate::proto::relayaddr::RelayedAddress;
use crate::proto::reqtrans::RequestedTransport;
use crate::proto::PROTO_UDP;
use crate::transport::Transport;

pub use allocation::{Allocation, PeerAddr};
pub use permission::Permission;
pub use transaction::StunClient;

pub(crate) const DEFAULT_RTO: Duration = Duration::from_millis(100);
// Message size limit for Chromium.
pub(crate) const MAX_DATA_BUFFER_SIZE: usize = u16::MAX as usize;

// Permissions expire after 5 minutes; refresh one minute early.
pub(crate) const PERM_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60);
// Channel bindings expire after 10 minutes; refresh one minute early.
pub(crate) const BINDING_LIFETIME: Duration = Duration::from_secs(10 * 60);
pub(crate) const BINDING_REFRESH_INTERVAL: Duration = Duration::from_secs(9 * 60);

/// ClientConfig is a bag of config parameters for [`Client`].
///
/// Either `transport` or `stun` must be provided. With only `stun`, the
/// client performs every exchange through the injected transactor and
/// cannot use ChannelData framing.
#[derive(Default)]
pub struct ClientConfig {
    /// Shared frame-oriented stream to the TURN server.
    pub transport: Option<Arc<dyn Transport + Send + Sync>>,
    /// Injected STUN transactor; overrides the built-in one.
    pub stun: Option<Arc<dyn StunClient + Send + Sync>>,
    /// Long-term credentials.
    pub username: String,
    pub password: String,
    /// Pre-seeded realm; usually learned from the first 401 instead.
    pub realm: String,
    /// SOFTWARE attribute attached to outgoing requests when non-empty.
    pub software: String,
    /// Initial retransmission timeout; zero means the 100 ms default.
    pub rto: Duration,
    /// Suppresses retransmission, for transports that are reliable.
    pub no_retransmit: bool,
    /// Allocation refresh period; zero means half the server lifetime.
    pub refresh_rate: Duration,
    /// Disables allocation refresh entirely.
    pub refresh_disabled: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RefreshPolicy {
    Disabled,
    HalfLifetime,
    Every(Duration),
}

// Long-term credential state, fed by 401/438 challenges.
struct AuthState {
    realm: Option<Realm>,
    nonce: Option<Nonce>,
    integrity: Option<MessageIntegrity>,
}

/// Client is a TURN client over one shared server connection.
///
/// It multiplexes STUN transactions, Send/Data indications and
/// ChannelData frames onto the transport, and demultiplexes inbound
/// frames back to pending transactions and per-peer conduits.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    transport: Option<Arc<dyn Transport + Send + Sync>>,
    stun: Arc<dyn StunClient + Send + Sync>,
    username: String,
    password: String,
    software: String,
    pub(crate) refresh_policy: RefreshPolicy,
    auth: Mutex<AuthState>,
    pub(crate) tr_map: Arc<Mutex<TransactionMap>>,
    write_mutex: Arc<Mutex<()>>,
    pub(crate) allocation: Mutex<Option<Arc<AllocationInner>>>,
    pub(crate) closed: AtomicBool,
    reader_close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Client {
    /// Creates a new client and, when a transport is present, starts the
    /// demultiplexing reader over it.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        let tr_map = Arc::new(Mutex::new(TransactionMap::new()));
        let write_mutex = Arc::new(Mutex::new(()));
        let rto = if config.rto == Duration::ZERO {
            DEFAULT_RTO
        } else {
            config.rto
        };

        let stun: Arc<dyn StunClient + Send + Sync> = match (&config.stun, &config.transport) {
            (Some(stun), _) => Arc::clone(stun),
            (None, Some(transport)) => Arc::new(Transactor::new(
                Arc::clone(transport),
                Arc::clone(&write_mutex),
                Arc::clone(&tr_map),
                rto,
                config.no_retransmit,
            )),
            (None, None) => return Err(Error::ErrNoTransport),
        };

        let refresh_policy = if config.refresh_disabled {
            RefreshPolicy::Disabled
        } else if config.refresh_rate == Duration::ZERO {
            RefreshPolicy::HalfLifetime
        } else {
            RefreshPolicy::Every(config.refresh_rate)
        };

        let realm = if config.realm.is_empty() {
            None
        } else {
            Some(Realm::new(ATTR_REALM, config.realm))
        };

        let inner = Arc::new(ClientInner {
            transport: config.transport.clone(),
            stun,
            username: config.username,
            password: config.password,
            software: config.software,
            refresh_policy,
            auth: Mutex::new(AuthState {
                realm,
                nonce: None,
                integrity: None,
            }),
            tr_map,
            write_mutex,
            allocation: Mutex::new(None),
            closed: AtomicBool::new(false),
            reader_close_tx: Mutex::new(None),
        });

        if let Some(transport) = config.transport {
            let (close_tx, close_rx) = mpsc::channel::<()>(1);
            *inner.reader_close_tx.lock().await = Some(close_tx);
            spawn_reader(&inner, transport, close_rx);
        }

        Ok(Client { inner })
    }

    /// Requests a relayed transport address from the server, driving the
    /// long-term credential handshake when challenged.
    pub async fn allocate(&self) -> Result<Allocation> {
        let inner = &self.inner;
        {
            let slot = inner.allocation.lock().await;
            if slot.is_some() {
                return Err(Error::ErrOneAllocateOnly);
            }
        }

        let attrs: Vec<Box<dyn Setter + Send + Sync>> = vec![Box::new(RequestedTransport {
            protocol: PROTO_UDP,
        })];
        let res = inner.request(METHOD_ALLOCATE, attrs).await?;

        let mut relayed = RelayedAddress::default();
        relayed
            .get_from(&res)
            .map_err(|_| Error::ErrMalformedResponse)?;
        let relayed_addr = SocketAddr::new(relayed.ip, relayed.port);

        let mut refl = XorMappedAddress::default();
        let reflexive = match refl.get_from(&res) {
            Ok(()) => Some(SocketAddr::new(refl.ip, refl.port)),
            Err(stun::Error::ErrAttributeNotFound) => None,
            Err(_) => return Err(Error::ErrMalformedResponse),
        };

        let mut lifetime = Lifetime(DEFAULT_LIFETIME);
        match lifetime.get_from(&res) {
            Ok(()) => {}
            Err(stun::Error::ErrAttributeNotFound) => lifetime = Lifetime(DEFAULT_LIFETIME),
            Err(_) => return Err(Error::ErrMalformedResponse),
        }

        let alloc = Arc::new(AllocationInner::new(
            Arc::downgrade(inner),
            relayed_addr,
            reflexive,
            lifetime.0,
        ));
        {
            let mut slot = inner.allocation.lock().await;
            if slot.is_some() {
                return Err(Error::ErrOneAllocateOnly);
            }
            *slot = Some(Arc::clone(&alloc));
        }
        AllocationInner::start_refresh(&alloc, inner.refresh_policy).await;

        log::debug!(
            "allocated relay address {relayed_addr}, lifetime {}s",
            lifetime.0.as_secs()
        );
        Ok(Allocation { inner: alloc })
    }

    /// Performs a plain STUN Binding round-trip and returns the
    /// server-reflexive address.
    pub async fn send_binding_request(&self) -> Result<SocketAddr> {
        let res = self.inner.request(METHOD_BINDING, vec![]).await?;
        let mut refl = XorMappedAddress::default();
        refl.get_from(&res)
            .map_err(|_| Error::ErrMalformedResponse)?;
        Ok(SocketAddr::new(refl.ip, refl.port))
    }

    /// Shuts the client down: deregisters the allocation, cancels every
    /// pending transaction with `ErrCanceled`, stops the reader and
    /// closes the transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let alloc = { self.inner.allocation.lock().await.take() };
        if let Some(alloc) = alloc {
            alloc.shutdown(CloseReason::Closed, true).await;
        }

        self.inner
            .tr_map
            .lock()
            .await
            .fail_all(|| Error::ErrCanceled);
        {
            self.inner.reader_close_tx.lock().await.take();
        }
        if let Some(transport) = &self.inner.transport {
            let _ = transport.close().await;
        }
        Ok(())
    }
}

fn spawn_reader(
    inner: &Arc<ClientInner>,
    transport: Arc<dyn Transport + Send + Sync>,
    mut close_rx: mpsc::Receiver<()>,
) {
    // The reader holds a weak handle so an abandoned client shuts its
    // task down instead of being kept alive by it.
    let inner = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATA_BUFFER_SIZE];
        loop {
            let n = tokio::select! {
                _ = close_rx.recv() => break,
                res = transport.recv(&mut buf) => match res {
                    Ok(n) => n,
                    Err(err) => {
                        if let Some(inner) = inner.upgrade() {
                            inner.on_connection_lost(err).await;
                        }
                        break;
                    }
                },
            };

            let Some(inner) = inner.upgrade() else { break };
            if let Err(err) = inner.handle_inbound(&buf[..n]).await {
                log::warn!("failed to handle inbound frame: {err}");
            }
        }
    });
}

impl ClientInner {
    // Demultiplexes one inbound frame by its leading bits: STUN message,
    // ChannelData, or neither. Parse failures are surfaced to the reader
    // loop for logging, never to callers.
    pub(crate) async fn handle_inbound(&self, data: &[u8]) -> Result<()> {
        if is_message(data) {
            self.handle_stun_message(data).await
        } else if ChannelData::is_channel_data(data) {
            self.handle_channel_data(data).await
        } else {
            log::trace!("non-STUN/TURN frame dropped ({} bytes)", data.len());
            Ok(())
        }
    }

    async fn handle_stun_message(&self, data: &[u8]) -> Result<()> {
        let mut msg = Message::new();
        msg.raw = data.to_vec();
        msg.decode()?;

        if msg.typ.class == CLASS_REQUEST {
            return Err(Error::ErrUnexpectedStunRequest);
        }

        if msg.typ.class == CLASS_INDICATION {
            if msg.typ.method == METHOD_DATA {
                let mut peer_addr = PeerAddress::default();
                peer_addr.get_from(&msg)?;
                let from = SocketAddr::new(peer_addr.ip, peer_addr.port);

                let mut data = Data::default();
                data.get_from(&msg)?;

                log::debug!("data indication received from {from}");
                self.route_to_permission(from, data.0).await;
            } else {
                log::trace!("unhandled indication {}", msg.typ);
            }
            return Ok(());
        }

        // Success or error response; hand it to the pending transaction.
        let transaction_id = msg.transaction_id;
        let delivered = { self.tr_map.lock().await.deliver(msg) };
        if !delivered {
            log::debug!("no pending transaction for response {transaction_id:?}, dropped");
        }
        Ok(())
    }

    async fn handle_channel_data(&self, data: &[u8]) -> Result<()> {
        let mut ch_data = ChannelData {
            raw: data.to_vec(),
            ..Default::default()
        };
        ch_data.decode()?;

        let alloc = { self.allocation.lock().await.clone() };
        let Some(alloc) = alloc else {
            return Err(Error::ErrChannelBindNotFound);
        };
        let peer = {
            alloc
                .bindings
                .lock()
                .await
                .find_by_number(ch_data.number.0)
                .map(|b| b.peer)
        };
        let Some(peer) = peer else {
            return Err(Error::ErrChannelBindNotFound);
        };

        log::trace!("channel data received from {peer} (ch={})", ch_data.number);
        self.route_to_permission(peer, ch_data.data).await;
        Ok(())
    }

    async fn route_to_permission(&self, peer: SocketAddr, data: Vec<u8>) {
        let alloc = { self.allocation.lock().await.clone() };
        let Some(alloc) = alloc else {
            log::debug!("inbound data from {peer} without an allocation, dropped");
            return;
        };
        let perm = { alloc.perms.lock().await.get(&peer).cloned() };
        match perm {
            Some(perm) => perm.queue.push(data).await,
            None => log::debug!("no permission for inbound data from {peer}, dropped"),
        }
    }

    // A transport read error is fatal: every pending transaction and
    // conduit resolves with ErrConnectionLost and the client goes dead.
    pub(crate) async fn on_connection_lost(&self, err: Error) {
        log::warn!("transport read failed: {err}");
        self.closed.store(true, Ordering::SeqCst);
        self.tr_map
            .lock()
            .await
            .fail_all(|| Error::ErrConnectionLost);
        let alloc = { self.allocation.lock().await.take() };
        if let Some(alloc) = alloc {
            alloc.shutdown(CloseReason::ConnectionLost, false).await;
        }
    }

    // Builds a request: caller attributes, then SOFTWARE, then the
    // credential attributes once the auth state holds a key, with
    // FINGERPRINT always last.
    async fn build_request(&self, method: Method, attrs: &[Box<dyn Setter + Send + Sync>]) -> Result<Message> {
        let mut msg = Message::new();
        msg.build(&[
            Box::new(TransactionId::new()),
            Box::new(MessageType::new(method, CLASS_REQUEST)),
        ])?;
        for attr in attrs {
            attr.add_to(&mut msg)?;
        }
        if !self.software.is_empty() {
            Software::new(ATTR_SOFTWARE, self.software.clone()).add_to(&mut msg)?;
        }
        {
            let auth = self.auth.lock().await;
            if let Some(integrity) = &auth.integrity {
                TextAttribute::new(ATTR_USERNAME, self.username.clone()).add_to(&mut msg)?;
                if let Some(realm) = &auth.realm {
                    realm.add_to(&mut msg)?;
                }
                if let Some(nonce) = &auth.nonce {
                    nonce.add_to(&mut msg)?;
                }
                integrity.add_to(&mut msg)?;
            }
        }
        FINGERPRINT.add_to(&mut msg)?;
        Ok(msg)
    }

    pub(crate) async fn request(
        &self,
        method: Method,
        attrs: Vec<Box<dyn Setter + Send + Sync>>,
    ) -> Result<Message> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ErrClientClosed);
        }
        self.request_unchecked(method, attrs).await
    }

    // The request driver, also reachable during shutdown for the final
    // Refresh(lifetime=0). At most one automatic reissue per call: a
    // 401/438 challenge is absorbed once, a second one is fatal.
    pub(crate) async fn request_unchecked(
        &self,
        method: Method,
        attrs: Vec<Box<dyn Setter + Send + Sync>>,
    ) -> Result<Message> {
        let msg = self.build_request(method, &attrs).await?;
        let mut res = self.stun.perform_transaction(&msg).await?;

        if res.typ.class == CLASS_ERROR_RESPONSE && self.absorb_challenge(&res).await {
            let msg = self.build_request(method, &attrs).await?;
            res = self.stun.perform_transaction(&msg).await?;
        }

        if res.typ.class == CLASS_ERROR_RESPONSE {
            return Err(response_error(&res));
        }

        self.verify_response(&res).await?;
        Ok(res)
    }

    // Absorbs a 401/438 challenge: remembers REALM and NONCE and derives
    // the long-term integrity key. Returns false when the response is
    // not a challenge we can answer, leaving it to surface as a server
    // error.
    async fn absorb_challenge(&self, res: &Message) -> bool {
        let mut code = ErrorCodeAttribute::default();
        if code.get_from(res).is_err() {
            return false;
        }
        if code.code != CODE_UNAUTHORIZED && code.code != CODE_STALE_NONCE {
            return false;
        }
        if self.username.is_empty() {
            return false;
        }

        let Ok(nonce) = Nonce::get_from_as(res, ATTR_NONCE) else {
            return false;
        };

        let mut auth = self.auth.lock().await;
        match Realm::get_from_as(res, ATTR_REALM) {
            Ok(realm) => auth.realm = Some(realm),
            Err(_) => {
                if auth.realm.is_none() {
                    return false;
                }
            }
        }
        auth.nonce = Some(nonce);

        let realm_text = match &auth.realm {
            Some(realm) => realm.text.clone(),
            None => return false,
        };
        auth.integrity = Some(MessageIntegrity::new_long_term_integrity(
            self.username.clone(),
            realm_text,
            self.password.clone(),
        ));
        log::debug!("absorbed credential challenge ({})", code.code.0);
        true
    }

    // Once the credential handshake is engaged, a response carrying
    // MESSAGE-INTEGRITY must verify against our key.
    async fn verify_response(&self, res: &Message) -> Result<()> {
        let integrity = { self.auth.lock().await.integrity.clone() };
        if let Some(integrity) = integrity {
            if res.contains(ATTR_MESSAGE_INTEGRITY) {
                let mut msg = Message::new();
                msg.raw = res.raw.clone();
                msg.decode()?;
                integrity
                    .check(&mut msg)
                    .map_err(|_| Error::ErrIntegrityFailed)?;
            }
        }
        Ok(())
    }

    pub(crate) async fn indicate_deadline(
        &self,
        msg: &Message,
        deadline: Option<Instant>,
    ) -> Result<()> {
        match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(Error::ErrTimeout);
                }
                timeout(d - now, self.stun.indicate(msg))
                    .await
                    .map_err(|_| Error::ErrTimeout)?
            }
            None => self.stun.indicate(msg).await,
        }
    }

    pub(crate) async fn write_frame(&self, data: &[u8]) -> Result<()> {
        let Some(transport) = &self.transport else {
            return Err(Error::ErrNoTransport);
        };
        let _guard = self.write_mutex.lock().await;
        transport.send(data).await?;
        Ok(())
    }

    pub(crate) async fn write_frame_deadline(
        &self,
        data: &[u8],
        deadline: Option<Instant>,
    ) -> Result<()> {
        match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Err(Error::ErrTimeout);
                }
                timeout(d - now, self.write_frame(data))
                    .await
                    .map_err(|_| Error::ErrTimeout)?
            }
            None => self.write_frame(data).await,
        }
    }
}

// Converts an error response into the caller-visible error.
fn response_error(res: &Message) -> Error {
    let mut code = ErrorCodeAttribute::default();
    if code.get_from(res).is_err() {
        Error::Other(format!("{}", res.typ))
    } else {
        Error::ErrServer {
            code: code.code.0,
            reason: String::from_utf8_lossy(&code.reason).into_owned(),
        }
    }
}
