use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use stun::agent::TransactionId;
use stun::message::Message;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::transport::Transport;

// Total of 7 transmissions of one request (Rc from RFC 5389).
pub(crate) const MAX_RTX_COUNT: u16 = 7;
// A transaction is abandoned 39.5 RTO after the first transmission, the
// cumulative budget of the RFC 5389 schedule.
pub(crate) const MAX_TIMEOUT_FACTOR: f64 = 39.5;

/// StunClient is the narrow transactional capability the engine needs
/// from STUN: request/response matching with retransmission, plus
/// one-shot indications. Injectable, so tests can script the far end
/// and embedders can reuse an existing STUN agent.
#[async_trait]
pub trait StunClient {
    /// Sends a request and resolves exactly once with the matching
    /// response, `ErrTimeout`, `ErrCanceled`, or an I/O error.
    async fn perform_transaction(&self, msg: &Message) -> Result<Message>;

    /// Sends an indication; no response is tracked.
    async fn indicate(&self, msg: &Message) -> Result<()>;
}

// Transaction is one pending request awaiting its response.
pub(crate) struct Transaction {
    pub(crate) id: TransactionId,
    result_tx: mpsc::Sender<Result<Message>>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, result_tx: mpsc::Sender<Result<Message>>) -> Self {
        Transaction { id, result_tx }
    }

    pub(crate) fn write_result(&self, res: Result<Message>) -> bool {
        self.result_tx.try_send(res).is_ok()
    }
}

/// TransactionMap indexes pending transactions by id. The entry is
/// removed the moment its outcome is decided, so every request observes
/// exactly one of: response, timeout, cancellation, or I/O error.
#[derive(Default)]
pub(crate) struct TransactionMap {
    tr_map: HashMap<TransactionId, Transaction>,
}

impl TransactionMap {
    pub(crate) fn new() -> Self {
        TransactionMap {
            tr_map: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, tr: Transaction) {
        self.tr_map.insert(tr.id, tr);
    }

    pub(crate) fn delete(&mut self, id: &TransactionId) -> Option<Transaction> {
        self.tr_map.remove(id)
    }

    // Hands an inbound response to its pending transaction. Returns
    // false when no transaction matches the id.
    pub(crate) fn deliver(&mut self, msg: Message) -> bool {
        if let Some(tr) = self.tr_map.remove(&msg.transaction_id) {
            tr.write_result(Ok(msg));
            true
        } else {
            false
        }
    }

    // Fails every pending transaction, draining the map.
    pub(crate) fn fail_all<F>(&mut self, err: F)
    where
        F: Fn() -> Error,
    {
        for (_, tr) in self.tr_map.drain() {
            tr.write_result(Err(err()));
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.tr_map.len()
    }
}

/// Transactor is the built-in [`StunClient`] driving transactions over
/// the shared transport.
pub(crate) struct Transactor {
    transport: Arc<dyn Transport + Send + Sync>,
    write_mutex: Arc<Mutex<()>>,
    tr_map: Arc<Mutex<TransactionMap>>,
    rto: Duration,
    no_retransmit: bool,
}

impl Transactor {
    pub(crate) fn new(
        transport: Arc<dyn Transport + Send + Sync>,
        write_mutex: Arc<Mutex<()>>,
        tr_map: Arc<Mutex<TransactionMap>>,
        rto: Duration,
        no_retransmit: bool,
    ) -> Self {
        Transactor {
            transport,
            write_mutex,
            tr_map,
            rto,
            no_retransmit,
        }
    }

    // A frame is written under the write mutex so concurrent writers
    // never interleave bytes of two frames on a stream transport.
    async fn write_frame(&self, data: &[u8]) -> Result<()> {
        let _guard = self.write_mutex.lock().await;
        self.transport.send(data).await?;
        Ok(())
    }

    async fn abandon(&self, id: &TransactionId, err: Error) -> Error {
        self.tr_map.lock().await.delete(id);
        err
    }
}

#[async_trait]
impl StunClient for Transactor {
    async fn perform_transaction(&self, msg: &Message) -> Result<Message> {
        let (result_tx, mut result_rx) = mpsc::channel(1);
        {
            let mut tr_map = self.tr_map.lock().await;
            tr_map.insert(Transaction::new(msg.transaction_id, result_tx));
        }

        let raw = msg.raw.clone();
        if let Err(err) = self.write_frame(&raw).await {
            return Err(self.abandon(&msg.transaction_id, err).await);
        }

        let deadline = Instant::now() + self.rto.mul_f64(MAX_TIMEOUT_FACTOR);
        let mut interval = self.rto;
        let mut attempts: u16 = 1;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.abandon(&msg.transaction_id, Error::ErrTimeout).await);
            }
            let wait = if self.no_retransmit {
                deadline - now
            } else {
                std::cmp::min(interval, deadline - now)
            };

            match timeout(wait, result_rx.recv()).await {
                Ok(Some(result)) => return result,
                // The pending entry was dropped without a result.
                Ok(None) => return Err(Error::ErrCanceled),
                Err(_) => {
                    if self.no_retransmit || attempts >= MAX_RTX_COUNT {
                        return Err(self.abandon(&msg.transaction_id, Error::ErrTimeout).await);
                    }
                    attempts += 1;
                    interval *= 2;
                    log::trace!(
                        "retransmitting transaction {:?} (attempt {attempts})",
                        msg.transaction_id
                    );
                    if let Err(err) = self.write_frame(&raw).await {
                        return Err(self.abandon(&msg.transaction_id, err).await);
                    }
                }
            }
        }
    }

    async fn indicate(&self, msg: &Message) -> Result<()> {
        self.write_frame(&msg.raw).await
    }
}
