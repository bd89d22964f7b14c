use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tokio::time::{sleep, timeout};

use crate::queue::pending::{Outcome, TransactionId};

use super::session::Shared;
use super::{Error, Pdu, QueueError, Reason, UnitId, MODBUS_MAX_PDU_SIZE};

/// Issues requests over a session and correlates their responses.
///
/// Any number of transactions may be in flight for the same unit; they are told
/// apart purely by transaction id, bounded by the session's window.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    shared: Arc<Shared>,
}

impl TransactionManager {
    pub(crate) fn new(shared: Arc<Shared>) -> TransactionManager {
        TransactionManager { shared }
    }

    /// Submits one request and returns a handle to its outcome.
    ///
    /// Suspends while the window is full. The unit id and payload size are
    /// checked before anything is queued, so a refused request never reaches
    /// the wire.
    ///
    /// ```no_run
    /// # use std::time::Duration;
    /// # use modbus_tcp_master::prelude::*;
    /// # async fn docs(session: TransportSession) -> Result<(), Error> {
    /// let handle = session
    ///     .transactions()
    ///     .submit(1, 0x03, &[0x00, 0x00, 0x00, 0x02], Duration::from_secs(1))
    ///     .await?;
    /// let pdu = handle.wait().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn submit(
        &self,
        unit_id: u8,
        function: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<TransactionHandle, Error> {
        let unit_id = UnitId::new(unit_id)?;

        if 1 + payload.len() > MODBUS_MAX_PDU_SIZE {
            return Err(Reason::SendBufferTooBig(1 + payload.len()).into());
        }

        if self.shared.lock().closed || self.shared.window.is_closed() {
            return Err(self.shared.refusal());
        }

        let permit = Arc::clone(&self.shared.window)
            .acquire_owned()
            .await
            .map_err(|_| self.shared.refusal())?;

        let (id, receiver) = self
            .shared
            .enqueue(unit_id.get(), function, payload.to_vec(), 0)?;

        Ok(TransactionHandle {
            shared: Arc::clone(&self.shared),
            unit_id,
            function,
            payload: payload.to_vec(),
            timeout,
            id: Some(id),
            receiver,
            retransmissions: 0,
            _permit: permit,
        })
    }

    /// Transactions currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Free slots in the window.
    pub fn available(&self) -> usize {
        self.shared.window.available_permits()
    }
}

/// An outstanding transaction. Dropping it cancels the transaction and frees its
/// window slot.
#[derive(Debug)]
pub struct TransactionHandle {
    shared: Arc<Shared>,
    unit_id: UnitId,
    function: u8,
    payload: Vec<u8>,
    timeout: Duration,
    id: Option<TransactionId>,
    receiver: oneshot::Receiver<Outcome>,
    retransmissions: u32,
    _permit: OwnedSemaphorePermit,
}

impl TransactionHandle {
    /// The id of the latest attempt; a retransmission gets a fresh one.
    pub fn id(&self) -> Option<TransactionId> {
        self.id
    }

    pub fn unit_id(&self) -> UnitId {
        self.unit_id
    }

    pub fn retransmissions(&self) -> u32 {
        self.retransmissions
    }

    /// Waits for the response PDU, retransmitting after every timeout until the
    /// retry limit is spent.
    ///
    /// Exception responses surface as [`Error::Exception`] and are not retried.
    pub async fn wait(mut self) -> Result<Pdu, Error> {
        loop {
            let outcome = match timeout(self.timeout, &mut self.receiver).await {
                Ok(outcome) => outcome,
                Err(_) => match self.expire() {
                    Some(outcome) => Ok(outcome),
                    None => {
                        self.retransmit().await?;
                        continue;
                    }
                },
            };

            self.id = None;
            return match outcome {
                Ok(Ok(frame)) => frame.pdu.into_result(),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(QueueError::ResponderDropped.into()),
            };
        }
    }

    /// Removes the timed-out attempt. A response that won the race against the
    /// timer is returned instead.
    fn expire(&mut self) -> Option<Outcome> {
        let id = self.id.take()?;

        match self.shared.forget(id) {
            Some(pending) => {
                warn!(
                    "TxnID={id} for unit {} (attempt {}) timed out after {:?}",
                    self.unit_id,
                    pending.attempt() + 1,
                    pending.submitted_at().elapsed()
                );
                None
            }
            None => self.receiver.try_recv().ok(),
        }
    }

    async fn retransmit(&mut self) -> Result<(), Error> {
        let limit = self.shared.config.retry_limit;
        if self.retransmissions >= limit {
            debug!(
                "Unit {} function {:#04x} exhausted {limit} retransmission(s)",
                self.unit_id, self.function
            );
            return Err(Error::TransactionTimeout);
        }

        self.retransmissions += 1;
        sleep(self.shared.config.retry_backoff.delay(self.retransmissions)).await;

        let (id, receiver) = self.shared.enqueue(
            self.unit_id.get(),
            self.function,
            self.payload.clone(),
            self.retransmissions,
        )?;

        debug!(
            "Retransmitting unit {} request as TxnID={id} (retry {}/{limit})",
            self.unit_id, self.retransmissions
        );
        self.id = Some(id);
        self.receiver = receiver;

        Ok(())
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if self.shared.forget(id).is_some() {
                debug!("Cancelled TxnID={id} for unit {}", self.unit_id);
            }
        }
    }
}
