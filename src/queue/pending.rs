use std::collections::HashMap;
use std::time::Instant;

use log::debug;
use tokio::sync::oneshot;

use crate::core::modbus::{Error, Frame, QueueError, EXCEPTION_FLAG};

pub type TransactionId = u16;

/// The result delivered to whoever submitted a transaction.
pub type Outcome = Result<Frame, Error>;

/// A request that has been issued but not yet answered.
#[derive(Debug)]
pub struct PendingTransaction {
    frame: Frame,
    attempt: u32,
    submitted_at: Instant,
    sequence: u64,
    sent: bool,
    responder: oneshot::Sender<Outcome>,
}

impl PendingTransaction {
    pub fn new(frame: Frame, attempt: u32) -> (PendingTransaction, oneshot::Receiver<Outcome>) {
        let (responder, receiver) = oneshot::channel();

        let pending = PendingTransaction {
            frame,
            attempt,
            submitted_at: Instant::now(),
            sequence: 0,
            sent: false,
            responder,
        };

        (pending, receiver)
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn unit_id(&self) -> u8 {
        self.frame.unit_id()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn mark_sent(&mut self) {
        self.sent = true;
    }

    fn resolve(self, outcome: Outcome) {
        // The receiver is gone when its handle was dropped mid-flight.
        if self.responder.send(outcome).is_err() {
            debug!(
                "Submitter of TxnID={} went away before resolution",
                self.frame.transaction_id()
            );
        }
    }
}

/// What became of an inbound frame offered to the table.
#[derive(Debug, PartialEq, Eq)]
pub enum Resolution {
    Resolved,
    /// Known id, but the reply names another unit or function.
    Mismatched,
    Unknown,
}

/// Outstanding transactions keyed by transaction id, with the id allocator.
#[derive(Debug, Default)]
pub struct PendingTable {
    last_id: TransactionId,
    sequence: u64,
    entries: HashMap<TransactionId, PendingTransaction>,
}

impl PendingTable {
    pub fn new() -> PendingTable {
        PendingTable::default()
    }

    /// Hands out the next free transaction id. Ids count upwards, wrap at 65536
    /// and skip 0 as well as every id still in flight.
    pub fn allocate(&mut self) -> Result<TransactionId, Error> {
        for _ in 0..u16::MAX {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id == 0 {
                self.last_id = 1;
            }

            if !self.entries.contains_key(&self.last_id) {
                return Ok(self.last_id);
            }
        }

        Err(QueueError::TransactionsExhausted.into())
    }

    pub fn insert(&mut self, mut pending: PendingTransaction) {
        self.sequence += 1;
        pending.sequence = self.sequence;
        self.entries.insert(pending.frame.transaction_id(), pending);
    }

    pub fn remove(&mut self, id: TransactionId) -> Option<PendingTransaction> {
        self.entries.remove(&id)
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids currently in flight for `unit_id`, in ascending order.
    pub fn ids_for(&self, unit_id: u8) -> Vec<TransactionId> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.unit_id() == unit_id)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Matches an inbound frame to its transaction. Unknown ids leave the table
    /// untouched.
    pub fn resolve(&mut self, frame: Frame) -> Resolution {
        let id = frame.transaction_id();

        let Some(pending) = self.entries.remove(&id) else {
            return Resolution::Unknown;
        };

        let function = frame.pdu.function & !EXCEPTION_FLAG;
        let matches = pending.unit_id() == frame.unit_id() && pending.frame.pdu.function == function;

        if matches {
            pending.resolve(Ok(frame));
            Resolution::Resolved
        } else {
            pending.resolve(Err(Error::InvalidResponse));
            Resolution::Mismatched
        }
    }

    /// Resolves every transaction with a fresh error from `error`.
    pub fn fail_all(&mut self, error: impl Fn() -> Error) -> usize {
        let drained: Vec<_> = self.entries.drain().map(|(_, pending)| pending).collect();
        let count = drained.len();

        for pending in drained {
            pending.resolve(Err(error()));
        }

        count
    }

    /// Marks every entry as not yet written so it is replayed on the next link.
    pub fn mark_all_unsent(&mut self) {
        self.entries.values_mut().for_each(|pending| pending.sent = false);
    }

    /// Frames that still need writing, oldest first. They are marked as sent.
    pub fn take_unsent(&mut self) -> Vec<Frame> {
        let mut unsent: Vec<_> = self
            .entries
            .values_mut()
            .filter(|pending| !pending.sent)
            .collect();
        unsent.sort_by_key(|pending| pending.sequence);

        unsent
            .into_iter()
            .map(|pending| {
                pending.sent = true;
                pending.frame.clone()
            })
            .collect()
    }
}
