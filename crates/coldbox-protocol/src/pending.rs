//! ---
//! cbx_section: "02-field-protocol"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "In-flight request table keyed by transaction id."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{LinkError, TransportError};

pub type Completion = oneshot::Sender<Result<Bytes, LinkError>>;
pub type CompletionReceiver = oneshot::Receiver<Result<Bytes, LinkError>>;

/// Handle to a registered request. The ticket distinguishes reuses of the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub transaction_id: u16,
    pub ticket: u64,
}

#[derive(Debug)]
struct PendingRequest {
    ticket: u64,
    issued_at: Instant,
    completion: Completion,
}

/// Requests awaiting a response. Each entry is completed at most once.
#[derive(Debug, Default)]
pub struct PendingTable {
    next_id: u16,
    next_ticket: u64,
    entries: HashMap<u16, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start allocation at `id`. Used to exercise the wraparound.
    pub fn starting_at(id: u16) -> Self {
        Self {
            next_id: id,
            ..Self::default()
        }
    }

    /// Allocate the next free transaction id, skipping ids that are still pending.
    pub fn register(&mut self, now: Instant) -> Result<(Slot, CompletionReceiver), TransportError> {
        let transaction_id = self.allocate().ok_or(TransportError::Saturated)?;
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        let (completion, receiver) = oneshot::channel();
        self.entries.insert(
            transaction_id,
            PendingRequest {
                ticket,
                issued_at: now,
                completion,
            },
        );
        Ok((
            Slot {
                transaction_id,
                ticket,
            },
            receiver,
        ))
    }

    /// Deliver a result to the waiter of `transaction_id`.
    ///
    /// Returns `false` when no such request is pending, in which case the result is dropped.
    pub fn complete(&mut self, transaction_id: u16, result: Result<Bytes, LinkError>) -> bool {
        match self.entries.remove(&transaction_id) {
            Some(entry) => {
                // The waiter may have given up between removal and send.
                let _ = entry.completion.send(result);
                true
            }
            None => false,
        }
    }

    /// Remove an abandoned request without completing it.
    pub fn abandon(&mut self, slot: Slot) -> bool {
        let owned = self
            .entries
            .get(&slot.transaction_id)
            .is_some_and(|entry| entry.ticket == slot.ticket);
        if owned {
            self.entries.remove(&slot.transaction_id);
        }
        owned
    }

    /// Fail every pending request with `error`. Returns how many were failed.
    pub fn fail_all(&mut self, error: TransportError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.completion.send(Err(error.clone().into()));
        }
        count
    }

    pub fn age_of(&self, transaction_id: u16, now: Instant) -> Option<std::time::Duration> {
        self.entries
            .get(&transaction_id)
            .map(|entry| now.saturating_duration_since(entry.issued_at))
    }

    pub fn contains(&self, transaction_id: u16) -> bool {
        self.entries.contains_key(&transaction_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn allocate(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX as u32 {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.entries.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_wrap_after_ffff() {
        let mut table = PendingTable::starting_at(0xFFFF);
        let now = Instant::now();
        let (last, mut last_rx) = table.register(now).unwrap();
        let (first, mut first_rx) = table.register(now).unwrap();
        assert_eq!(last.transaction_id, 0xFFFF);
        assert_eq!(first.transaction_id, 0x0000);
        assert_eq!(table.len(), 2);

        assert!(table.complete(0x0000, Ok(Bytes::from_static(&[0x03, 0x02, 0x00, 0x01]))));
        assert!(table.complete(0xFFFF, Ok(Bytes::from_static(&[0x03, 0x02, 0x00, 0x02]))));
        assert_eq!(first_rx.try_recv().unwrap().unwrap().as_ref(), &[0x03, 0x02, 0x00, 0x01]);
        assert_eq!(last_rx.try_recv().unwrap().unwrap().as_ref(), &[0x03, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn allocation_skips_ids_still_pending() {
        let mut table = PendingTable::starting_at(5);
        let now = Instant::now();
        let (held, _held_rx) = table.register(now).unwrap();
        assert_eq!(held.transaction_id, 5);
        table.next_id = 5;
        let (next, _next_rx) = table.register(now).unwrap();
        assert_eq!(next.transaction_id, 6);
    }

    #[test]
    fn completion_happens_once() {
        let mut table = PendingTable::new();
        let (slot, _rx) = table.register(Instant::now()).unwrap();
        assert!(table.complete(slot.transaction_id, Ok(Bytes::new())));
        assert!(!table.complete(slot.transaction_id, Ok(Bytes::new())));
    }

    #[test]
    fn abandon_ignores_stale_ticket() {
        let mut table = PendingTable::starting_at(1);
        let now = Instant::now();
        let (stale, _) = table.register(now).unwrap();
        assert!(table.abandon(stale));
        table.next_id = 1;
        let (fresh, _fresh_rx) = table.register(now).unwrap();
        assert_eq!(fresh.transaction_id, stale.transaction_id);
        assert!(!table.abandon(stale));
        assert!(table.contains(fresh.transaction_id));
    }

    #[test]
    fn fail_all_notifies_every_waiter() {
        let mut table = PendingTable::new();
        let now = Instant::now();
        let (_, mut a) = table.register(now).unwrap();
        let (_, mut b) = table.register(now).unwrap();
        assert_eq!(table.fail_all(TransportError::Disconnected), 2);
        assert!(table.is_empty());
        for rx in [&mut a, &mut b] {
            let err = rx.try_recv().unwrap().unwrap_err();
            assert_eq!(err, LinkError::Transport(TransportError::Disconnected));
        }
    }
}
