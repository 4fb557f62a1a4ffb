use crate::ledger::NumberLedger;
use notary_common::{BoxHash, NotaryError, NotaryId, NymId, RequestNumber, TransactionNumber};
use serde::{Deserialize, Serialize};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The consensus object for one (nym, notary) pair. Exactly one instance
/// exists per pair; concurrent operations against the same pair serialize
/// their ledger mutations on the write lock while membership checks share the
/// read lock. Ledger mutation itself never blocks on I/O.
#[derive(Debug)]
pub struct SessionContext {
    nym_id: NymId,
    notary_id: NotaryId,
    ledger: RwLock<NumberLedger>,
}

/// Canonical snapshot of a session, used for persistence and for
/// cross-checking state with the server. Restoring a snapshot reproduces an
/// equivalent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub nym_id: NymId,
    pub notary_id: NotaryId,
    pub ledger: NumberLedger,
}

impl SessionContext {
    pub fn new(nym_id: NymId, notary_id: NotaryId) -> Self {
        SessionContext {
            nym_id,
            notary_id,
            ledger: RwLock::new(NumberLedger::new()),
        }
    }

    pub fn restore(snapshot: SessionSnapshot) -> Self {
        SessionContext {
            nym_id: snapshot.nym_id,
            notary_id: snapshot.notary_id,
            ledger: RwLock::new(snapshot.ledger),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            nym_id: self.nym_id,
            notary_id: self.notary_id,
            ledger: self.read().clone(),
        }
    }

    pub fn nym_id(&self) -> NymId {
        self.nym_id
    }

    pub fn notary_id(&self) -> NotaryId {
        self.notary_id
    }

    // Poisoning only happens if a holder panicked mid-mutation; the ledger
    // stays structurally valid, so keep going with the inner value.
    fn read(&self) -> RwLockReadGuard<'_, NumberLedger> {
        self.ledger.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, NumberLedger> {
        self.ledger.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reserve_opening_number(&self) -> Result<TransactionNumber, NotaryError> {
        self.write().reserve()
    }

    /// Same pool as opening numbers; some instruments need a second number to
    /// close an account-side receipt independently.
    pub fn reserve_closing_number(&self) -> Result<TransactionNumber, NotaryError> {
        self.write().reserve()
    }

    pub fn recover(&self, number: TransactionNumber) {
        self.write().recover(number)
    }

    pub fn close(&self, number: TransactionNumber) {
        self.write().close(number)
    }

    pub fn mark_open(&self, number: TransactionNumber) -> Result<(), NotaryError> {
        self.write().mark_open(number)
    }

    pub fn accept_issued_numbers(&self, batch: &[TransactionNumber]) -> Vec<TransactionNumber> {
        self.write().accept_issued(batch)
    }

    pub fn increment_request(&self) -> RequestNumber {
        self.write().increment_request()
    }

    pub fn observe_request_floor(&self, floor: RequestNumber) {
        self.write().observe_request_floor(floor)
    }

    pub fn add_acknowledged_number(&self, request: RequestNumber) {
        self.write().add_acknowledged(request)
    }

    pub fn remove_acknowledged_numbers(&self, requests: &[RequestNumber]) {
        self.write().remove_acknowledged(requests)
    }

    pub fn acknowledged_list(&self) -> Vec<RequestNumber> {
        self.read().acknowledged_list()
    }

    pub fn verify_issued(&self, number: TransactionNumber) -> bool {
        self.read().verify_issued(number)
    }

    pub fn verify_available(&self, number: TransactionNumber) -> bool {
        self.read().verify_available(number)
    }

    pub fn verify_acknowledged(&self, request: RequestNumber) -> bool {
        self.read().verify_acknowledged(request)
    }

    pub fn verify_open(&self, number: TransactionNumber) -> bool {
        self.read().verify_open(number)
    }

    pub fn available_count(&self) -> usize {
        self.read().available_count()
    }

    pub fn set_local_box_hash(&self, hash: BoxHash) {
        self.write().set_local_box_hash(hash)
    }

    pub fn set_remote_box_hash(&self, hash: BoxHash) {
        self.write().set_remote_box_hash(hash)
    }

    pub fn local_box_hash(&self) -> BoxHash {
        self.read().local_box_hash()
    }

    pub fn box_hash_matches(&self) -> bool {
        self.read().box_hash_matches()
    }

    pub fn check_invariants(&self) -> Result<(), NotaryError> {
        self.read().check_invariants()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reachable_session() -> SessionContext {
        let session = SessionContext::new([1u8; 32], [2u8; 32]);
        session.accept_issued_numbers(&[5, 6, 7, 8]);
        let a = session.reserve_opening_number().unwrap();
        let b = session.reserve_closing_number().unwrap();
        session.close(a);
        session.mark_open(b).unwrap();
        session.increment_request();
        session.increment_request();
        session.add_acknowledged_number(1);
        session.set_local_box_hash([9u8; 32]);
        session.set_remote_box_hash([10u8; 32]);
        session
    }

    #[test]
    fn snapshot_round_trips() {
        let session = reachable_session();
        let snapshot = session.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: SessionSnapshot = serde_json::from_str(&json).unwrap();
        let restored = SessionContext::restore(decoded);
        assert_eq!(session.snapshot(), restored.snapshot());
        // Observable behavior matches too.
        assert_eq!(session.box_hash_matches(), restored.box_hash_matches());
        assert_eq!(
            session.increment_request(),
            restored.increment_request()
        );
    }

    #[test]
    fn opening_and_closing_reservations_share_the_pool() {
        let session = SessionContext::new([1u8; 32], [2u8; 32]);
        session.accept_issued_numbers(&[1, 2]);
        let open = session.reserve_opening_number().unwrap();
        let close = session.reserve_closing_number().unwrap();
        assert_ne!(open, close);
        assert!(matches!(
            session.reserve_opening_number(),
            Err(NotaryError::Exhausted)
        ));
        session.check_invariants().unwrap();
    }
}
