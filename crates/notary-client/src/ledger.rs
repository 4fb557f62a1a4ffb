use notary_common::{BoxHash, NotaryError, RequestNumber, TransactionNumber};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Acknowledged request numbers further than this below the highest one are
/// pruned on insert, keeping the ack set advertised to the notary bounded.
const ACK_WINDOW: u64 = 64;

/// Per-(nym, notary) number accounting: a pure set algebra with no I/O.
///
/// A number moves `available -> issued` only through [`reserve`], back
/// `issued -> available` only through [`recover`], out of `issued` for good
/// only through [`close`], and into `available` only through
/// [`accept_issued`]. `issued` and `available` stay disjoint throughout.
///
/// [`reserve`]: NumberLedger::reserve
/// [`recover`]: NumberLedger::recover
/// [`close`]: NumberLedger::close
/// [`accept_issued`]: NumberLedger::accept_issued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberLedger {
    issued: BTreeSet<TransactionNumber>,
    available: BTreeSet<TransactionNumber>,
    open_items: BTreeSet<TransactionNumber>,
    acknowledged: BTreeSet<RequestNumber>,
    /// Highest number ever accepted from a grant. Grants arrive as ascending
    /// ranges, so anything at or below this is a replay or a double grant,
    /// even when the number itself has since been closed.
    granted_watermark: TransactionNumber,
    next_request: RequestNumber,
    local_box_hash: BoxHash,
    remote_box_hash: BoxHash,
}

impl Default for NumberLedger {
    fn default() -> Self {
        NumberLedger {
            issued: BTreeSet::new(),
            available: BTreeSet::new(),
            open_items: BTreeSet::new(),
            acknowledged: BTreeSet::new(),
            granted_watermark: 0,
            // Request numbers start above the server's initial floor of 0.
            next_request: 1,
            local_box_hash: [0u8; 32],
            remote_box_hash: [0u8; 32],
        }
    }
}

impl NumberLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the smallest available number into `issued` and returns it.
    pub fn reserve(&mut self) -> Result<TransactionNumber, NotaryError> {
        let number = *self.available.iter().next().ok_or(NotaryError::Exhausted)?;
        self.available.remove(&number);
        self.issued.insert(number);
        Ok(number)
    }

    /// Rolls back a reservation whose request never took effect on the server.
    /// Idempotent: recovering a number that is not issued is a no-op.
    pub fn recover(&mut self, number: TransactionNumber) {
        if self.issued.remove(&number) {
            self.open_items.remove(&number);
            self.available.insert(number);
        }
    }

    /// Retires a number after the server confirmed final disposition of the
    /// item that used it. Never returns the number to `available`.
    pub fn close(&mut self, number: TransactionNumber) {
        self.issued.remove(&number);
        self.open_items.remove(&number);
    }

    /// Merges a server-granted batch into `available`, returning the numbers
    /// rejected because they are already tracked or fall under the grant
    /// watermark (a double grant, or a grant notice replayed after its
    /// numbers were consumed).
    pub fn accept_issued(&mut self, batch: &[TransactionNumber]) -> Vec<TransactionNumber> {
        let mut conflicts = Vec::new();
        let before = self.granted_watermark;
        let mut accepted_max = before;
        for &number in batch {
            if number <= before
                || self.issued.contains(&number)
                || self.available.contains(&number)
            {
                conflicts.push(number);
            } else {
                self.available.insert(number);
                accepted_max = accepted_max.max(number);
            }
        }
        self.granted_watermark = accepted_max;
        conflicts
    }

    /// Flags an issued number as backing a still-pending recurring item.
    pub fn mark_open(&mut self, number: TransactionNumber) -> Result<(), NotaryError> {
        if !self.issued.contains(&number) {
            return Err(NotaryError::InvariantViolation(format!(
                "number {number} marked open but not issued"
            )));
        }
        self.open_items.insert(number);
        Ok(())
    }

    /// Returns the next request number and advances the counter. Never
    /// decremented; every outbound message calls this exactly once.
    pub fn increment_request(&mut self) -> RequestNumber {
        let number = self.next_request;
        self.next_request += 1;
        number
    }

    /// Raises the counter above a floor the server reported, after a stale
    /// request rejection.
    pub fn observe_request_floor(&mut self, floor: RequestNumber) {
        if self.next_request <= floor {
            self.next_request = floor + 1;
        }
    }

    pub fn add_acknowledged(&mut self, request: RequestNumber) {
        self.acknowledged.insert(request);
        if let Some(&highest) = self.acknowledged.iter().next_back() {
            let cutoff = highest.saturating_sub(ACK_WINDOW);
            self.acknowledged.retain(|&r| r >= cutoff);
        }
    }

    pub fn remove_acknowledged(&mut self, requests: &[RequestNumber]) {
        for request in requests {
            self.acknowledged.remove(request);
        }
    }

    pub fn acknowledged_list(&self) -> Vec<RequestNumber> {
        self.acknowledged.iter().copied().collect()
    }

    pub fn verify_issued(&self, number: TransactionNumber) -> bool {
        self.issued.contains(&number)
    }

    pub fn verify_available(&self, number: TransactionNumber) -> bool {
        self.available.contains(&number)
    }

    pub fn verify_acknowledged(&self, request: RequestNumber) -> bool {
        self.acknowledged.contains(&request)
    }

    pub fn verify_open(&self, number: TransactionNumber) -> bool {
        self.open_items.contains(&number)
    }

    pub fn issued(&self) -> &BTreeSet<TransactionNumber> {
        &self.issued
    }

    pub fn available(&self) -> &BTreeSet<TransactionNumber> {
        &self.available
    }

    pub fn open_items(&self) -> &BTreeSet<TransactionNumber> {
        &self.open_items
    }

    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn set_local_box_hash(&mut self, hash: BoxHash) {
        self.local_box_hash = hash;
    }

    pub fn set_remote_box_hash(&mut self, hash: BoxHash) {
        self.remote_box_hash = hash;
    }

    pub fn local_box_hash(&self) -> BoxHash {
        self.local_box_hash
    }

    pub fn remote_box_hash(&self) -> BoxHash {
        self.remote_box_hash
    }

    /// Equality means the cached nymbox view is current.
    pub fn box_hash_matches(&self) -> bool {
        self.local_box_hash == self.remote_box_hash
    }

    /// A number in both `issued` and `available` is an accounting bug, not a
    /// recoverable runtime condition; it aborts the operation that finds it.
    pub fn check_invariants(&self) -> Result<(), NotaryError> {
        if let Some(number) = self.issued.intersection(&self.available).next() {
            return Err(NotaryError::InvariantViolation(format!(
                "number {number} both issued and available"
            )));
        }
        if let Some(number) = self.open_items.difference(&self.issued).next() {
            return Err(NotaryError::InvariantViolation(format!(
                "open item {number} not issued"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_moves_smallest_available_to_issued() {
        let mut ledger = NumberLedger::new();
        assert!(ledger.accept_issued(&[5, 6]).is_empty());
        assert_eq!(ledger.reserve().unwrap(), 5);
        assert!(ledger.verify_issued(5));
        assert!(!ledger.verify_available(5));
        assert!(ledger.verify_available(6));
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn reserve_on_empty_pool_is_exhausted() {
        let mut ledger = NumberLedger::new();
        assert!(matches!(ledger.reserve(), Err(NotaryError::Exhausted)));
    }

    #[test]
    fn happy_path_close_retires_the_number() {
        let mut ledger = NumberLedger::new();
        ledger.accept_issued(&[5, 6]);
        let n = ledger.reserve().unwrap();
        assert_eq!(n, 5);
        ledger.close(n);
        assert!(ledger.issued().is_empty());
        assert_eq!(ledger.available(), &BTreeSet::from([6]));
        // A closed number never returns to available.
        assert!(!ledger.verify_available(5));
    }

    #[test]
    fn failed_transmission_recovers_the_number() {
        let mut ledger = NumberLedger::new();
        ledger.accept_issued(&[7]);
        let n = ledger.reserve().unwrap();
        assert_eq!(n, 7);
        ledger.recover(n);
        assert!(ledger.issued().is_empty());
        assert_eq!(ledger.available(), &BTreeSet::from([7]));
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn recover_is_idempotent() {
        let mut ledger = NumberLedger::new();
        ledger.accept_issued(&[3]);
        ledger.reserve().unwrap();
        ledger.recover(3);
        let snapshot = ledger.clone();
        ledger.recover(3);
        assert_eq!(ledger, snapshot);
        // Recovering a number that was never issued is a no-op too.
        ledger.recover(99);
        assert_eq!(ledger, snapshot);
    }

    #[test]
    fn accept_issued_rejects_double_grants() {
        let mut ledger = NumberLedger::new();
        ledger.accept_issued(&[10, 11]);
        ledger.reserve().unwrap(); // 10 now issued
        let conflicts = ledger.accept_issued(&[10, 11, 12]);
        assert_eq!(conflicts, vec![10, 11]);
        assert_eq!(ledger.available(), &BTreeSet::from([11, 12]));
        assert!(ledger.verify_issued(10));
        ledger.check_invariants().unwrap();
    }

    #[test]
    fn conservation_over_mixed_sequences() {
        let mut ledger = NumberLedger::new();
        let granted: Vec<u64> = (1..=20).collect();
        ledger.accept_issued(&granted);
        let mut closed = BTreeSet::new();
        for step in 0..40u64 {
            match step % 4 {
                0 => {
                    if let Ok(n) = ledger.reserve() {
                        if step % 8 == 0 {
                            ledger.close(n);
                            closed.insert(n);
                        }
                    }
                }
                1 => ledger.recover(step % 20 + 1),
                2 => {
                    if let Ok(n) = ledger.reserve() {
                        ledger.recover(n);
                    }
                }
                _ => {}
            }
            ledger.check_invariants().unwrap();
            // Every granted number is in exactly one of issued / available /
            // closed.
            for &n in &granted {
                let places = ledger.verify_issued(n) as u32
                    + ledger.verify_available(n) as u32
                    + closed.contains(&n) as u32;
                assert_eq!(places, 1, "number {n} tracked {places} times");
            }
        }
    }

    #[test]
    fn request_numbers_strictly_increase() {
        let mut ledger = NumberLedger::new();
        let mut seen = Vec::new();
        for _ in 0..100 {
            seen.push(ledger.increment_request());
        }
        for pair in seen.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn request_floor_never_lowers_the_counter() {
        let mut ledger = NumberLedger::new();
        ledger.observe_request_floor(10);
        assert_eq!(ledger.increment_request(), 11);
        ledger.observe_request_floor(5);
        assert_eq!(ledger.increment_request(), 12);
    }

    #[test]
    fn acknowledged_set_is_pruned_to_window() {
        let mut ledger = NumberLedger::new();
        for r in 1..=200 {
            ledger.add_acknowledged(r);
        }
        assert!(ledger.verify_acknowledged(200));
        assert!(ledger.verify_acknowledged(200 - ACK_WINDOW));
        assert!(!ledger.verify_acknowledged(200 - ACK_WINDOW - 1));
    }

    #[test]
    fn mark_open_requires_an_issued_number() {
        let mut ledger = NumberLedger::new();
        ledger.accept_issued(&[4]);
        assert!(ledger.mark_open(4).is_err());
        let n = ledger.reserve().unwrap();
        ledger.mark_open(n).unwrap();
        assert!(ledger.verify_open(n));
        // Recovery drops the open flag along with the reservation.
        ledger.recover(n);
        assert!(!ledger.verify_open(n));
    }
}
