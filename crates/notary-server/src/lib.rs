use ed25519_dalek::VerifyingKey as PublicKey;
use lazy_static::lazy_static;
use notary_common::{
    short_id, AccountId, BoxHash, Crypto, NotaryError, NoticeKind, Reply, Request, RequestKind,
    RequestNumber, TransactionNumber,
};
use prometheus::{Counter, Gauge, Registry};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub mod network;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref NUMBERS_GRANTED: Counter = Counter::new(
        "transaction_numbers_granted_total",
        "Transaction numbers granted to nyms"
    )
    .unwrap();
    static ref NYMBOX_NOTICES: Gauge =
        Gauge::new("nymbox_notices", "Notices currently held across nymboxes").unwrap();
}

static METRICS_INIT: std::sync::Once = std::sync::Once::new();

pub fn init_metrics() {
    METRICS_INIT.call_once(|| {
        REGISTRY.register(Box::new(NUMBERS_GRANTED.clone())).unwrap();
        REGISTRY.register(Box::new(NYMBOX_NOTICES.clone())).unwrap();
    });
}

/// Per-nym bookkeeping mirroring what the client's session context claims:
/// the request-number floor, the outstanding grants, and the nymbox.
struct NymRecord {
    key: PublicKey,
    last_request: RequestNumber,
    granted: BTreeSet<TransactionNumber>,
    used: BTreeSet<TransactionNumber>,
    nymbox: Vec<notary_common::Notice>,
    box_hash: BoxHash,
    next_notice: u64,
    accounts: HashMap<AccountId, Vec<u8>>,
    /// Request numbers whose replies are still retained for the client;
    /// pruned when the client acknowledges them.
    retained: BTreeSet<RequestNumber>,
}

impl NymRecord {
    fn new(key: PublicKey) -> Self {
        NymRecord {
            key,
            last_request: 0,
            granted: BTreeSet::new(),
            used: BTreeSet::new(),
            nymbox: Vec::new(),
            box_hash: [0u8; 32],
            next_notice: 1,
            accounts: HashMap::new(),
            retained: BTreeSet::new(),
        }
    }

    fn push_notice(&mut self, kind: NoticeKind, body: Vec<u8>) {
        let id = self.next_notice;
        self.next_notice += 1;
        self.nymbox.push(notary_common::Notice { id, kind, body });
        self.box_hash = Crypto::nymbox_hash(&self.nymbox);
        NYMBOX_NOTICES.inc();
    }

    fn clear_notices(&mut self, notice_ids: &[u64]) {
        let before = self.nymbox.len();
        self.nymbox.retain(|n| !notice_ids.contains(&n.id));
        NYMBOX_NOTICES.sub((before - self.nymbox.len()) as f64);
        self.box_hash = Crypto::nymbox_hash(&self.nymbox);
    }

    /// Every carried number must be a granted, unused one; all of them are
    /// consumed together or none at all.
    fn consume_numbers(&mut self, numbers: &[TransactionNumber]) -> Result<(), String> {
        for &number in numbers {
            if self.used.contains(&number) {
                return Err(format!("transaction number {number} already used"));
            }
            if !self.granted.contains(&number) {
                return Err(format!("transaction number {number} was never granted"));
            }
        }
        for &number in numbers {
            self.granted.remove(&number);
            self.used.insert(number);
        }
        Ok(())
    }
}

#[derive(Default)]
struct NotaryState {
    next_number: TransactionNumber,
    nyms: HashMap<notary_common::NymId, NymRecord>,
}

/// The reference notary: authenticates nyms, enforces request-number
/// monotonicity, grants transaction numbers, and notarizes number-bearing
/// requests. Every reply it produces is signed.
pub struct Notary {
    id: notary_common::NotaryId,
    crypto: Crypto,
    state: Arc<Mutex<NotaryState>>,
}

impl Notary {
    pub fn new(seed: &[u8; 32]) -> Result<Self, NotaryError> {
        let crypto = Crypto::from_secret_key(seed)?;
        init_metrics();
        Ok(Notary {
            id: crypto.identity(),
            crypto,
            state: Arc::new(Mutex::new(NotaryState {
                next_number: 1,
                nyms: HashMap::new(),
            })),
        })
    }

    pub fn id(&self) -> notary_common::NotaryId {
        self.id
    }

    pub fn public_key(&self) -> PublicKey {
        self.crypto.public_key()
    }

    pub async fn handle_request(&self, request: Request) -> Reply {
        let mut state = self.state.lock().await;
        let mut reply = self.process(&mut state, request);
        if let Err(e) = self.crypto.sign_reply(&mut reply) {
            warn!("failed to sign reply: {e}");
        }
        reply
    }

    fn process(&self, state: &mut NotaryState, request: Request) -> Reply {
        let request_number = request.request_number;
        if request.notary_id != self.id {
            return fail_reply(request_number, None, "request addressed to another notary");
        }

        if let RequestKind::RegisterNym { verifying_key } = &request.kind {
            return self.register_nym(state, &request, verifying_key);
        }

        // An unknown recipient fails before any sender-side bookkeeping.
        if let RequestKind::SendMessage { recipient } = &request.kind {
            if !state.nyms.contains_key(recipient) {
                return fail_reply(request_number, None, "unknown recipient nym");
            }
        }

        let Some(record) = state.nyms.get_mut(&request.nym_id) else {
            return fail_reply(request_number, None, "unknown nym");
        };
        if Crypto::verify_request(&request, &record.key).is_err() {
            return fail_reply(request_number, Some(record.box_hash), "invalid signature");
        }
        if request_number <= record.last_request {
            let mut reply = fail_reply(
                request_number,
                Some(record.box_hash),
                "stale request number",
            );
            reply.expected_request = Some(record.last_request);
            return reply;
        }
        record.last_request = request_number;

        let mut pruned = Vec::new();
        for acknowledged in &request.acknowledged {
            if record.retained.remove(acknowledged) {
                pruned.push(*acknowledged);
            }
        }

        let mut reply = ok_reply(request_number, record.box_hash);
        match request.kind.clone() {
            RequestKind::GetTransactionNumbers { count } => {
                // The notary-wide counter only moves for accepted requests.
                let count = count.clamp(1, 100) as u64;
                let start = state.next_number;
                state.next_number += count;
                let numbers: Vec<TransactionNumber> = (start..start + count).collect();
                record.granted.extend(numbers.iter().copied());
                match bincode::encode_to_vec(&numbers, bincode::config::standard()) {
                    Ok(body) => record.push_notice(NoticeKind::NumbersGranted, body),
                    Err(e) => warn!("failed to encode grant notice: {e}"),
                }
                NUMBERS_GRANTED.inc_by(count as f64);
                info!(
                    nym = short_id(&request.nym_id),
                    count, "granted transaction numbers"
                );
                reply.new_numbers = numbers;
            }
            RequestKind::GetNymbox => {
                reply.notices = record.nymbox.clone();
            }
            RequestKind::ProcessNymbox { notice_ids } => {
                record.clear_notices(&notice_ids);
            }
            RequestKind::GetAccount { account } => match record.accounts.get(&account) {
                Some(snapshot) => reply.payload = snapshot.clone(),
                None => return fail_reply(request_number, Some(record.box_hash), "unknown account"),
            },
            RequestKind::CreateAccount => {
                if request.numbers.len() != 1 {
                    return fail_reply(
                        request_number,
                        Some(record.box_hash),
                        "account creation takes exactly one number",
                    );
                }
                if let Err(reason) = record.consume_numbers(&request.numbers) {
                    return fail_reply(request_number, Some(record.box_hash), &reason);
                }
                let account = derive_account_id(&request.nym_id, request.numbers[0]);
                record.accounts.insert(account, request.payload.clone());
                push_receipt(record, request_number, &request.numbers);
                reply.payload = account.to_vec();
            }
            RequestKind::Withdrawal { account } => {
                if !record.accounts.contains_key(&account) {
                    return fail_reply(request_number, Some(record.box_hash), "unknown account");
                }
                if request.numbers.len() != 1 {
                    return fail_reply(
                        request_number,
                        Some(record.box_hash),
                        "withdrawal takes exactly one number",
                    );
                }
                if let Err(reason) = record.consume_numbers(&request.numbers) {
                    return fail_reply(request_number, Some(record.box_hash), &reason);
                }
                push_receipt(record, request_number, &request.numbers);
            }
            RequestKind::NotarizeTransaction { account }
            | RequestKind::OpenRecurring { account } => {
                if !record.accounts.contains_key(&account) {
                    return fail_reply(request_number, Some(record.box_hash), "unknown account");
                }
                if request.numbers.len() != 2 {
                    return fail_reply(
                        request_number,
                        Some(record.box_hash),
                        "transaction takes an opening and a closing number",
                    );
                }
                if let Err(reason) = record.consume_numbers(&request.numbers) {
                    return fail_reply(request_number, Some(record.box_hash), &reason);
                }
                push_receipt(record, request_number, &request.numbers);
            }
            RequestKind::SendMessage { .. } => {
                // Delivery happens below, once the sender borrow is released.
            }
            RequestKind::RegisterNym { .. } => unreachable!("handled above"),
        }
        record.retained.insert(request_number);
        reply.pruned = pruned;
        reply.remote_box_hash = Some(record.box_hash);

        if let RequestKind::SendMessage { recipient } = &request.kind {
            if let Some(target) = state.nyms.get_mut(recipient) {
                target.push_notice(NoticeKind::Message, request.payload.clone());
            }
        }
        reply
    }

    fn register_nym(
        &self,
        state: &mut NotaryState,
        request: &Request,
        verifying_key: &[u8],
    ) -> Reply {
        let request_number = request.request_number;
        let key = match Crypto::public_key_from_bytes(verifying_key) {
            Ok(key) => key,
            Err(_) => return fail_reply(request_number, None, "malformed verifying key"),
        };
        if request.nym_id != Crypto::identity_of(&key) {
            return fail_reply(request_number, None, "nym id does not match verifying key");
        }
        if Crypto::verify_request(request, &key).is_err() {
            return fail_reply(request_number, None, "invalid signature");
        }
        let record = state
            .nyms
            .entry(request.nym_id)
            .or_insert_with(|| NymRecord::new(key));
        record.last_request = record.last_request.max(request_number);
        info!(nym = short_id(&request.nym_id), "registered nym");
        ok_reply(request_number, record.box_hash)
    }
}

fn push_receipt(record: &mut NymRecord, request_number: RequestNumber, numbers: &[u64]) {
    match bincode::encode_to_vec(
        &(request_number, numbers.to_vec()),
        bincode::config::standard(),
    ) {
        Ok(body) => record.push_notice(NoticeKind::Receipt, body),
        Err(e) => warn!("failed to encode receipt notice: {e}"),
    }
}

fn derive_account_id(nym_id: &notary_common::NymId, number: TransactionNumber) -> AccountId {
    let mut hasher = Sha256::new();
    hasher.update(nym_id);
    hasher.update(number.to_be_bytes());
    hasher.finalize().into()
}

fn ok_reply(request_number: RequestNumber, box_hash: BoxHash) -> Reply {
    Reply {
        request_number,
        success: true,
        reason: None,
        expected_request: None,
        new_numbers: vec![],
        remote_box_hash: Some(box_hash),
        notices: vec![],
        pruned: vec![],
        payload: vec![],
        signature: vec![],
    }
}

fn fail_reply(request_number: RequestNumber, box_hash: Option<BoxHash>, reason: &str) -> Reply {
    Reply {
        request_number,
        success: false,
        reason: Some(reason.to_string()),
        expected_request: None,
        new_numbers: vec![],
        remote_box_hash: box_hash,
        notices: vec![],
        pruned: vec![],
        payload: vec![],
        signature: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notary_common::Request;

    struct TestNym {
        crypto: Crypto,
        next_request: RequestNumber,
    }

    impl TestNym {
        fn new(seed: u8) -> Self {
            TestNym {
                crypto: Crypto::from_secret_key(&[seed; 32]).unwrap(),
                next_request: 1,
            }
        }

        fn register_kind(&self) -> RequestKind {
            RequestKind::RegisterNym {
                verifying_key: self.crypto.public_key().to_bytes().to_vec(),
            }
        }

        fn request(
            &mut self,
            notary: &Notary,
            kind: RequestKind,
            numbers: Vec<TransactionNumber>,
        ) -> Request {
            let request_number = self.next_request;
            self.next_request += 1;
            let mut request = Request {
                request_number,
                nym_id: self.crypto.identity(),
                notary_id: notary.id(),
                kind,
                numbers,
                acknowledged: vec![],
                local_box_hash: [0u8; 32],
                payload: vec![],
                signature: vec![],
            };
            self.crypto.sign_request(&mut request).unwrap();
            request
        }
    }

    async fn register(notary: &Notary, nym: &mut TestNym) {
        let kind = nym.register_kind();
        let request = nym.request(notary, kind, vec![]);
        let reply = notary.handle_request(request).await;
        assert!(reply.success, "registration failed: {:?}", reply.reason);
    }

    #[tokio::test]
    async fn grants_are_monotonic_and_distinct() {
        let notary = Notary::new(&[1u8; 32]).unwrap();
        let mut nym = TestNym::new(2);
        register(&notary, &mut nym).await;

        let request = nym.request(&notary, RequestKind::GetTransactionNumbers { count: 10 }, vec![]);
        let first = notary.handle_request(request).await;
        assert!(first.success);
        assert_eq!(first.new_numbers.len(), 10);

        let request = nym.request(&notary, RequestKind::GetTransactionNumbers { count: 10 }, vec![]);
        let second = notary.handle_request(request).await;
        assert!(second.success);
        let max_first = *first.new_numbers.iter().max().unwrap();
        let min_second = *second.new_numbers.iter().min().unwrap();
        assert!(min_second > max_first, "second batch must not overlap");
        // Replies carry the current box hash, which changed with the grant
        // notices.
        assert_ne!(second.remote_box_hash.unwrap(), [0u8; 32]);
    }

    #[tokio::test]
    async fn replayed_request_number_is_rejected() {
        let notary = Notary::new(&[1u8; 32]).unwrap();
        let mut nym = TestNym::new(2);
        register(&notary, &mut nym).await;

        let request = nym.request(&notary, RequestKind::GetNymbox, vec![]);
        let replay = request.clone();
        assert!(notary.handle_request(request).await.success);
        let reply = notary.handle_request(replay).await;
        assert!(!reply.success);
        assert!(reply.expected_request.is_some());
    }

    #[tokio::test]
    async fn rejected_grant_requests_burn_no_number_range() {
        let notary = Notary::new(&[1u8; 32]).unwrap();
        let mut nym = TestNym::new(2);
        register(&notary, &mut nym).await;

        let request = nym.request(&notary, RequestKind::GetTransactionNumbers { count: 3 }, vec![]);
        let first = notary.handle_request(request).await;
        assert!(first.success);

        // A replayed grant request is refused before any numbers move.
        nym.next_request -= 1;
        let replay = nym.request(&notary, RequestKind::GetTransactionNumbers { count: 3 }, vec![]);
        assert!(!notary.handle_request(replay).await.success);

        let request = nym.request(&notary, RequestKind::GetTransactionNumbers { count: 3 }, vec![]);
        let second = notary.handle_request(request).await;
        assert!(second.success);
        let end = *first.new_numbers.last().unwrap();
        assert_eq!(second.new_numbers.first().copied(), Some(end + 1));
    }

    #[tokio::test]
    async fn ungranted_number_is_rejected() {
        let notary = Notary::new(&[1u8; 32]).unwrap();
        let mut nym = TestNym::new(2);
        register(&notary, &mut nym).await;

        let request = nym.request(&notary, RequestKind::CreateAccount, vec![999]);
        let reply = notary.handle_request(request).await;
        assert!(!reply.success);
        assert!(reply.reason.unwrap().contains("never granted"));
    }

    #[tokio::test]
    async fn used_number_cannot_be_spent_twice() {
        let notary = Notary::new(&[1u8; 32]).unwrap();
        let mut nym = TestNym::new(2);
        register(&notary, &mut nym).await;

        let request = nym.request(&notary, RequestKind::GetTransactionNumbers { count: 5 }, vec![]);
        let granted = notary.handle_request(request).await.new_numbers;

        let request = nym.request(&notary, RequestKind::CreateAccount, vec![granted[0]]);
        let created = notary.handle_request(request).await;
        assert!(created.success);
        let account: AccountId = created.payload.as_slice().try_into().unwrap();

        let numbers = vec![granted[1], granted[2]];
        let request = nym.request(
            &notary,
            RequestKind::NotarizeTransaction { account },
            numbers.clone(),
        );
        assert!(notary.handle_request(request).await.success);

        let request = nym.request(
            &notary,
            RequestKind::NotarizeTransaction { account },
            vec![granted[1], granted[3]],
        );
        let reply = notary.handle_request(request).await;
        assert!(!reply.success);
        assert!(reply.reason.unwrap().contains("already used"));
    }

    #[tokio::test]
    async fn receipts_land_in_the_nymbox_and_move_the_hash() {
        let notary = Notary::new(&[1u8; 32]).unwrap();
        let mut nym = TestNym::new(2);
        register(&notary, &mut nym).await;

        let request = nym.request(&notary, RequestKind::GetTransactionNumbers { count: 2 }, vec![]);
        let granted = notary.handle_request(request).await;
        let hash_after_grant = granted.remote_box_hash.unwrap();

        let request = nym.request(&notary, RequestKind::CreateAccount, vec![granted.new_numbers[0]]);
        let created = notary.handle_request(request).await;
        assert!(created.success);
        assert_ne!(created.remote_box_hash.unwrap(), hash_after_grant);

        let request = nym.request(&notary, RequestKind::GetNymbox, vec![]);
        let nymbox = notary.handle_request(request).await;
        assert!(nymbox
            .notices
            .iter()
            .any(|n| n.kind == NoticeKind::Receipt));
        assert!(nymbox
            .notices
            .iter()
            .any(|n| n.kind == NoticeKind::NumbersGranted));

        // Clearing the box brings the hash back to the empty digest.
        let ids: Vec<u64> = nymbox.notices.iter().map(|n| n.id).collect();
        let request = nym.request(&notary, RequestKind::ProcessNymbox { notice_ids: ids }, vec![]);
        let cleared = notary.handle_request(request).await;
        assert!(cleared.success);
        assert_eq!(cleared.remote_box_hash.unwrap(), [0u8; 32]);
    }

    #[tokio::test]
    async fn acknowledged_requests_are_pruned() {
        let notary = Notary::new(&[1u8; 32]).unwrap();
        let mut nym = TestNym::new(2);
        register(&notary, &mut nym).await;

        let request = nym.request(&notary, RequestKind::GetNymbox, vec![]);
        let first_rn = request.request_number;
        assert!(notary.handle_request(request).await.success);

        let mut request = nym.request(&notary, RequestKind::GetNymbox, vec![]);
        request.acknowledged = vec![first_rn];
        nym.crypto.sign_request(&mut request).unwrap();
        let reply = notary.handle_request(request).await;
        assert!(reply.success);
        assert_eq!(reply.pruned, vec![first_rn]);
    }

    #[tokio::test]
    async fn tampered_request_is_rejected() {
        let notary = Notary::new(&[1u8; 32]).unwrap();
        let mut nym = TestNym::new(2);
        register(&notary, &mut nym).await;

        let mut request = nym.request(&notary, RequestKind::GetTransactionNumbers { count: 5 }, vec![]);
        request.payload = vec![1, 2, 3];
        let reply = notary.handle_request(request).await;
        assert!(!reply.success);
        assert_eq!(reply.reason.unwrap(), "invalid signature");
    }

    #[tokio::test]
    async fn replies_are_signed_by_the_notary() {
        let notary = Notary::new(&[1u8; 32]).unwrap();
        let mut nym = TestNym::new(2);
        let kind = nym.register_kind();
        let request = nym.request(&notary, kind, vec![]);
        let reply = notary.handle_request(request).await;
        Crypto::verify_reply(&reply, &notary.public_key()).unwrap();
    }
}
