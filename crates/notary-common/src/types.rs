use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Single-use permission to open one pending transaction, granted by the notary.
pub type TransactionNumber = u64;

/// Per-message sequence number, strictly increasing per (nym, notary) pair.
pub type RequestNumber = u64;

pub type BoxHash = [u8; 32];
pub type NymId = [u8; 32];
pub type NotaryId = [u8; 32];
pub type AccountId = [u8; 32];

/// Short hex form of an id digest, for log lines.
pub fn short_id(id: &[u8; 32]) -> String {
    hex::encode(&id[..8])
}

/// What a client request asks the notary to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum RequestKind {
    RegisterNym { verifying_key: Vec<u8> },
    GetTransactionNumbers { count: u32 },
    GetNymbox,
    ProcessNymbox { notice_ids: Vec<u64> },
    GetAccount { account: AccountId },
    SendMessage { recipient: NymId },
    CreateAccount,
    Withdrawal { account: AccountId },
    NotarizeTransaction { account: AccountId },
    OpenRecurring { account: AccountId },
}

/// One client-to-notary message. The consensus layer supplies the request
/// number, the reserved transaction numbers, the ack set and the box hash;
/// the instrument payload stays opaque.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Request {
    pub request_number: RequestNumber,
    pub nym_id: NymId,
    pub notary_id: NotaryId,
    pub kind: RequestKind,
    pub numbers: Vec<TransactionNumber>,
    pub acknowledged: Vec<RequestNumber>,
    pub local_box_hash: BoxHash,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Signed notary reply, echoing the request number of the message it answers.
#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct Reply {
    pub request_number: RequestNumber,
    pub success: bool,
    pub reason: Option<String>,
    /// On a stale request number, the floor the client must climb above.
    pub expected_request: Option<RequestNumber>,
    pub new_numbers: Vec<TransactionNumber>,
    pub remote_box_hash: Option<BoxHash>,
    pub notices: Vec<Notice>,
    pub pruned: Vec<RequestNumber>,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum NoticeKind {
    /// Body: bincode-encoded `Vec<TransactionNumber>`.
    NumbersGranted,
    /// Body: bincode-encoded `(RequestNumber, Vec<TransactionNumber>)`.
    Receipt,
    /// Body: opaque sender payload.
    Message,
}

/// One nymbox entry held by the notary for a nym.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Notice {
    pub id: u64,
    pub kind: NoticeKind,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub enum Message {
    Request(Request),
    Reply(Reply),
}

/// How many transaction numbers an action category consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberCategory {
    None,
    Basic,
    CreateAccount,
    Full,
}

/// Caller-facing action categories driven through the operation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    SendMessage,
    Withdrawal,
    CreateAccount,
    Transaction,
    RecurringPlan,
}

impl ActionKind {
    pub fn category(&self) -> NumberCategory {
        match self {
            ActionKind::SendMessage => NumberCategory::None,
            ActionKind::Withdrawal => NumberCategory::Basic,
            ActionKind::CreateAccount => NumberCategory::CreateAccount,
            ActionKind::Transaction | ActionKind::RecurringPlan => NumberCategory::Full,
        }
    }

    /// Full transactions reserve an opening and a closing number.
    pub fn numbers_needed(&self) -> usize {
        match self.category() {
            NumberCategory::None => 0,
            NumberCategory::Basic | NumberCategory::CreateAccount => 1,
            NumberCategory::Full => 2,
        }
    }

    pub fn touches_account(&self) -> bool {
        matches!(
            self,
            ActionKind::Withdrawal | ActionKind::Transaction | ActionKind::RecurringPlan
        )
    }

    /// Recurring items keep their numbers issued until the item is closed out.
    pub fn keeps_numbers_open(&self) -> bool {
        matches!(self, ActionKind::RecurringPlan)
    }
}

/// One client-initiated action, resolved by exactly one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub account: Option<AccountId>,
    pub recipient: Option<NymId>,
    #[serde(default)]
    pub payload: Vec<u8>,
}
