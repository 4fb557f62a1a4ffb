pub mod channel;
pub mod crypto;
pub mod errors;
pub mod types;

pub use channel::{decode_message, encode_message, send_message, DeliveryChannel};
pub use crypto::Crypto;
pub use errors::NotaryError;
pub use types::{
    short_id, AccountId, Action, ActionKind, BoxHash, Message, NotaryId, Notice, NoticeKind,
    NumberCategory, NymId, Reply, Request, RequestKind, RequestNumber, TransactionNumber,
};
