use crate::operation::{Operation, Outcome, RetryPolicy};
use crate::session::{SessionContext, SessionSnapshot};
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey as PublicKey;
use lazy_static::lazy_static;
use notary_common::{
    short_id, Action, Crypto, DeliveryChannel, NotaryError, NotaryId, Request, RequestKind,
};
use prometheus::{Counter, Registry};
use std::sync::{Arc, Once};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    pub(crate) static ref OPS_STARTED: Counter =
        Counter::new("operations_started_total", "Operations started").unwrap();
    pub(crate) static ref OPS_SUCCEEDED: Counter =
        Counter::new("operations_succeeded_total", "Operations completed successfully").unwrap();
    pub(crate) static ref OPS_REJECTED: Counter =
        Counter::new("operations_rejected_total", "Operations rejected by the notary").unwrap();
    pub(crate) static ref OPS_FAILED: Counter =
        Counter::new("operations_failed_total", "Operations failed terminally").unwrap();
    pub(crate) static ref NUMBERS_RECOVERED: Counter = Counter::new(
        "transaction_numbers_recovered_total",
        "Transaction numbers rolled back to available"
    )
    .unwrap();
}

static METRICS_INIT: Once = Once::new();

pub fn init_metrics() {
    METRICS_INIT.call_once(|| {
        REGISTRY.register(Box::new(OPS_STARTED.clone())).unwrap();
        REGISTRY.register(Box::new(OPS_SUCCEEDED.clone())).unwrap();
        REGISTRY.register(Box::new(OPS_REJECTED.clone())).unwrap();
        REGISTRY.register(Box::new(OPS_FAILED.clone())).unwrap();
        REGISTRY
            .register(Box::new(NUMBERS_RECOVERED.clone()))
            .unwrap();
    });
}

/// Everything the client knows about one notary: how to reach it, how to
/// verify its replies, and the single session context for the pair.
struct NotaryLink {
    channel: Arc<dyn DeliveryChannel>,
    key: PublicKey,
    session: Arc<SessionContext>,
}

/// Handle to one in-flight operation. The outcome resolves exactly once;
/// cancelling takes effect at the next state boundary.
pub struct OperationHandle {
    outcome: oneshot::Receiver<Outcome>,
    cancel: watch::Sender<bool>,
}

impl OperationHandle {
    pub async fn outcome(self) -> Outcome {
        self.outcome
            .await
            .unwrap_or(Outcome::Failed(NotaryError::Cancelled))
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

/// The client nym. Owns one session context per notary and spawns one task
/// per operation; the session's locking serializes number mutations across
/// concurrent operations for the same pair.
pub struct NotaryClient {
    crypto: Arc<Crypto>,
    notaries: DashMap<NotaryId, Arc<NotaryLink>>,
    policy: RetryPolicy,
    batch_size: u32,
}

impl NotaryClient {
    pub fn new(crypto: Crypto, policy: RetryPolicy, batch_size: u32) -> Self {
        init_metrics();
        NotaryClient {
            crypto: Arc::new(crypto),
            notaries: DashMap::new(),
            policy,
            batch_size,
        }
    }

    pub fn nym_id(&self) -> notary_common::NymId {
        self.crypto.identity()
    }

    /// Introduces a notary with a fresh session context for the pair.
    pub fn add_notary(
        &self,
        notary_id: NotaryId,
        key: PublicKey,
        channel: Arc<dyn DeliveryChannel>,
    ) {
        let session = Arc::new(SessionContext::new(self.crypto.identity(), notary_id));
        self.notaries.insert(
            notary_id,
            Arc::new(NotaryLink {
                channel,
                key,
                session,
            }),
        );
    }

    /// Re-attaches a persisted session, replacing the pair's fresh context.
    pub fn adopt_session(&self, snapshot: SessionSnapshot, key: PublicKey, channel: Arc<dyn DeliveryChannel>) {
        let notary_id = snapshot.notary_id;
        self.notaries.insert(
            notary_id,
            Arc::new(NotaryLink {
                channel,
                key,
                session: Arc::new(SessionContext::restore(snapshot)),
            }),
        );
    }

    pub fn session_snapshot(&self, notary_id: &NotaryId) -> Option<SessionSnapshot> {
        self.notaries
            .get(notary_id)
            .map(|link| link.session.snapshot())
    }

    /// First contact with a notary: announces the verifying key so the server
    /// can authenticate every later request from this nym.
    pub async fn register(&self, notary_id: NotaryId) -> Result<(), NotaryError> {
        let link = self
            .notaries
            .get(&notary_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| NotaryError::UnknownSession(short_id(&notary_id)))?;
        let request_number = link.session.increment_request();
        let mut request = Request {
            request_number,
            nym_id: self.crypto.identity(),
            notary_id,
            kind: RequestKind::RegisterNym {
                verifying_key: self.crypto.public_key().to_bytes().to_vec(),
            },
            numbers: vec![],
            acknowledged: vec![],
            local_box_hash: link.session.local_box_hash(),
            payload: vec![],
            signature: vec![],
        };
        self.crypto.sign_request(&mut request)?;
        let reply = link.channel.round_trip(request).await?;
        Crypto::verify_reply(&reply, &link.key)
            .map_err(|_| NotaryError::Transport("unverifiable reply signature".to_string()))?;
        if !reply.success {
            return Err(NotaryError::Rejected(
                reply
                    .reason
                    .unwrap_or_else(|| "registration refused".to_string()),
            ));
        }
        if let Some(hash) = reply.remote_box_hash {
            link.session.set_remote_box_hash(hash);
        }
        info!(
            nym = short_id(&self.crypto.identity()),
            notary = short_id(&notary_id),
            "registered with notary"
        );
        Ok(())
    }

    /// Starts one operation as its own task and returns immediately. All
    /// retries and rollbacks happen inside; the handle resolves to a single
    /// terminal outcome.
    pub fn start(
        &self,
        notary_id: NotaryId,
        action: Action,
    ) -> Result<OperationHandle, NotaryError> {
        let link = self
            .notaries
            .get(&notary_id)
            .map(|l| l.value().clone())
            .ok_or_else(|| NotaryError::UnknownSession(short_id(&notary_id)))?;
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let operation = Operation::new(
            action,
            link.session.clone(),
            link.channel.clone(),
            self.crypto.clone(),
            link.key,
            self.policy,
            self.batch_size,
            cancel_rx,
        );
        OPS_STARTED.inc();
        tokio::spawn(async move {
            let outcome = operation.run().await;
            match &outcome {
                Outcome::Success { .. } => OPS_SUCCEEDED.inc(),
                Outcome::Rejected { reason } => {
                    warn!("operation rejected: {reason}");
                    OPS_REJECTED.inc();
                }
                Outcome::Failed(e) => {
                    warn!("operation failed: {e}");
                    OPS_FAILED.inc();
                }
            }
            let _ = outcome_tx.send(outcome);
        });
        Ok(OperationHandle {
            outcome: outcome_rx,
            cancel: cancel_tx,
        })
    }
}
