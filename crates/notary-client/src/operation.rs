use crate::client::NUMBERS_RECOVERED;
use crate::session::SessionContext;
use ed25519_dalek::VerifyingKey as PublicKey;
use notary_common::{
    short_id, Action, Crypto, DeliveryChannel, NotaryError, NoticeKind, Reply, Request,
    RequestKind, RequestNumber, TransactionNumber,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Bound and backoff curve for every retry loop in the pipeline: transport
/// retries and nymbox resync follow the same rule. Delays double per attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.clamp(1, 16) - 1;
        self.initial_delay.saturating_mul(1u32 << shift)
    }
}

/// Terminal result of one operation, resolved exactly once. Internal retries
/// are invisible to the caller except as latency.
#[derive(Debug)]
pub enum Outcome {
    /// `degraded` flags a committed action whose post-execution cache
    /// refreshes failed; the server-side effect stands either way.
    Success { payload: Vec<u8>, degraded: bool },
    Rejected { reason: String },
    Failed(NotaryError),
}

/// Pipeline states, entered strictly in order. `Execute` may fall back to
/// `TransactionNumbers` when a concurrent operation drained the number pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    NymboxPre,
    TransactionNumbers,
    AccountPre,
    Execute,
    AccountPost,
    NymboxPost,
}

enum Transition {
    Next(Step),
    Done,
    Fail(Outcome),
}

/// One client-initiated action driven through the notary pipeline. Holds the
/// single session context it mutates; nothing here is process-global.
pub struct Operation {
    action: Action,
    session: Arc<SessionContext>,
    channel: Arc<dyn DeliveryChannel>,
    crypto: Arc<Crypto>,
    notary_key: PublicKey,
    policy: RetryPolicy,
    batch_size: u32,
    cancel: watch::Receiver<bool>,
    error_count: u32,
    degraded: bool,
    reply_payload: Vec<u8>,
}

impl Operation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        action: Action,
        session: Arc<SessionContext>,
        channel: Arc<dyn DeliveryChannel>,
        crypto: Arc<Crypto>,
        notary_key: PublicKey,
        policy: RetryPolicy,
        batch_size: u32,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Operation {
            action,
            session,
            channel,
            crypto,
            notary_key,
            policy,
            batch_size,
            cancel,
            error_count: 0,
            degraded: false,
            reply_payload: Vec::new(),
        }
    }

    /// Runs the pipeline to its terminal state. Cancellation is honored at
    /// state boundaries only; once a request is in flight the current state
    /// completes so number recovery or closing is never skipped.
    pub async fn run(mut self) -> Outcome {
        if self.action.kind.touches_account() && self.action.account.is_none() {
            return Outcome::Failed(NotaryError::Config(
                "action category requires a target account".to_string(),
            ));
        }
        let mut step = Step::NymboxPre;
        loop {
            if *self.cancel.borrow() {
                info!(
                    nym = short_id(&self.session.nym_id()),
                    ?step,
                    "operation cancelled at state boundary"
                );
                return Outcome::Failed(NotaryError::Cancelled);
            }
            let transition = match step {
                Step::NymboxPre => self.nymbox_pre().await,
                Step::TransactionNumbers => self.transaction_numbers().await,
                Step::AccountPre => self.account_pre().await,
                Step::Execute => self.execute().await,
                Step::AccountPost => self.account_post().await,
                Step::NymboxPost => self.nymbox_post().await,
            };
            match transition {
                Transition::Next(next) => step = next,
                Transition::Done => {
                    return Outcome::Success {
                        payload: std::mem::take(&mut self.reply_payload),
                        degraded: self.degraded,
                    }
                }
                Transition::Fail(outcome) => return outcome,
            }
        }
    }

    /// Resynchronizes the cached nymbox view before anything else depends on
    /// it. Skipped when the hashes already agree.
    async fn nymbox_pre(&mut self) -> Transition {
        if self.session.box_hash_matches() {
            return Transition::Next(Step::TransactionNumbers);
        }
        let mut attempts = 0;
        loop {
            match self.resync_nymbox().await {
                Ok(()) => return Transition::Next(Step::TransactionNumbers),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        return Transition::Fail(Outcome::Failed(NotaryError::RetriesExhausted {
                            stage: "nymbox resync",
                            attempts,
                        }));
                    }
                    self.backoff("nymbox resync", attempts, &e).await;
                }
            }
        }
    }

    /// Tops up `available` until the action category is covered. Nothing is
    /// reserved yet, so failures here need no recovery.
    async fn transaction_numbers(&mut self) -> Transition {
        let needed = self.action.kind.numbers_needed();
        let mut attempts = 0;
        while self.session.available_count() < needed {
            let request = RequestKind::GetTransactionNumbers {
                count: self.batch_size,
            };
            match self.send_request(request, vec![], vec![]).await {
                Ok(reply) if reply.success => {
                    let conflicts = self.session.accept_issued_numbers(&reply.new_numbers);
                    if !conflicts.is_empty() {
                        warn!(?conflicts, "notary double-granted transaction numbers");
                    }
                    if reply.new_numbers.len() == conflicts.len() {
                        return Transition::Fail(Outcome::Failed(NotaryError::Rejected(
                            "notary granted no usable numbers".to_string(),
                        )));
                    }
                }
                Ok(reply) if reply.expected_request.is_some() => {
                    // Dispatch already raised the counter past the server's
                    // floor; the retry goes out with a fresh number.
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        return Transition::Fail(Outcome::Failed(NotaryError::RetriesExhausted {
                            stage: "transaction numbers",
                            attempts,
                        }));
                    }
                    let stale = stale_or_rejected(&reply, "number grant refused");
                    self.backoff("transaction numbers", attempts, &stale).await;
                }
                Ok(reply) => {
                    return Transition::Fail(Outcome::Rejected {
                        reason: reply
                            .reason
                            .unwrap_or_else(|| "number grant refused".to_string()),
                    })
                }
                Err(NotaryError::Transport(e)) => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        return Transition::Fail(Outcome::Failed(NotaryError::RetriesExhausted {
                            stage: "transaction numbers",
                            attempts,
                        }));
                    }
                    self.backoff("transaction numbers", attempts, &NotaryError::Transport(e))
                        .await;
                }
                Err(e) => return Transition::Fail(Outcome::Failed(e)),
            }
        }
        Transition::Next(Step::AccountPre)
    }

    /// Downloads current account state so the action is built against a
    /// known-fresh balance. Skipped for account-independent actions.
    async fn account_pre(&mut self) -> Transition {
        match self.refresh_account("account download").await {
            Ok(()) => Transition::Next(Step::Execute),
            Err(outcome) => Transition::Fail(outcome),
        }
    }

    async fn execute(&mut self) -> Transition {
        let mut attempts = 0u32;
        loop {
            let reserved = match self.reserve_numbers() {
                Ok(numbers) => numbers,
                // A concurrent operation on this pair drained the pool
                // between our top-up and now; go fetch more.
                Err(NotaryError::Exhausted) => {
                    return Transition::Next(Step::TransactionNumbers)
                }
                Err(e) => return Transition::Fail(Outcome::Failed(e)),
            };
            let (request_number, request) = match self.build_request(
                self.execute_kind(),
                reserved.clone(),
                self.action.payload.clone(),
            ) {
                Ok(built) => built,
                Err(e) => {
                    self.recover_all(&reserved);
                    return Transition::Fail(Outcome::Failed(e));
                }
            };
            match self.dispatch(request).await {
                Ok(reply) if reply.success => {
                    if let Err(e) = self.settle_numbers(&reserved) {
                        return Transition::Fail(Outcome::Failed(e));
                    }
                    self.reply_payload = reply.payload;
                    return Transition::Next(Step::AccountPost);
                }
                Ok(reply) if reply.expected_request.is_some() => {
                    // Request counter desync, already resynced by dispatch;
                    // recover and go again with a fresh number.
                    self.recover_all(&reserved);
                    let stale = NotaryError::StaleRequest {
                        got: request_number,
                        expected: reply.expected_request.unwrap_or(request_number),
                    };
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        return Transition::Fail(Outcome::Failed(NotaryError::RetriesExhausted {
                            stage: "execute",
                            attempts,
                        }));
                    }
                    self.backoff("execute", attempts, &stale).await;
                }
                Ok(reply) => {
                    // Definitive rejection: numbers are never left dangling.
                    self.recover_all(&reserved);
                    return Transition::Fail(Outcome::Rejected {
                        reason: reply
                            .reason
                            .unwrap_or_else(|| "request rejected".to_string()),
                    });
                }
                Err(NotaryError::Transport(e)) => {
                    // The server may still have processed the request; its
                    // receipt is the only proof either way.
                    match self.confirm_delivery(request_number).await {
                        Ok(true) => {
                            info!(
                                request_number,
                                "request took effect despite transport failure"
                            );
                            if let Err(e) = self.settle_numbers(&reserved) {
                                return Transition::Fail(Outcome::Failed(e));
                            }
                            // The reply payload is lost; surface that.
                            self.degraded = true;
                            return Transition::Next(Step::AccountPost);
                        }
                        Ok(false) => {
                            // The nymbox held no receipt, so the request
                            // never took effect; rolling back is safe.
                            self.recover_all(&reserved);
                            attempts += 1;
                            if attempts >= self.policy.max_attempts {
                                return Transition::Fail(Outcome::Failed(
                                    NotaryError::RetriesExhausted {
                                        stage: "execute",
                                        attempts,
                                    },
                                ));
                            }
                            self.backoff("execute", attempts, &NotaryError::Transport(e))
                                .await;
                        }
                        Err(probe_error) => {
                            // Delivery is still unknown: re-executing could
                            // apply the action twice, and recovery could hand
                            // a server-side-consumed number back out. The
                            // numbers stay issued and the caller sees the
                            // failure.
                            warn!(request_number, "delivery could not be confirmed");
                            return Transition::Fail(Outcome::Failed(probe_error));
                        }
                    }
                }
                Err(e) => {
                    self.recover_all(&reserved);
                    return Transition::Fail(Outcome::Failed(e));
                }
            }
        }
    }

    /// Re-downloads account state after a mutation. The execute result is
    /// already committed, so failure only degrades the success.
    async fn account_post(&mut self) -> Transition {
        if let Err(outcome) = self.refresh_account("account refresh").await {
            warn!("post-execute account refresh failed: {:?}", outcome);
            self.degraded = true;
        }
        Transition::Next(Step::NymboxPost)
    }

    /// Picks up notices the action itself produced (receipts and the like).
    async fn nymbox_post(&mut self) -> Transition {
        if self.session.box_hash_matches() {
            return Transition::Done;
        }
        let mut attempts = 0;
        loop {
            match self.resync_nymbox().await {
                Ok(()) => return Transition::Done,
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        warn!("post-execute nymbox refresh failed: {e}");
                        self.degraded = true;
                        return Transition::Done;
                    }
                    self.backoff("nymbox refresh", attempts, &e).await;
                }
            }
        }
    }

    /// Downloads the nymbox, replays its notices into the session, asks the
    /// server to clear them, and brings the local hash up to date.
    async fn resync_nymbox(&mut self) -> Result<(), NotaryError> {
        let reply = self.send_request(RequestKind::GetNymbox, vec![], vec![]).await?;
        if !reply.success {
            return Err(stale_or_rejected(&reply, "nymbox refused"));
        }
        self.absorb_notices(&reply.notices);
        let notice_ids: Vec<u64> = reply.notices.iter().map(|n| n.id).collect();
        let served_hash = reply
            .remote_box_hash
            .unwrap_or_else(|| Crypto::nymbox_hash(&reply.notices));
        if notice_ids.is_empty() {
            self.session.set_local_box_hash(served_hash);
        } else {
            let processed = self
                .send_request(RequestKind::ProcessNymbox { notice_ids }, vec![], vec![])
                .await?;
            if !processed.success {
                return Err(stale_or_rejected(&processed, "nymbox processing refused"));
            }
            if let Some(hash) = processed.remote_box_hash {
                self.session.set_local_box_hash(hash);
            }
        }
        if !self.session.box_hash_matches() {
            return Err(NotaryError::BoxMismatch);
        }
        Ok(())
    }

    fn absorb_notices(&self, notices: &[notary_common::Notice]) {
        for notice in notices {
            match notice.kind {
                NoticeKind::NumbersGranted => {
                    match bincode::decode_from_slice::<Vec<TransactionNumber>, _>(
                        &notice.body,
                        bincode::config::standard(),
                    ) {
                        Ok((numbers, _)) => {
                            let conflicts = self.session.accept_issued_numbers(&numbers);
                            if !conflicts.is_empty() {
                                warn!(?conflicts, "granted numbers in nymbox already tracked");
                            }
                        }
                        Err(e) => warn!("undecodable number grant notice: {e}"),
                    }
                }
                // Receipts and messages belong to the instrument layer; the
                // consensus layer only clears them from the box.
                NoticeKind::Receipt | NoticeKind::Message => {
                    info!(notice_id = notice.id, kind = ?notice.kind, "nymbox notice")
                }
            }
        }
    }

    /// Resolves whether an unanswered request was processed, retrying the
    /// nymbox probe under the retry policy. `Err` means delivery is still
    /// unknown after the bound.
    async fn confirm_delivery(
        &mut self,
        request_number: RequestNumber,
    ) -> Result<bool, NotaryError> {
        let mut attempts = 0;
        loop {
            match self.probe_delivered(request_number).await {
                Ok(delivered) => return Ok(delivered),
                Err(e) => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        return Err(NotaryError::RetriesExhausted {
                            stage: "delivery probe",
                            attempts,
                        });
                    }
                    self.backoff("delivery probe", attempts, &e).await;
                }
            }
        }
    }

    /// Asks the server whether a request it never answered was in fact
    /// processed, by looking for its receipt in the nymbox. `Ok(false)` is a
    /// positive statement: the nymbox was seen and held no receipt.
    async fn probe_delivered(&mut self, request_number: RequestNumber) -> Result<bool, NotaryError> {
        let reply = self.send_request(RequestKind::GetNymbox, vec![], vec![]).await?;
        if !reply.success {
            return Err(stale_or_rejected(&reply, "nymbox refused"));
        }
        for notice in &reply.notices {
            if notice.kind != NoticeKind::Receipt {
                continue;
            }
            if let Ok(((receipted, _), _)) = bincode::decode_from_slice::<
                (RequestNumber, Vec<TransactionNumber>),
                _,
            >(&notice.body, bincode::config::standard())
            {
                if receipted == request_number {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn refresh_account(&mut self, stage: &'static str) -> Result<(), Outcome> {
        let account = match self.action.account {
            Some(account) if self.action.kind.touches_account() => account,
            _ => return Ok(()),
        };
        let mut attempts = 0;
        loop {
            match self
                .send_request(RequestKind::GetAccount { account }, vec![], vec![])
                .await
            {
                // The snapshot itself is opaque to the consensus layer; what
                // matters is that it is fresh.
                Ok(reply) if reply.success => return Ok(()),
                Ok(reply) if reply.expected_request.is_some() => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        return Err(Outcome::Failed(NotaryError::RetriesExhausted {
                            stage,
                            attempts,
                        }));
                    }
                    let stale = stale_or_rejected(&reply, "account download refused");
                    self.backoff(stage, attempts, &stale).await;
                }
                Ok(reply) => {
                    return Err(Outcome::Rejected {
                        reason: reply
                            .reason
                            .unwrap_or_else(|| "account download refused".to_string()),
                    })
                }
                Err(NotaryError::Transport(e)) => {
                    attempts += 1;
                    if attempts >= self.policy.max_attempts {
                        return Err(Outcome::Failed(NotaryError::RetriesExhausted {
                            stage,
                            attempts,
                        }));
                    }
                    self.backoff(stage, attempts, &NotaryError::Transport(e)).await;
                }
                Err(e) => return Err(Outcome::Failed(e)),
            }
        }
    }

    fn reserve_numbers(&self) -> Result<Vec<TransactionNumber>, NotaryError> {
        let needed = self.action.kind.numbers_needed();
        let mut reserved = Vec::with_capacity(needed);
        if needed >= 1 {
            reserved.push(self.session.reserve_opening_number()?);
        }
        if needed == 2 {
            match self.session.reserve_closing_number() {
                Ok(number) => reserved.push(number),
                Err(e) => {
                    self.recover_all(&reserved);
                    return Err(e);
                }
            }
        }
        Ok(reserved)
    }

    fn recover_all(&self, reserved: &[TransactionNumber]) {
        for &number in reserved {
            self.session.recover(number);
            NUMBERS_RECOVERED.inc();
        }
    }

    /// Closes one-shot numbers, keeps recurring ones issued and open. Only
    /// called after a verified positive reply.
    fn settle_numbers(&self, reserved: &[TransactionNumber]) -> Result<(), NotaryError> {
        if self.action.kind.keeps_numbers_open() {
            for &number in reserved {
                self.session.mark_open(number)?;
            }
        } else {
            for &number in reserved {
                self.session.close(number);
            }
        }
        self.session.check_invariants()
    }

    fn execute_kind(&self) -> RequestKind {
        let account = self.action.account.unwrap_or([0u8; 32]);
        match self.action.kind {
            notary_common::ActionKind::SendMessage => RequestKind::SendMessage {
                recipient: self.action.recipient.unwrap_or([0u8; 32]),
            },
            notary_common::ActionKind::Withdrawal => RequestKind::Withdrawal { account },
            notary_common::ActionKind::CreateAccount => RequestKind::CreateAccount,
            notary_common::ActionKind::Transaction => {
                RequestKind::NotarizeTransaction { account }
            }
            notary_common::ActionKind::RecurringPlan => RequestKind::OpenRecurring { account },
        }
    }

    fn build_request(
        &self,
        kind: RequestKind,
        numbers: Vec<TransactionNumber>,
        payload: Vec<u8>,
    ) -> Result<(RequestNumber, Request), NotaryError> {
        let request_number = self.session.increment_request();
        let mut request = Request {
            request_number,
            nym_id: self.session.nym_id(),
            notary_id: self.session.notary_id(),
            kind,
            numbers,
            acknowledged: self.session.acknowledged_list(),
            local_box_hash: self.session.local_box_hash(),
            payload,
            signature: Vec::new(),
        };
        self.crypto.sign_request(&mut request)?;
        Ok((request_number, request))
    }

    /// One round trip plus the session bookkeeping every reply implies:
    /// signature check, remote hash update, ack pruning, counter resync.
    async fn dispatch(&self, request: Request) -> Result<Reply, NotaryError> {
        let request_number = request.request_number;
        let reply = self.channel.round_trip(request).await?;
        if reply.request_number != request_number {
            return Err(NotaryError::Transport(format!(
                "reply correlates to request {} instead of {}",
                reply.request_number, request_number
            )));
        }
        // A reply that does not verify proves nothing about server state;
        // treat it like a lost reply.
        Crypto::verify_reply(&reply, &self.notary_key)
            .map_err(|_| NotaryError::Transport("unverifiable reply signature".to_string()))?;
        if let Some(hash) = reply.remote_box_hash {
            self.session.set_remote_box_hash(hash);
        }
        if !reply.pruned.is_empty() {
            self.session.remove_acknowledged_numbers(&reply.pruned);
        }
        if let Some(floor) = reply.expected_request {
            self.session.observe_request_floor(floor);
        }
        if reply.success {
            self.session.add_acknowledged_number(request_number);
        }
        Ok(reply)
    }

    async fn send_request(
        &self,
        kind: RequestKind,
        numbers: Vec<TransactionNumber>,
        payload: Vec<u8>,
    ) -> Result<Reply, NotaryError> {
        let (_, request) = self.build_request(kind, numbers, payload)?;
        self.dispatch(request).await
    }

    async fn backoff(&mut self, stage: &'static str, attempt: u32, error: &NotaryError) {
        self.error_count += 1;
        let delay = self.policy.delay_for(attempt);
        warn!(
            stage,
            attempt,
            error_count = self.error_count,
            "retrying in {delay:?}: {error}"
        );
        tokio::time::sleep(delay).await;
    }
}

/// A failure reply carrying `expected_request` is a counter desync, not a
/// refusal of the request body; the two retry differently.
fn stale_or_rejected(reply: &Reply, refused: &str) -> NotaryError {
    match reply.expected_request {
        Some(expected) => NotaryError::StaleRequest {
            got: reply.request_number,
            expected,
        },
        None => NotaryError::Rejected(
            reply.reason.clone().unwrap_or_else(|| refused.to_string()),
        ),
    }
}
