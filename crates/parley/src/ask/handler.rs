//! Drives ask-error chains to a terminal state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_protocol::{AskMessage, CallbackInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{AskUserError, Handled, answers_from};
use crate::error::{ParleyError, ParleyResult};
use crate::router::SinkRouter;

/// Where questions are asked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Console,
    Window,
    Web,
}

impl RunMode {
    /// Whether a question answered out of band parks its continuation.
    pub fn parks_deferred(&self) -> bool {
        matches!(self, Self::Web)
    }
}

/// How a question was answered.
#[derive(Debug, Clone, PartialEq)]
pub enum AskOutcome {
    Answered(Vec<Value>),
    /// Delivered; the answer will arrive later for `callback_id`.
    Deferred { callback_id: String },
}

/// Obtains the answer to one question.
#[async_trait]
pub trait AskUserHandler: Send + Sync {
    async fn ask(&self, question: AskMessage, cancel: &CancellationToken)
    -> ParleyResult<AskOutcome>;
}

/// Asks through the router. Each question gets a callback id so an
/// out-of-band answer can be correlated with it.
pub struct SinkAskHandler {
    router: Arc<SinkRouter>,
    callback_base: Option<String>,
}

impl SinkAskHandler {
    pub fn new(router: Arc<SinkRouter>) -> Self {
        Self {
            router,
            callback_base: None,
        }
    }

    /// Path prefix where answers are posted, e.g. `/callback`.
    pub fn with_callback_base(mut self, base: impl Into<String>) -> Self {
        self.callback_base = Some(base.into());
        self
    }
}

#[async_trait]
impl AskUserHandler for SinkAskHandler {
    async fn ask(
        &self,
        mut question: AskMessage,
        cancel: &CancellationToken,
    ) -> ParleyResult<AskOutcome> {
        let callback = question.callback.get_or_insert_with(|| {
            let id = Uuid::new_v4().to_string();
            CallbackInfo {
                path: self
                    .callback_base
                    .as_ref()
                    .map(|base| format!("{}/{}", base.trim_end_matches('/'), id)),
                id,
            }
        });
        let callback_id = callback.id.clone();

        match self.router.ask(question, cancel).await? {
            Some(answer) => Ok(AskOutcome::Answered(answers_from(answer))),
            None => Ok(AskOutcome::Deferred { callback_id }),
        }
    }
}

/// Seconds a parked continuation waits for its answer by default.
pub const DEFAULT_PENDING_TTL_SECS: u64 = 15 * 60;

/// A continuation waiting for an out-of-band answer.
pub struct PendingAsk {
    pub error: AskUserError,
    pub turns: usize,
    pub parked_at: DateTime<Utc>,
}

impl PendingAsk {
    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.parked_at)
            .to_std()
            .is_ok_and(|age| age >= ttl)
    }
}

/// Parked continuations keyed by callback id. Entries older than the TTL
/// are dropped unanswered.
pub struct PendingAsks {
    pending: DashMap<String, PendingAsk>,
    ttl: Duration,
}

impl Default for PendingAsks {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(DEFAULT_PENDING_TTL_SECS))
    }
}

impl PendingAsks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn park(&self, callback_id: &str, error: AskUserError, turns: usize) {
        self.sweep();
        debug!(callback = %callback_id, key = %error.key, "parking ask continuation");
        self.pending.insert(
            callback_id.to_string(),
            PendingAsk {
                error,
                turns,
                parked_at: Utc::now(),
            },
        );
    }

    /// Remove and return the continuation for `callback_id` unless it expired.
    pub fn take(&self, callback_id: &str) -> Option<PendingAsk> {
        let (_, pending) = self.pending.remove(callback_id)?;
        if pending.is_expired(self.ttl, Utc::now()) {
            debug!(callback = %callback_id, "ask continuation expired");
            return None;
        }
        Some(pending)
    }

    /// Drop expired continuations. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.pending.len();
        self.pending
            .retain(|_, pending| !pending.is_expired(self.ttl, now));
        let dropped = before.saturating_sub(self.pending.len());
        if dropped > 0 {
            info!(dropped, "dropped unanswered ask continuations");
        }
        dropped
    }

    pub fn contains(&self, callback_id: &str) -> bool {
        self.pending.contains_key(callback_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Resolves errors: non-askable errors pass through untouched; ask errors are
/// asked, answered and fed back until the chain ends.
pub struct BaseErrorHandler {
    asker: Arc<dyn AskUserHandler>,
    mode: RunMode,
    max_turns: Option<usize>,
    pending: Arc<PendingAsks>,
}

impl BaseErrorHandler {
    pub fn new(asker: Arc<dyn AskUserHandler>, mode: RunMode) -> Self {
        Self {
            asker,
            mode,
            max_turns: None,
            pending: Arc::new(PendingAsks::new()),
        }
    }

    /// Stop a chain after this many questions.
    pub fn with_max_turns(mut self, max_turns: Option<usize>) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_pending(mut self, pending: Arc<PendingAsks>) -> Self {
        self.pending = pending;
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn pending(&self) -> &Arc<PendingAsks> {
        &self.pending
    }

    /// Resolve `error`.
    ///
    /// Returns `(false, Some(original))` for errors that cannot be asked,
    /// `(continue, None)` when the chain ends, and
    /// `(false, Some(ParleyError::Deferred))` when the question went out and
    /// the continuation was parked for [`resume`](Self::resume).
    pub async fn handle(&self, error: ParleyError, cancel: &CancellationToken) -> Handled {
        self.drive(error, 0, cancel).await
    }

    /// Continue a parked chain with an out-of-band answer.
    pub async fn resume(
        &self,
        callback_id: &str,
        answers: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Handled {
        let Some(pending) = self.pending.take(callback_id) else {
            return (false, Some(ParleyError::UnknownCallback(callback_id.to_string())));
        };
        if cancel.is_cancelled() {
            self.pending.park(callback_id, pending.error, pending.turns);
            return (false, Some(ParleyError::Cancelled));
        }

        info!(callback = %callback_id, turn = pending.turns + 1, "resuming ask continuation");
        match pending.error.invoke_callback(answers).await {
            (cont, None) => (cont, None),
            (_, Some(next)) => self.drive(next, pending.turns + 1, cancel).await,
        }
    }

    async fn drive(&self, error: ParleyError, turns: usize, cancel: &CancellationToken) -> Handled {
        let mut error = error;
        let mut turns = turns;

        loop {
            let ask = match error {
                ParleyError::AskUser(ask) => ask,
                other => return (false, Some(other)),
            };

            if let Some(max) = self.max_turns
                && turns >= max
            {
                warn!(key = %ask.key, turns, "ask chain exceeded turn limit");
                return (false, Some(ParleyError::TooManyTurns(max)));
            }

            let outcome = match self.asker.ask(ask.to_ask(), cancel).await {
                Ok(outcome) => outcome,
                Err(e) => return (false, Some(e)),
            };

            let answers = match outcome {
                AskOutcome::Answered(answers) => answers,
                AskOutcome::Deferred { callback_id } => {
                    if !self.mode.parks_deferred() {
                        return (
                            false,
                            Some(ParleyError::Transport(format!(
                                "no answer to '{}' in {:?} mode",
                                ask.message, self.mode
                            ))),
                        );
                    }
                    self.pending.park(&callback_id, ask, turns);
                    return (false, Some(ParleyError::Deferred { callback_id }));
                }
            };

            if cancel.is_cancelled() {
                return (false, Some(ParleyError::Cancelled));
            }

            turns += 1;
            debug!(key = %ask.key, turn = turns, "invoking ask callback");
            match ask.invoke_callback(answers).await {
                (cont, None) => return (cont, None),
                (_, Some(next)) => error = next,
            }
        }
    }
}
