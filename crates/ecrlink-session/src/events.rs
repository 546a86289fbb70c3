//! The observable surface of the coordinator.
//!
//! Embedders subscribe to a broadcast channel of [`TerminalEvent`]s before
//! initiating operations, and optionally install a [`PromptHandler`] to take
//! part in user-prompt routing. Event delivery happens on the reader-driven
//! dispatch task; UI embedders marshal to their own thread themselves.

use crate::session::SessionInfo;
use async_trait::async_trait;
use ecrlink_core::{ResultCode, SessionId, TransactionId, TransactionKind};
use ecrlink_link::Command;
use ecrlink_protocol::{DeviceStatus, TransactionResult};
use serde::{Deserialize, Serialize};

pub use ecrlink_core::BonusInfo;

/// A completed transaction as delivered to the embedder: the parsed wire
/// record plus the session context it resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub kind: Option<TransactionKind>,
    pub session_id: Option<SessionId>,
    pub result: TransactionResult,
    pub bonus: Option<BonusInfo>,
}

/// Classification for error notifications on the event surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Communication,
    Timeout,
    SessionConflict,
    Validation,
    Protocol,
}

/// A single typed notification per surfaced error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub kind: ErrorKind,
    pub message: String,

    /// For session conflicts: the offending session.
    pub session: Option<SessionInfo>,
}

impl ErrorNotice {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            session: None,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session: SessionInfo) -> Self {
        self.session = Some(session);
        self
    }
}

/// Everything the coordinator reports to its embedder.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TerminalEvent {
    /// Every status message, in wire order, handled or not.
    StatusChanged {
        phase: char,
        code: ResultCode,
        info: String,
    },

    /// Phase `A`: the terminal assigned the transaction id.
    TransactionInitialized {
        session_id: SessionId,
        transaction_id: TransactionId,
    },

    /// The terminal acknowledged a host command.
    CommandAccepted { command: Command },

    /// Kind-specific completion events.
    PurchaseCompleted(TransactionOutcome),
    RefundCompleted(TransactionOutcome),
    ReversalCompleted(TransactionOutcome),
    RetrieveCompleted(TransactionOutcome),

    /// A result arrived with no session to correlate it to.
    ResultReceived(TransactionOutcome),

    /// Outcome of an abort request.
    AbortResult { aborted: bool, message: String },

    /// The terminal ended the flow on its own.
    TerminalAborted {
        phase: char,
        code: ResultCode,
        info: String,
    },

    /// Bonus-card outcome of a bonus-only interaction.
    BonusResult(BonusInfo),

    /// Device-control query result.
    DeviceStatus(DeviceStatus),

    /// Wakeup message from the terminal.
    Wakeup,

    /// A surfaced error; exactly one notice per error.
    Error(ErrorNotice),
}

/// A prompt the terminal asked the host to route to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub code: ResultCode,
    pub phase: char,
    pub info: String,

    /// True for manual-entry prompts; the answer must carry the input.
    pub needs_input: bool,
}

/// The embedder's answer to a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptAnswer {
    /// Confirmed; carries the entered text for manual-entry prompts.
    Accepted(Option<String>),
    Rejected,
}

/// Policy and presentation hooks for user prompts.
///
/// The defaults match an unattended embedder: confirmation prompts are
/// allowed but nobody is there to answer, manual authorization is denied.
#[async_trait]
pub trait PromptHandler: Send + Sync {
    /// Whether a confirmation-only prompt may be shown at all.
    fn allow_user_prompt(&self, _code: &ResultCode) -> bool {
        true
    }

    /// Whether manual authorization entry is permitted for this code.
    fn allow_manual_authorization(&self, _code: &ResultCode) -> bool {
        false
    }

    /// Present the prompt and collect the answer.
    async fn present(&self, _request: PromptRequest) -> PromptAnswer {
        PromptAnswer::Rejected
    }

    /// Invoked after every routed prompt, whatever the outcome.
    async fn post_process(&self, _request: &PromptRequest, _answer: &PromptAnswer) {}
}

/// The do-nothing policy used when the embedder installs none.
#[derive(Debug, Default)]
pub struct DefaultPromptHandler;

#[async_trait]
impl PromptHandler for DefaultPromptHandler {}
