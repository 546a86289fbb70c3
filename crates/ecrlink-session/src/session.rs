//! Session model and ledger.
//!
//! A session is one caller-initiated unit of terminal interaction. The
//! ledger is a bounded ring of the most recent sessions: insertion drops the
//! oldest entry beyond capacity, lookups are linear scans, and all access
//! goes through the coordinator's single mutex.

use crate::events::BonusInfo;
use chrono::{DateTime, Local};
use ecrlink_core::{
    Amount, EcrTimestamp, Error, Result, SessionId, TransactionId, TransactionKind,
    constants::SESSION_LEDGER_CAPACITY,
};
use ecrlink_protocol::StatusMessage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Lifecycle states of a session.
///
/// `Completed`, `Aborted`, `TerminalAborted` and `Error` are terminal: a
/// session that reached one of them never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created by a caller operation; the request is not on the wire yet.
    Created,

    /// The terminal accepted the request and drives the card flow.
    Running,

    /// A bonus card interrupted this payment; a continuation session with
    /// `bonus_handled` takes over.
    BonusDetectedAndHalted,

    /// The terminal ended the flow on its own (1xxx/9xxx status).
    TerminalAborted,

    /// Aborted by the host or by prompt policy.
    Aborted,

    /// The terminal delivered a transaction result.
    Completed,

    /// Closed by a protocol failure.
    Error,
}

impl SessionState {
    /// Terminal states are immutable.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::Aborted
                | SessionState::TerminalAborted
                | SessionState::Error
        )
    }

    /// States that block a new session-initiating operation.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Created | SessionState::Running | SessionState::BonusDetectedAndHalted
        )
    }

    /// Check whether a transition to `target` is legal.
    #[must_use]
    pub fn can_transition_to(&self, target: &SessionState) -> bool {
        matches!(
            (self, target),
            (
                SessionState::Created,
                SessionState::Running | SessionState::Aborted | SessionState::Error
            ) | (
                SessionState::Running,
                SessionState::Completed
                    | SessionState::BonusDetectedAndHalted
                    | SessionState::TerminalAborted
                    | SessionState::Aborted
                    | SessionState::Error
            )
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "Created",
            SessionState::Running => "Running",
            SessionState::BonusDetectedAndHalted => "BonusDetectedAndHalted",
            SessionState::TerminalAborted => "TerminalAborted",
            SessionState::Aborted => "Aborted",
            SessionState::Completed => "Completed",
            SessionState::Error => "Error",
        };
        write!(f, "{s}")
    }
}

/// One caller-initiated terminal interaction.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub transaction_id: TransactionId,
    pub original_timestamp: EcrTimestamp,
    pub state: SessionState,
    pub created_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
    pub last_status: Option<StatusMessage>,
    pub error: Option<String>,

    /// Payment only: loyalty-card data collected during the flow.
    pub bonus: Option<BonusInfo>,

    /// Payment only: operator-entered authorization code.
    pub manual_auth_code: Option<String>,

    /// Payment only: true for the continuation issued after a bonus card.
    pub bonus_handled: bool,

    /// Set on a halted payment once its continuation session exists.
    pub continued_by: Option<SessionId>,

    /// Set on a continuation; points at the halted predecessor whose bonus
    /// data enriches the final result.
    pub predecessor: Option<SessionId>,
}

impl Session {
    /// Create a session in the `Created` state.
    #[must_use]
    pub fn new(
        id: SessionId,
        kind: TransactionKind,
        amount: Amount,
        transaction_id: TransactionId,
        original_timestamp: EcrTimestamp,
    ) -> Self {
        Self {
            id,
            kind,
            amount,
            transaction_id,
            original_timestamp,
            state: SessionState::Created,
            created_at: Local::now(),
            completed_at: None,
            last_status: None,
            error: None,
            bonus: None,
            manual_auth_code: None,
            bonus_handled: false,
            continued_by: None,
            predecessor: None,
        }
    }

    /// Apply a state transition, enforcing terminal-state immutability.
    ///
    /// # Errors
    /// Returns `Error::InvalidStateTransition` for transitions the state
    /// machine does not allow.
    pub fn transition_to(&mut self, target: SessionState) -> Result<()> {
        if !self.state.can_transition_to(&target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.state = target;
        if target.is_terminal() {
            self.completed_at = Some(Local::now());
        }
        Ok(())
    }

    /// This session still blocks new session-initiating operations.
    /// A halted payment stops blocking once its continuation exists.
    #[must_use]
    pub fn blocks_new_session(&self) -> bool {
        match self.state {
            SessionState::BonusDetectedAndHalted => self.continued_by.is_none(),
            state => state.is_active(),
        }
    }

    /// Immutable snapshot for events and diagnostics.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            kind: self.kind,
            amount: self.amount,
            transaction_id: self.transaction_id.clone(),
            state: self.state,
            created_at: self.created_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
            bonus: self.bonus.clone(),
            bonus_handled: self.bonus_handled,
        }
    }
}

/// Serializable snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub transaction_id: TransactionId,
    pub state: SessionState,
    pub created_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
    pub error: Option<String>,
    pub bonus: Option<BonusInfo>,
    pub bonus_handled: bool,
}

/// Bounded, ordered collection of recent sessions.
#[derive(Debug)]
pub struct SessionLedger {
    sessions: VecDeque<Session>,
    capacity: usize,
}

impl SessionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(SESSION_LEDGER_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert a session, dropping the oldest beyond capacity.
    pub fn insert(&mut self, session: Session) {
        self.sessions.push_back(session);
        while self.sessions.len() > self.capacity {
            self.sessions.pop_front();
        }
    }

    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| &s.id == id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| &s.id == id)
    }

    /// The session currently blocking new session-initiating operations.
    #[must_use]
    pub fn blocking_session(&self) -> Option<&Session> {
        self.sessions.iter().rev().find(|s| s.blocks_new_session())
    }

    /// The most recent session in the `Running` state.
    pub fn last_running(&mut self) -> Option<&mut Session> {
        self.sessions
            .iter_mut()
            .rev()
            .find(|s| s.state == SessionState::Running)
    }

    /// The most recent session in `Running` or `Created`, the one reader
    /// events correlate to.
    pub fn active_mut(&mut self) -> Option<&mut Session> {
        self.sessions.iter_mut().rev().find(|s| {
            matches!(s.state, SessionState::Running | SessionState::Created)
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshots of all sessions, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(Session::info).collect()
    }
}

impl Default for SessionLedger {
    fn default() -> Self {
        Self::new()
    }
}
