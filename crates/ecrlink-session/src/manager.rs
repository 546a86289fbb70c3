//! The session coordinator.
//!
//! `TerminalManager` owns the protocol engine and the session ledger. Caller
//! operations validate, record a session and hand the framed request to the
//! engine; everything the terminal sends back arrives on the dispatch task,
//! which correlates it to the active session and publishes typed events.
//!
//! The engine is created lazily under a creation lock and released on any
//! communication error; the next operation reopens the port. Public
//! operations may be invoked from any task; event delivery happens on the
//! dispatch task.

use crate::events::{
    BonusInfo, ErrorKind, ErrorNotice, PromptAnswer, PromptHandler, PromptRequest, TerminalEvent,
    TransactionOutcome,
};
use crate::session::{Session, SessionInfo, SessionLedger, SessionState};
use ecrlink_core::{
    Amount, EcrTimestamp, Error, Result, SessionId, TransactionId, TransactionKind,
    constants::{BONUS_DISABLE_DELAY_MS, ENQ, PHASE_INITIALIZED, RETRY_TRANSACTION_CODE},
};
use ecrlink_link::{
    BytePort, Command, LinkConfig, LinkEngine, LinkEvent, SerialBytePort, SerialConfig,
};
use ecrlink_protocol::{
    AbortResult, BonusActivation, CustomerBonus, DeviceQuery, DisplayOption, StatusMessage,
    TransactionRequest, TransactionResult, WireMessage, build_frame, encode,
};
use regex::Regex;
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builds the byte port for the engine; swapped out by tests.
pub type PortFactory = Box<dyn Fn() -> Result<Arc<dyn BytePort>> + Send + Sync>;

fn auth_code_pattern(code: &str) -> &'static Regex {
    static FULL: OnceLock<Regex> = OnceLock::new();
    static LAST4: OnceLock<Regex> = OnceLock::new();
    match code {
        "2007" => LAST4.get_or_init(|| Regex::new(r"^\d{4}$").expect("valid regex")),
        _ => FULL.get_or_init(|| Regex::new(r"^\d{4,6}$").expect("valid regex")),
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub serial: SerialConfig,
    pub link: LinkConfig,

    /// ECR station number carried in transaction requests.
    pub ecr_number: u16,

    /// ISO 4217 numeric currency for transaction requests.
    pub currency: String,

    /// Delay before disabling bonus-card mode after a bonus-only abort.
    pub bonus_disable_delay: Duration,

    /// Broadcast capacity of the event surface.
    pub event_capacity: usize,
}

impl ManagerConfig {
    /// Defaults for the given serial port path.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            serial: SerialConfig::new(path),
            link: LinkConfig::default(),
            ecr_number: 1,
            currency: ecrlink_core::constants::DEFAULT_CURRENCY.to_string(),
            bonus_disable_delay: Duration::from_millis(BONUS_DISABLE_DELAY_MS),
            event_capacity: 64,
        }
    }
}

struct EngineSlot {
    engine: Arc<LinkEngine>,
    dispatcher: JoinHandle<()>,
}

#[derive(Debug, Clone)]
struct LastPayment {
    amount: Amount,
    bonus_handled: bool,
}

struct Shared {
    config: ManagerConfig,
    factory: PortFactory,
    engine: tokio::sync::Mutex<Option<EngineSlot>>,
    sessions: Mutex<SessionLedger>,
    events: broadcast::Sender<TerminalEvent>,
    prompts: Arc<dyn PromptHandler>,
    last_payment: Mutex<Option<LastPayment>>,
}

/// Cloneable handle to the shared coordinator state; the dispatch task and
/// every spawned send own one.
#[derive(Clone)]
struct Coordinator(Arc<Shared>);

impl Deref for Coordinator {
    type Target = Shared;

    fn deref(&self) -> &Shared {
        &self.0
    }
}

/// The session coordinator: the public face of the crate.
pub struct TerminalManager {
    inner: Coordinator,
}

impl TerminalManager {
    /// Connect over the configured serial port.
    ///
    /// # Errors
    /// Fails immediately when the port cannot be opened (unknown or busy
    /// device).
    pub async fn connect(config: ManagerConfig, prompts: Arc<dyn PromptHandler>) -> Result<Self> {
        let serial = config.serial.clone();
        let factory: PortFactory = Box::new(move || {
            let port = SerialBytePort::open(&serial)?;
            Ok(Arc::new(port) as Arc<dyn BytePort>)
        });
        Self::with_port_factory(config, prompts, factory).await
    }

    /// Connect over a caller-supplied byte port factory.
    ///
    /// # Errors
    /// Fails when the factory cannot produce a port.
    pub async fn with_port_factory(
        config: ManagerConfig,
        prompts: Arc<dyn PromptHandler>,
        factory: PortFactory,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Coordinator(Arc::new(Shared {
            config,
            factory,
            engine: tokio::sync::Mutex::new(None),
            sessions: Mutex::new(SessionLedger::new()),
            events,
            prompts,
            last_payment: Mutex::new(None),
        }));
        inner.ensure_engine().await?;
        Ok(Self { inner })
    }

    /// Subscribe to the event surface. Subscribe before initiating
    /// operations; the channel drops events nobody listens to.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.inner.events.subscribe()
    }

    /// Handshake with the terminal (raw ENQ, expects ACK).
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn test_terminal(&self) -> Result<()> {
        let engine = self.inner.ensure_engine().await.map_err(|e| self.inner.surface(e))?;
        self.inner.spawn_send(engine, vec![ENQ], Command::Test, None);
        Ok(())
    }

    /// Ask the terminal to abort the transaction in progress.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn abort_transaction(&self) -> Result<()> {
        self.send_control(encode::abort(), Command::Abort).await
    }

    /// Start a payment. Refused while another session is active; the amount
    /// must be positive.
    ///
    /// # Errors
    /// `Error::Validation` on a non-positive amount, `Error::SessionConflict`
    /// while another session is active. Both are also published on the event
    /// surface.
    pub async fn run_payment(
        &self,
        amount: Amount,
        bonus_handled: bool,
        session_id: Option<SessionId>,
    ) -> Result<SessionId> {
        if amount.is_zero() {
            let err = Error::Validation("payment amount must be greater than zero".to_string());
            return Err(self.inner.surface(err));
        }
        self.inner
            .start_session(
                TransactionKind::Payment,
                amount,
                TransactionId::placeholder(),
                EcrTimestamp::empty(),
                session_id,
                bonus_handled,
            )
            .await
    }

    /// Refund a previously captured amount.
    ///
    /// # Errors
    /// `Error::SessionConflict` while another session is active.
    pub async fn refund(&self, amount: Amount, session_id: Option<SessionId>) -> Result<SessionId> {
        self.inner
            .start_session(
                TransactionKind::Refund,
                amount,
                TransactionId::placeholder(),
                EcrTimestamp::empty(),
                session_id,
                false,
            )
            .await
    }

    /// Reverse an earlier transaction; id and original timestamp verbatim.
    ///
    /// # Errors
    /// `Error::SessionConflict` while another session is active.
    pub async fn reversal(
        &self,
        transaction_id: TransactionId,
        original: EcrTimestamp,
        session_id: Option<SessionId>,
    ) -> Result<SessionId> {
        self.inner
            .start_session(
                TransactionKind::Reversal,
                Amount::zero(),
                transaction_id,
                original,
                session_id,
                false,
            )
            .await
    }

    /// Retrieve the record of an earlier transaction.
    ///
    /// # Errors
    /// `Error::SessionConflict` while another session is active.
    pub async fn retrieve_transaction(
        &self,
        transaction_id: TransactionId,
        original: EcrTimestamp,
    ) -> Result<SessionId> {
        self.inner
            .start_session(
                TransactionKind::Retrieve,
                Amount::zero(),
                transaction_id,
                original,
                None,
                false,
            )
            .await
    }

    /// Retrieve the most recent transaction; the terminal resolves "last".
    ///
    /// # Errors
    /// `Error::SessionConflict` while another session is active.
    pub async fn retrieve_last_transaction(&self) -> Result<SessionId> {
        self.retrieve_transaction(TransactionId::placeholder(), EcrTimestamp::empty())
            .await
    }

    /// Fetch the pending terminal control-system message.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn retrieve_tcs_message(&self) -> Result<()> {
        self.send_control(
            encode::device_control(DeviceQuery::TcsMessage),
            Command::DeviceControl,
        )
        .await
    }

    /// Query terminal status.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn request_terminal_status(&self) -> Result<()> {
        self.send_control(
            encode::device_control(DeviceQuery::Status),
            Command::DeviceControl,
        )
        .await
    }

    /// Query terminal firmware version.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn request_terminal_version(&self) -> Result<()> {
        self.send_control(
            encode::device_control(DeviceQuery::Version),
            Command::DeviceControl,
        )
        .await
    }

    /// Enable bonus-card mode, optionally with automatic replies.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn enable_bonus_card_mode(&self, auto_reply: bool) -> Result<()> {
        let activation = if auto_reply {
            BonusActivation::OnWithAutoReply
        } else {
            BonusActivation::On
        };
        self.send_control(encode::bonus_card_mode(activation), Command::BonusCardMode)
            .await
    }

    /// Disable bonus-card mode.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn disable_bonus_card_mode(&self) -> Result<()> {
        self.send_control(
            encode::bonus_card_mode(BonusActivation::Off),
            Command::BonusCardMode,
        )
        .await
    }

    /// Request customer bonus-card info. The activation byte is sent as
    /// asked; no behavior depends on how the firmware interprets it.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn request_bonus_card_info(&self, stop_active: bool) -> Result<()> {
        self.send_control(
            encode::customer_request(!stop_active),
            Command::CustomerRequest,
        )
        .await
    }

    /// Show two lines on the terminal display.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn display_text(&self, line1: &str, line2: &str, big_font: bool) -> Result<()> {
        let option = if big_font {
            DisplayOption::BigFont
        } else {
            DisplayOption::SmallFont
        };
        self.send_control(encode::display_text(line1, line2, option), Command::DisplayText)
            .await
    }

    /// Clear the terminal display.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn clear_display_text(&self) -> Result<()> {
        self.send_control(encode::clear_display(), Command::DisplayText)
            .await
    }

    /// Enable the auxiliary accept mode.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn enable_auxiliary_mode(&self) -> Result<()> {
        self.send_control(encode::auxiliary_mode(true), Command::AuxiliaryMode)
            .await
    }

    /// Disable the auxiliary accept mode.
    ///
    /// # Errors
    /// Returns a `Communication` error when the port cannot be (re)opened.
    pub async fn disable_auxiliary_mode(&self) -> Result<()> {
        self.send_control(encode::auxiliary_mode(false), Command::AuxiliaryMode)
            .await
    }

    /// Accept a paused transaction by id.
    ///
    /// # Errors
    /// `Error::Validation` for a malformed transaction id.
    pub async fn accept_transaction(&self, transaction_id: &str) -> Result<()> {
        self.accept_or_reject(transaction_id, true).await
    }

    /// Reject a paused transaction by id.
    ///
    /// # Errors
    /// `Error::Validation` for a malformed transaction id.
    pub async fn reject_transaction(&self, transaction_id: &str) -> Result<()> {
        self.accept_or_reject(transaction_id, false).await
    }

    /// Tear down the engine and close the port. The next operation reopens.
    pub async fn disconnect(&self) {
        info!("disconnecting from terminal");
        self.inner.release_engine(true).await;
    }

    /// Snapshots of all sessions in the ledger, oldest first.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.sessions.lock().expect("ledger lock").snapshots()
    }

    /// Snapshot of a single session.
    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<SessionInfo> {
        self.inner
            .sessions
            .lock()
            .expect("ledger lock")
            .get(id)
            .map(Session::info)
    }

    async fn accept_or_reject(&self, transaction_id: &str, accept: bool) -> Result<()> {
        let id = TransactionId::new(transaction_id).map_err(|e| self.inner.surface(e))?;
        self.send_control(
            encode::accept_or_reject(&id, accept),
            Command::AcceptTransaction,
        )
        .await
    }

    async fn send_control(&self, payload: Vec<u8>, command: Command) -> Result<()> {
        let engine = self.inner.ensure_engine().await.map_err(|e| self.inner.surface(e))?;
        self.inner
            .spawn_send(engine, build_frame(&payload), command, None);
        Ok(())
    }
}

impl Coordinator {
    // ------------------------------------------------------------------
    // Engine lifecycle
    // ------------------------------------------------------------------

    /// Get the engine, creating it (and its dispatch task) when absent.
    async fn ensure_engine(&self) -> Result<Arc<LinkEngine>> {
        let mut slot = self.engine.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.engine.is_running() {
                return Ok(Arc::clone(&existing.engine));
            }
            // Reader died without a disconnect making it through; rebuild.
            existing.engine.shutdown();
        }

        let port = (self.factory)()?;
        let (engine, events) = LinkEngine::start(port, self.config.link.clone());
        let engine = Arc::new(engine);
        let dispatcher = tokio::spawn(dispatch_loop(self.clone(), events));
        *slot = Some(EngineSlot {
            engine: Arc::clone(&engine),
            dispatcher,
        });
        debug!("protocol engine created");
        Ok(engine)
    }

    /// Drop the engine; `abort_dispatcher` is false when called from the
    /// dispatch task itself.
    async fn release_engine(&self, abort_dispatcher: bool) {
        if let Some(slot) = self.engine.lock().await.take() {
            slot.engine.shutdown();
            if abort_dispatcher {
                slot.dispatcher.abort();
            }
            debug!("protocol engine released");
        }
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Hand a frame to the engine on a background task; publishes
    /// CommandAccepted or the error, and moves the session accordingly.
    fn spawn_send(
        &self,
        engine: Arc<LinkEngine>,
        frame: Vec<u8>,
        command: Command,
        session: Option<SessionId>,
    ) {
        let inner = self.clone();
        tokio::spawn(async move {
            match engine.send(&frame, command).await {
                Ok(()) => {
                    if let Some(id) = session {
                        inner.mark_running(&id);
                    }
                    inner.publish(TerminalEvent::CommandAccepted { command });
                }
                Err(e) => {
                    if let Some(id) = session {
                        inner.fail_session(&id, &e);
                    }
                    let teardown = matches!(e, Error::Communication(_));
                    inner.surface(e);
                    if teardown {
                        inner.release_engine(false).await;
                    }
                }
            }
        });
    }

    /// Guard, record and send one session-initiating request.
    async fn start_session(
        &self,
        kind: TransactionKind,
        amount: Amount,
        transaction_id: TransactionId,
        original: EcrTimestamp,
        session_id: Option<SessionId>,
        bonus_handled: bool,
    ) -> Result<SessionId> {
        self.guard_no_active_session()?;
        let engine = self.ensure_engine().await.map_err(|e| self.surface(e))?;

        let id = session_id.unwrap_or_else(SessionId::generate);
        let mut session = Session::new(id, kind, amount, transaction_id.clone(), original);
        session.bonus_handled = bonus_handled;
        self.sessions.lock().expect("ledger lock").insert(session);
        if kind == TransactionKind::Payment {
            *self.last_payment.lock().expect("last payment lock") = Some(LastPayment {
                amount,
                bonus_handled,
            });
        }
        info!(%id, %kind, %amount, bonus_handled, "session created");

        let request = self.build_request(kind, amount, transaction_id, original, bonus_handled, None);
        self.spawn_send(
            engine,
            build_frame(&request.encode()),
            Command::Transaction,
            Some(id),
        );
        Ok(id)
    }

    fn build_request(
        &self,
        kind: TransactionKind,
        amount: Amount,
        transaction_id: TransactionId,
        original: EcrTimestamp,
        bonus_handled: bool,
        auth_code: Option<String>,
    ) -> TransactionRequest {
        let mut request = match kind {
            TransactionKind::Payment => {
                TransactionRequest::payment(amount, transaction_id, bonus_handled)
            }
            TransactionKind::Refund => TransactionRequest::refund(amount),
            TransactionKind::Reversal => TransactionRequest::reversal(transaction_id, original),
            TransactionKind::Retrieve => TransactionRequest::retrieve(transaction_id, original),
        };
        request = request
            .with_ecr_number(self.config.ecr_number)
            .with_currency(self.config.currency.clone());
        if let Some(code) = auth_code {
            request = request.with_auth_code(code);
        }
        request
    }

    fn guard_no_active_session(&self) -> Result<()> {
        let ledger = self.sessions.lock().expect("ledger lock");
        if let Some(blocking) = ledger.blocking_session() {
            let info = blocking.info();
            let err = Error::SessionConflict {
                session_id: info.id.to_string(),
                kind: info.kind.to_string(),
                state: info.state.to_string(),
                transaction_id: info.transaction_id.to_string(),
                created_at: info.created_at.to_rfc3339(),
            };
            let notice =
                ErrorNotice::new(ErrorKind::SessionConflict, err.to_string()).with_session(info);
            self.publish(TerminalEvent::Error(notice));
            return Err(err);
        }
        Ok(())
    }

    fn mark_running(&self, id: &SessionId) {
        let mut ledger = self.sessions.lock().expect("ledger lock");
        if let Some(session) = ledger.get_mut(id) {
            if session.state == SessionState::Created {
                let _ = session.transition_to(SessionState::Running);
            }
        }
    }

    fn fail_session(&self, id: &SessionId, error: &Error) {
        let mut ledger = self.sessions.lock().expect("ledger lock");
        if let Some(session) = ledger.get_mut(id) {
            session.error = Some(error.to_string());
            let _ = session.transition_to(SessionState::Error);
        }
    }

    // ------------------------------------------------------------------
    // Event surface
    // ------------------------------------------------------------------

    fn publish(&self, event: TerminalEvent) {
        // A send error only means nobody is subscribed right now.
        let _ = self.events.send(event);
    }

    /// Publish an error on the event surface and hand it back to the caller.
    fn surface(&self, error: Error) -> Error {
        let kind = match &error {
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Communication(_) | Error::Io(_) => ErrorKind::Communication,
            Error::SessionConflict { .. } => ErrorKind::SessionConflict,
            Error::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::Protocol,
        };
        // Conflicts publish their own notice with the offending session.
        if kind != ErrorKind::SessionConflict {
            self.publish(TerminalEvent::Error(ErrorNotice::new(kind, error.to_string())));
        }
        error
    }

    // ------------------------------------------------------------------
    // Inbound path (dispatch task)
    // ------------------------------------------------------------------

    async fn handle_message(&self, message: WireMessage) {
        match message {
            WireMessage::Status(status) => self.handle_status(status).await,
            WireMessage::Result(result) => self.handle_result(*result),
            WireMessage::AbortResult(abort) => self.handle_abort_result(abort),
            WireMessage::DeviceStatus(status) => {
                self.publish(TerminalEvent::DeviceStatus(status));
            }
            WireMessage::CustomerBonus(bonus) => self.handle_customer_bonus(bonus).await,
            WireMessage::VerifySignature(text) => self.handle_verify_signature(text).await,
            WireMessage::Wakeup => self.publish(TerminalEvent::Wakeup),
        }
    }

    async fn handle_status(&self, status: StatusMessage) {
        self.publish(TerminalEvent::StatusChanged {
            phase: status.phase,
            code: status.code.clone(),
            info: status.info.clone(),
        });

        if let Some((session_id, transaction_id)) = self.absorb_status(&status) {
            self.publish(TerminalEvent::TransactionInitialized {
                session_id,
                transaction_id,
            });
        }

        match status.code.as_str() {
            "2001" => self.handle_bonus_found(&status).await,
            "2002" => self.handle_bonus_only(&status),
            "2003" | "2007" => self.route_manual_entry(&status).await,
            "2004" | "2005" | "2006" | "2012" | "2022" => self.route_confirmation(&status).await,
            RETRY_TRANSACTION_CODE => self.route_confirmation(&status).await,
            _ if status.code.is_terminal_abort() => self.handle_terminal_abort(&status),
            _ => {} // informational or unhandled: the status event suffices
        }
    }

    /// Record the status on the active session; in phase `A` lift the
    /// terminal-assigned transaction id. Returns the lift, if any.
    fn absorb_status(&self, status: &StatusMessage) -> Option<(SessionId, TransactionId)> {
        let mut ledger = self.sessions.lock().expect("ledger lock");
        let session = ledger.active_mut()?;
        session.last_status = Some(status.clone());

        if status.phase != PHASE_INITIALIZED
            || !status.code.is_informational()
            || !session.transaction_id.is_placeholder()
        {
            return None;
        }
        let assigned: String = status.info.trim().chars().take(5).collect();
        match TransactionId::new(&assigned) {
            Ok(id) => {
                session.transaction_id = id.clone();
                info!(session = %session.id, transaction = %id, "transaction initialized");
                Some((session.id, id))
            }
            Err(e) => {
                warn!(error = %e, info = %status.info, "unusable transaction id in phase A status");
                None
            }
        }
    }

    /// `2001`: a bonus card interrupted the payment. Halt the session and
    /// restart the same payment with `bonus_handled` set.
    async fn handle_bonus_found(&self, status: &StatusMessage) {
        let restart = {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            match ledger.last_running() {
                Some(session) if session.kind == TransactionKind::Payment => {
                    let bonus = session.bonus.get_or_insert_with(BonusInfo::default);
                    bonus.customer_number = status.info.trim().to_string();
                    bonus.status_code = Some(status.code.as_str().to_string());
                    let handoff = (session.amount, session.transaction_id.clone(), session.id);
                    let _ = session.transition_to(SessionState::BonusDetectedAndHalted);
                    Some(handoff)
                }
                _ => {
                    warn!("bonus-card status without a running payment");
                    None
                }
            }
        };
        if let Some((amount, transaction_id, predecessor)) = restart {
            info!(%predecessor, "bonus card found, restarting payment with bonus handled");
            self.begin_continuation(amount, transaction_id, predecessor).await;
        }
    }

    /// Issue the bonus-handled continuation of a halted payment.
    async fn begin_continuation(
        &self,
        amount: Amount,
        transaction_id: TransactionId,
        predecessor: SessionId,
    ) {
        let engine = match self.ensure_engine().await {
            Ok(engine) => engine,
            Err(e) => {
                self.surface(e);
                return;
            }
        };

        let id = SessionId::generate();
        {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            if let Some(halted) = ledger.get_mut(&predecessor) {
                halted.continued_by = Some(id);
            }
            let mut session = Session::new(
                id,
                TransactionKind::Payment,
                amount,
                transaction_id.clone(),
                EcrTimestamp::empty(),
            );
            session.bonus_handled = true;
            session.predecessor = Some(predecessor);
            ledger.insert(session);
        }
        *self.last_payment.lock().expect("last payment lock") = Some(LastPayment {
            amount,
            bonus_handled: true,
        });

        let request = self.build_request(
            TransactionKind::Payment,
            amount,
            transaction_id,
            EcrTimestamp::empty(),
            true,
            None,
        );
        self.spawn_send(
            engine,
            build_frame(&request.encode()),
            Command::Transaction,
            Some(id),
        );
    }

    /// `2002`: bonus card only, no payment. Abort the session, report the
    /// bonus, and disable bonus mode after a short delay.
    fn handle_bonus_only(&self, status: &StatusMessage) {
        let bonus = {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            match ledger.last_running() {
                Some(session) => {
                    let bonus = session.bonus.get_or_insert_with(BonusInfo::default);
                    bonus.customer_number = status.info.trim().to_string();
                    bonus.status_code = Some(status.code.as_str().to_string());
                    let bonus = bonus.clone();
                    let _ = session.transition_to(SessionState::Aborted);
                    bonus
                }
                None => BonusInfo {
                    customer_number: status.info.trim().to_string(),
                    status_code: Some(status.code.as_str().to_string()),
                    ..BonusInfo::default()
                },
            }
        };

        let inner = self.clone();
        let delay = self.config.bonus_disable_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.send_bonus_mode_off().await;
        });

        self.publish(TerminalEvent::BonusResult(bonus));
        self.publish(TerminalEvent::TerminalAborted {
            phase: status.phase,
            code: status.code.clone(),
            info: status.info.clone(),
        });
    }

    async fn send_bonus_mode_off(&self) {
        match self.ensure_engine().await {
            Ok(engine) => {
                let frame = build_frame(&encode::bonus_card_mode(BonusActivation::Off));
                self.spawn_send(engine, frame, Command::BonusCardMode, None);
            }
            Err(e) => {
                self.surface(e);
            }
        }
    }

    fn handle_terminal_abort(&self, status: &StatusMessage) {
        {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            if let Some(session) = ledger.last_running() {
                let _ = session.transition_to(SessionState::TerminalAborted);
            }
        }
        self.publish(TerminalEvent::TerminalAborted {
            phase: status.phase,
            code: status.code.clone(),
            info: status.info.clone(),
        });
    }

    /// Manual-entry prompts (`2003` auth code, `2007` last four digits).
    async fn route_manual_entry(&self, status: &StatusMessage) {
        let request = PromptRequest {
            code: status.code.clone(),
            phase: status.phase,
            info: status.info.clone(),
            needs_input: true,
        };
        let answer = if self.prompts.allow_manual_authorization(&status.code) {
            self.prompts.present(request.clone()).await
        } else {
            debug!(code = %status.code, "manual authorization denied by policy");
            PromptAnswer::Rejected
        };

        let valid_input = match &answer {
            PromptAnswer::Accepted(Some(input))
                if auth_code_pattern(status.code.as_str()).is_match(input) =>
            {
                Some(input.clone())
            }
            _ => None,
        };
        match valid_input {
            Some(input) if status.code.as_str() == "2003" => {
                self.resend_payment_with_auth(input).await;
            }
            Some(_) => self.rerun_last_payment().await,
            None => self.send_abort().await,
        }
        self.prompts.post_process(&request, &answer).await;
    }

    /// Confirmation-only prompts (`2004`..`2022`, synthetic retry).
    async fn route_confirmation(&self, status: &StatusMessage) {
        let request = PromptRequest {
            code: status.code.clone(),
            phase: status.phase,
            info: status.info.clone(),
            needs_input: false,
        };
        let answer = if self.prompts.allow_user_prompt(&status.code) {
            self.prompts.present(request.clone()).await
        } else {
            debug!(code = %status.code, "user prompt denied by policy");
            PromptAnswer::Rejected
        };

        if status.code.as_str() == "2022" {
            let accepted = matches!(answer, PromptAnswer::Accepted(_));
            self.answer_paused_transaction(status, accepted).await;
        } else {
            match answer {
                PromptAnswer::Accepted(_) => self.rerun_last_payment().await,
                PromptAnswer::Rejected => self.send_abort().await,
            }
        }
        self.prompts.post_process(&request, &answer).await;
    }

    /// `2022`: accept or reject the paused transaction on the current (or
    /// info-carried) transaction id.
    async fn answer_paused_transaction(&self, status: &StatusMessage, accept: bool) {
        let transaction_id = {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            ledger
                .last_running()
                .map(|s| s.transaction_id.clone())
                .filter(|id| !id.is_placeholder())
        };
        let transaction_id = transaction_id.or_else(|| {
            let parsed: String = status.info.trim().chars().take(5).collect();
            TransactionId::new(&parsed).ok()
        });

        let Some(id) = transaction_id else {
            warn!("2022 prompt without a resolvable transaction id, aborting");
            self.send_abort().await;
            return;
        };
        match self.ensure_engine().await {
            Ok(engine) => {
                let frame = build_frame(&encode::accept_or_reject(&id, accept));
                self.spawn_send(engine, frame, Command::AcceptTransaction, None);
            }
            Err(e) => {
                self.surface(e);
            }
        }
    }

    /// `2003` accepted: re-send the current payment with the entered
    /// authorization code; the session keeps running.
    async fn resend_payment_with_auth(&self, auth_code: String) {
        let current = {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            ledger.last_running().map(|session| {
                session.manual_auth_code = Some(auth_code.clone());
                (session.amount, session.transaction_id.clone(), session.bonus_handled)
            })
        };
        let Some((amount, transaction_id, bonus_handled)) = current else {
            warn!("manual authorization without a running payment, aborting");
            self.send_abort().await;
            return;
        };
        match self.ensure_engine().await {
            Ok(engine) => {
                let request = self.build_request(
                    TransactionKind::Payment,
                    amount,
                    transaction_id,
                    EcrTimestamp::empty(),
                    bonus_handled,
                    Some(auth_code),
                );
                self.spawn_send(
                    engine,
                    build_frame(&request.encode()),
                    Command::Transaction,
                    None,
                );
            }
            Err(e) => {
                self.surface(e);
            }
        }
    }

    /// Close the current session and issue the last payment again.
    async fn rerun_last_payment(&self) {
        let params = self.last_payment.lock().expect("last payment lock").clone();
        {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            if let Some(session) = ledger.last_running() {
                let _ = session.transition_to(SessionState::Aborted);
            }
        }
        let Some(params) = params else {
            warn!("no previous payment to rerun, aborting");
            self.send_abort().await;
            return;
        };

        let engine = match self.ensure_engine().await {
            Ok(engine) => engine,
            Err(e) => {
                self.surface(e);
                return;
            }
        };
        let id = SessionId::generate();
        {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            let mut session = Session::new(
                id,
                TransactionKind::Payment,
                params.amount,
                TransactionId::placeholder(),
                EcrTimestamp::empty(),
            );
            session.bonus_handled = params.bonus_handled;
            ledger.insert(session);
        }
        info!(%id, "rerunning last payment");
        let request = self.build_request(
            TransactionKind::Payment,
            params.amount,
            TransactionId::placeholder(),
            EcrTimestamp::empty(),
            params.bonus_handled,
            None,
        );
        self.spawn_send(
            engine,
            build_frame(&request.encode()),
            Command::Transaction,
            Some(id),
        );
    }

    async fn send_abort(&self) {
        match self.ensure_engine().await {
            Ok(engine) => {
                self.spawn_send(engine, build_frame(&encode::abort()), Command::Abort, None);
            }
            Err(e) => {
                self.surface(e);
            }
        }
    }

    /// A transaction result closes the active session.
    fn handle_result(&self, result: TransactionResult) {
        let context = {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            let active = ledger.last_running().map(|session| {
                session.transaction_id = result.transaction_id.clone();
                let _ = session.transition_to(SessionState::Completed);
                (
                    session.id,
                    session.kind,
                    session.bonus_handled,
                    session.predecessor,
                    session.bonus.clone(),
                )
            });
            active.map(|(id, kind, bonus_handled, predecessor, own_bonus)| {
                let bonus = if bonus_handled {
                    // Bonus data lives on the halted predecessor payment.
                    predecessor
                        .and_then(|p| ledger.get(&p))
                        .filter(|p| {
                            p.state == SessionState::BonusDetectedAndHalted
                                && p.kind == TransactionKind::Payment
                        })
                        .and_then(|p| p.bonus.clone())
                        .or(own_bonus)
                } else {
                    own_bonus
                };
                (id, kind, bonus)
            })
        };

        match context {
            Some((session_id, kind, bonus)) => {
                info!(%session_id, %kind, amount = %result.amount, "transaction completed");
                let outcome = TransactionOutcome {
                    kind: Some(kind),
                    session_id: Some(session_id),
                    result,
                    bonus,
                };
                let event = match kind {
                    TransactionKind::Payment => TerminalEvent::PurchaseCompleted(outcome),
                    TransactionKind::Refund => TerminalEvent::RefundCompleted(outcome),
                    TransactionKind::Reversal => TerminalEvent::ReversalCompleted(outcome),
                    TransactionKind::Retrieve => TerminalEvent::RetrieveCompleted(outcome),
                };
                self.publish(event);
            }
            None => {
                debug!("transaction result without an active session");
                self.publish(TerminalEvent::ResultReceived(TransactionOutcome {
                    kind: None,
                    session_id: None,
                    result,
                    bonus: None,
                }));
            }
        }
    }

    fn handle_abort_result(&self, abort: AbortResult) {
        if abort.aborted {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            if let Some(session) = ledger.last_running() {
                let _ = session.transition_to(SessionState::Aborted);
            }
        }
        let message = if abort.aborted {
            "Transaction aborted".to_string()
        } else {
            format!("Transaction was not aborted (code {})", abort.code)
        };
        self.publish(TerminalEvent::AbortResult {
            aborted: abort.aborted,
            message,
        });
    }

    /// `D` result: bonus data for the running payment, or an unsolicited
    /// read that turns bonus mode back off.
    async fn handle_customer_bonus(&self, bonus: CustomerBonus) {
        let absorbed = {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            match ledger.last_running() {
                Some(session) if session.kind == TransactionKind::Payment => {
                    let info = session.bonus.get_or_insert_with(BonusInfo::default);
                    info.customer_number = bonus.customer_number.clone();
                    info.member_class = bonus.member_class.clone();
                    info.status_code = Some(bonus.status.to_string());
                    true
                }
                _ => false,
            }
        };
        if !absorbed {
            debug!("customer bonus without a running payment, disabling bonus mode");
            self.send_bonus_mode_off().await;
        }
    }

    /// `F` message: surfaced as the synthetic retry prompt.
    async fn handle_verify_signature(&self, text: String) {
        let status = StatusMessage {
            phase: 'F',
            code: ecrlink_core::ResultCode::new(RETRY_TRANSACTION_CODE).expect("valid code"),
            info: text,
        };
        self.route_confirmation(&status).await;
    }

    async fn handle_disconnect(&self, reason: String) {
        warn!(%reason, "terminal link lost");
        {
            let mut ledger = self.sessions.lock().expect("ledger lock");
            if let Some(session) = ledger.last_running() {
                session.error = Some(reason.clone());
                let _ = session.transition_to(SessionState::Error);
            }
        }
        self.publish(TerminalEvent::Error(ErrorNotice::new(
            ErrorKind::Communication,
            format!("terminal link lost: {reason}"),
        )));
        self.release_engine(false).await;
    }
}

fn dispatch_loop(
    inner: Coordinator,
    mut events: mpsc::Receiver<LinkEvent>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Message(message) => inner.handle_message(message).await,
                LinkEvent::Disconnected(reason) => {
                    inner.handle_disconnect(reason).await;
                    break;
                }
            }
        }
        debug!("dispatch loop finished");
    })
}
